pub mod windowed;

pub use windowed::{CacheStats, RangeSource, WindowedCache};
