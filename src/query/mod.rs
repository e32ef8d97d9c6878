pub mod filter;
pub mod matcher;
pub mod sort;

pub use filter::*;
pub use matcher::*;
pub use sort::*;
