pub mod id;
pub mod item;
pub mod partition;

pub use id::*;
pub use item::*;
pub use partition::*;
