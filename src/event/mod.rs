pub mod change;
pub mod feed;

pub use change::*;
pub use feed::*;
