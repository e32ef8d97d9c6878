#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod event;
pub mod query;
pub mod stats;
pub mod storage;

pub use config::EngineConfig;
pub use engine::{MergeDiffEngine, SetEngine, UpdateMode};
