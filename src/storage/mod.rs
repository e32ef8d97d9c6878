pub mod definition;
pub mod snapshot;

pub use definition::ContentSetDefinition;
pub use snapshot::DefinitionStore;
