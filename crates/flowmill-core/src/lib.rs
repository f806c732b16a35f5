pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use definition::{Edge, Node, NodeKind, ProcessDefinition, ProcessGraph};
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use types::*;
