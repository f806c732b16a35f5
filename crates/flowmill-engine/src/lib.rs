pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod expr;
pub mod gateway;
pub mod handlers;
pub mod lifecycle;
pub mod locks;
pub mod notify;
pub mod overdue;
pub mod queue;
pub mod retry;
pub mod tasks;
pub mod template;

pub use engine::{Engine, EngineBuilder};
pub use handlers::HandlerRegistry;
pub use notify::{Notifier, TracingNotifier};
pub use overdue::OverdueMonitor;
pub use queue::{WorkItem, WorkStep};
