pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::Context;
pub use error::{Result, TaskError, TaskErrorKind, VendflowError};
pub use event::EventBus;
pub use traits::{PersistenceSink, TaskExecutor};
pub use types::*;
