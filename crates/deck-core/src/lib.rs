pub mod config;
pub mod dispatch;
pub mod exec;
pub mod model;
pub mod protocol;

pub use config::{ConfigError, ConfigStore, ServerSettings};
pub use dispatch::Dispatcher;
pub use exec::{ExecError, Executor, SystemExecutor};
pub use model::{Command, CommandKind, Layout, Snapshot};
pub use protocol::{ProtocolError, Request, Response};
