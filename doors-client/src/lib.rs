//! Doors client host: drives the core over HTTP with tokio and reqwest.

pub mod config;
pub mod engine;
pub mod hook;
pub mod logging;
pub mod page;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use engine::{Engine, Snapshot};
pub use hook::{HookError, HookHandle, HookReply, HookRequest, HookResult, TriggerEvent};
pub use page::Page;
pub use transport::{HookBody, HttpTransport, Transport, TransportError};
