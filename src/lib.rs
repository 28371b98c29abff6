pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod infra;
pub mod logging;
pub mod push;
pub mod server;

pub use config::{PushConfig, ServerConfig};
pub use error::{Result, ServerError};
pub use push::{CallerContext, DispatchHandler, DispatchOutcome, NotificationRequest};
pub use server::PushServer;
