//! Monitoring and control client for Clash/Mihomo cores, reached either
//! through the core's external controller or through a router's LuCI RPC.

pub mod clash;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logs;
pub mod monitor;
pub mod plugin;
pub mod rate;
pub mod restart;
pub mod service_log;
pub mod transport;

pub use clash::ClashClient;
pub use error::{AuthError, ControlError, StreamError, TimeoutError, TransportError};
pub use transport::{Credential, HttpTransport, ServerEndpoint, Transport, TrustPolicy};
