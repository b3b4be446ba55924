pub mod client;
pub mod types;

pub use client::{ClashClient, PluginVersion, ServerStatus};
pub use types::*;
