pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod presence;
pub mod server;
pub mod ws;

pub use config::GatewayConfig;
pub use server::{serve, shutdown_signal, Gateway};
