pub mod auth;
pub mod client;
pub mod config;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session_handler;
pub mod state;
pub mod stats;
pub mod store;
pub mod sweep;
pub mod transport;
