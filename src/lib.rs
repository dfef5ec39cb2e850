// Transparent authenticating reverse proxy for Speedport-class router web
// interfaces — library crate root.

pub mod auth;
pub mod cache;
pub mod config;
pub mod server;
