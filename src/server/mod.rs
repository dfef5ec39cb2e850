// HTTP front — inbound listener and the proxy request handler.

pub mod handler;
