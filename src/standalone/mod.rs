//! The MCP-facing outer layer: the gateway server handler and the
//! configuration-file watcher that feeds it.

pub mod config_watch;
pub mod server;
