//! Listener bootstrap for the orders RPC server.
//!
//! [`OrdersServer`] owns a bind address and hands a listening socket to the
//! `orders-rpc` runtime. No services are registered, so every call is
//! answered with `Unimplemented`.

pub mod bootstrap;
pub mod cli;

pub use bootstrap::{OrdersServer, StartupLog, TracingStartupLog};
