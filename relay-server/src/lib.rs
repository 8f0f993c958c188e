//! Durable conversation relay.
//!
//! Conversations are append-only logs in a sequenced store. Clients read
//! history by cursor, reconnect without gaps, and receive generated replies
//! token by token over Server-Sent Events.

pub mod app_state;
pub mod handlers;
pub mod http;
pub mod log_store;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod services;
mod tracer;
