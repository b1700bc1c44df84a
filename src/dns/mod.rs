//! Authoritative DNS responder
//!
//! Serves the configured zone over UDP and TCP, answering address
//! queries with samples of recently-verified peers from the address
//! table.

pub mod handler;
pub mod message;
pub mod server;

pub use handler::DnsHandler;
pub use server::DnsServer;
