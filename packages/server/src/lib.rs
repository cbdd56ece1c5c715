// Record Dispatch Service - API Core
//
// HTTP front end for courier: accepts record submissions, dispatches them over
// the configured bus, and answers once the downstream processor acknowledges.
//
// The bus is NATS when NATS_URL is set, otherwise an in-process broker with
// an embedded audit processor.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
