//! HTTP and SSE front door for a stdio JSON-RPC engine.

pub mod cli;
pub mod router;
