//! Infrastructure layer for the server.
//!
//! Contains the adapters the session drives: the client-facing server, the
//! primary client wrapping the local screen, and configuration storage.

pub mod primary_client;
pub mod server;
pub mod storage;
