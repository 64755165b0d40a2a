//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML server configuration, writes it
//! back, and answers questions about it (which screen names are known, where
//! to listen).  A missing file is not an error; the defaults describe a
//! single-screen server listening on every interface.

pub mod config;
