//! Infrastructure layer of the client.
//!
//! **Dependency rule**: this layer may depend on `kvm_core`, but MUST NOT
//! import the `application` layer.
//!
//! # Sub-modules
//!
//! - **`client`** – One connection to the server: resolve, connect through
//!   the socket multiplexer, time out, and report the outcome as events.
//!
//! - **`resolver`** – The [`AddressResolver`](resolver::AddressResolver)
//!   seam between the client and DNS.

pub mod client;
pub mod resolver;
