//! Application layer of the client.
//!
//! - **`client_session`** – The connect/retry state machine: opens the
//!   secondary screen once, walks the resolved server addresses, and decides
//!   after each failure whether to try the next address, retry later, or
//!   give up.

pub mod client_session;
