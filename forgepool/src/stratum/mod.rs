//! Stratum v1 server: listener, per-connection sessions, and the policy
//! helpers they lean on.

pub mod compat;
pub mod messages;
pub mod server;
pub mod session;
pub mod transport;
pub mod vardiff;

pub use server::{Registry, StratumServer};
