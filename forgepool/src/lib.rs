//! forgepool: a solo Stratum v1 mining pool.
//!
//! The crate turns upstream block templates into mining jobs, distributes
//! them to connected miners over line-delimited JSON, validates proof-of-work
//! submissions at the byte level, and submits qualifying shares upstream as
//! candidate blocks.

pub mod api;
pub mod coinbase;
pub mod config;
pub mod encoding;
pub mod error;
pub mod job;
pub mod merkle;
pub mod rpc;
pub mod stats;
pub mod stratum;
pub mod target;
pub mod template;
pub mod tracing;

pub use error::{Error, Result};
