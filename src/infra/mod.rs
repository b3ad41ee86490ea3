//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod socket;
pub mod telemetry;
