// Shared library for the dataset model, automation driver and ledger client.

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod errors;
pub mod retry;
pub mod telemetry;
