//! Plumbing shared by the finance services: configuration loading, the
//! common error type, HTTP middleware and tracing setup.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
