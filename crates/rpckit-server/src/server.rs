//! Server-side components of an `rpckit` gRPC service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration.
//! - [`telemetry`] - Logging, tracing and metrics initialization.
//! - [`admission`] - Concurrency admission control.
//! - [`chain`] and [`stages`] - The interceptor pipeline every call passes
//!   through.
//! - [`layer`] - Tower adapter running a chain in front of tonic's router,
//!   plus handler access to the call's identity.
//! - [`tls`] - TLS credential bundle.
//! - [`bootstrap`] - Server lifecycle from configuration to shutdown.
//! - [`health`] - Standalone health reporting endpoint.

pub mod admission;
pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod health;
pub mod layer;
pub mod stages;
pub mod telemetry;
pub mod tls;
