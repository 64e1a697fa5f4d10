#![doc = include_str!("../README.md")]

pub mod server;

pub use server::{
    bootstrap::{
        Configured, Listening, Unconfigured, run_grpc_server, run_grpc_server_with_health,
        trap_signals,
    },
    config::{CliArgs, ServerConfig},
    error::StartupError,
    health::HealthEndpoint,
    layer::{call_tags, tenant_identity},
};
