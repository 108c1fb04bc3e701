//! Alibaba Cloud provider for Hemmer.
//!
//! The provider maps declarative resource definitions onto Alibaba Cloud's
//! HTTP APIs and reconciles tracked state against the live backend. It runs
//! as a subprocess of the host and speaks the `hemmer.provider.v1` gRPC
//! protocol.
//!
//! # Layout
//!
//! - [`server`]: the [`ProviderService`] trait and the gRPC server with the
//!   handshake protocol
//! - [`provider`]: [`AlicloudProvider`], which dispatches to the registered
//!   resources and data sources
//! - [`resources`] / [`data_sources`]: one module per managed type
//! - [`services`]: typed helpers over each product's API
//! - [`client`]: request shaping, ACS3 signing and the HTTP transport
//! - [`retry`] / [`wait`]: retry loops and state waiters
//! - [`schema`], [`validation`], [`diff`]: schema declarations and planning
//!
//! # Handshake Protocol
//!
//! On start the provider prints one line to stdout:
//!
//! ```text
//! HEMMER_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! Format: `HEMMER_PROVIDER|<protocol_version>|<address>`. Logs go to stderr.
//!
//! # Resources
//!
//! - `alicloud_instance`
//! - `alicloud_log_saved_search`
//! - `alicloud_rds_clone_db_instance`
//! - `alicloud_fc_service`, `alicloud_fc_function`, `alicloud_fc_alias`
//!
//! # Data Sources
//!
//! - `alicloud_ga_custom_routing_endpoint_traffic_policies`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod data_sources;
pub mod diff;
pub mod error;
pub mod logging;
pub mod provider;
pub mod resources;
pub mod retry;
pub mod schema;
pub mod server;
pub mod services;
pub mod testing;
pub mod types;
pub mod validation;
pub mod wait;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

pub use client::{AlicloudClient, ApiError, Product};
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::AlicloudProvider;
pub use schema::ProviderSchema;
pub use server::{
    serve, serve_on, serve_on_with_options, serve_with_options, ProviderService, ServeOptions,
};
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities,
    HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
pub use validation::{is_valid, validate};

pub use async_trait::async_trait;
