//! Previewgate - per-pull-request preview environments behind one gateway
//!
//! This library provides a webhook-driven preview gateway that:
//! - Starts a container for each opened pull request and removes it on close
//! - Records every running preview in a durable registry keyed by hostname
//! - Routes HTTP traffic by Host header to the matching preview container
//! - Uses connection pooling for both the registry store and the backends

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod testing;
pub mod webhooks;
