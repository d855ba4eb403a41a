//! # POS Connectors Library
//!
//! Resilience layer between a tax platform and the Square, Shopify and Clover point-of-sale
//! APIs: rate-limited adapters, a schema-driven transaction normalizer, webhook ingestion,
//! and error classification with automated recovery.

pub mod cache;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod normalization;
pub mod rate_limit;
pub mod recovery;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
pub mod webhooks;
pub use migration;
