//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for database entities, providing a clean API for data access with tenant-aware methods.

pub mod integration;
pub mod integration_error;
pub mod recovery_action;
pub mod webhook_subscription;

pub use integration::IntegrationRepository;
pub use integration_error::IntegrationErrorRepository;
pub use recovery_action::RecoveryActionRepository;
pub use webhook_subscription::{NewSubscription, WebhookSubscriptionRepository};
