//! Database migrations for the POS integration layer.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_000001_create_integrations;
mod m2025_06_01_000002_create_webhook_subscriptions;
mod m2025_06_01_000003_create_recovery_actions;
mod m2025_06_01_000004_create_integration_errors;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_000001_create_integrations::Migration),
            Box::new(m2025_06_01_000002_create_webhook_subscriptions::Migration),
            Box::new(m2025_06_01_000003_create_recovery_actions::Migration),
            Box::new(m2025_06_01_000004_create_integration_errors::Migration),
        ]
    }
}
