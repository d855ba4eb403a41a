//! Migration to create the recovery_actions table.
//!
//! Mirrors the in-memory recovery queue so scheduled and finished actions can be inspected.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RecoveryActions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RecoveryActions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RecoveryActions::TenantId).uuid().not_null())
                    .col(ColumnDef::new(RecoveryActions::Provider).text().not_null())
                    .col(ColumnDef::new(RecoveryActions::ActionType).text().not_null())
                    .col(
                        ColumnDef::new(RecoveryActions::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::MaxAttempts)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RecoveryActions::LastError).text().null())
                    .col(
                        ColumnDef::new(RecoveryActions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RecoveryActions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_recovery_actions_tenant_provider")
                    .table(RecoveryActions::Table)
                    .col(RecoveryActions::TenantId)
                    .col(RecoveryActions::Provider)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_recovery_actions_tenant_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RecoveryActions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RecoveryActions {
    Table,
    Id,
    TenantId,
    Provider,
    ActionType,
    Status,
    Attempts,
    MaxAttempts,
    ScheduledAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
