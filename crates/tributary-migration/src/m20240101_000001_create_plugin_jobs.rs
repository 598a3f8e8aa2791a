use sea_orm_migration::prelude::*;

/// Migration 1: durable plugin job queue.
///
/// Built with the schema builder rather than raw SQL so the same migration
/// runs on Postgres in production and SQLite in tests.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PluginJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(PluginJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(PluginJobs::PluginId).uuid().not_null())
                    .col(ColumnDef::new(PluginJobs::JobName).string_len(255).not_null())
                    .col(ColumnDef::new(PluginJobs::Payload).text().null())
                    .col(ColumnDef::new(PluginJobs::Status).string_len(20).not_null())
                    .col(ColumnDef::new(PluginJobs::ScheduledAt).big_integer().not_null())
                    .col(ColumnDef::new(PluginJobs::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(PluginJobs::StartedAt).big_integer().null())
                    .col(ColumnDef::new(PluginJobs::FinishedAt).big_integer().null())
                    .col(ColumnDef::new(PluginJobs::ErrorMessage).text().null())
                    .to_owned(),
            )
            .await?;

        // The poller's only query: pending jobs ordered by due time.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_plugin_jobs_status_scheduled_at")
                    .table(PluginJobs::Table)
                    .col(PluginJobs::Status)
                    .col(PluginJobs::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_plugin_jobs_plugin_id")
                    .table(PluginJobs::Table)
                    .col(PluginJobs::PluginId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PluginJobs::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum PluginJobs {
    Table,
    Id,
    PluginId,
    JobName,
    Payload,
    Status,
    ScheduledAt,
    CreatedAt,
    StartedAt,
    FinishedAt,
    ErrorMessage,
}
