//! Initial schema: the services table.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Service::Table)
                    .if_not_exists()
                    .col(string_len(Service::Id, 8).primary_key())
                    .col(string_len(Service::Name, 128).not_null())
                    .col(integer(Service::TunnelPort).not_null().unique_key())
                    .col(string_len(Service::LocalHost, 255).not_null())
                    .col(integer(Service::LocalPort).not_null())
                    .col(string_len(Service::Protocol, 10).not_null())
                    .col(boolean(Service::Enabled).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Service::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Service::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_services_local_host_port")
                    .table(Service::Table)
                    .col(Service::LocalHost)
                    .col(Service::LocalPort)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Service::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Service {
    #[sea_orm(iden = "services")]
    Table,
    Id,
    Name,
    TunnelPort,
    LocalHost,
    LocalPort,
    Protocol,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
