//! Users and the provider identities linked to them.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AppUser::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AppUser::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AppUser::Email).string().null())
                    .col(ColumnDef::new(AppUser::Name).string().null())
                    .col(
                        ColumnDef::new(AppUser::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AppUser::LastLoginAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LinkedIdentity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LinkedIdentity::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LinkedIdentity::UserId).string().not_null())
                    .col(ColumnDef::new(LinkedIdentity::Provider).string().not_null())
                    .col(
                        ColumnDef::new(LinkedIdentity::ProviderAccountId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LinkedIdentity::Email).string().null())
                    .col(ColumnDef::new(LinkedIdentity::AccessToken).text().null())
                    .col(ColumnDef::new(LinkedIdentity::RefreshToken).text().null())
                    .col(
                        ColumnDef::new(LinkedIdentity::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(LinkedIdentity::Scope).string().null())
                    .col(
                        ColumnDef::new(LinkedIdentity::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LinkedIdentity::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_linked_identity_user")
                            .from(LinkedIdentity::Table, LinkedIdentity::UserId)
                            .to(AppUser::Table, AppUser::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One broker user per upstream account
        manager
            .create_index(
                Index::create()
                    .name("idx_linked_identity_provider_account")
                    .table(LinkedIdentity::Table)
                    .col(LinkedIdentity::Provider)
                    .col(LinkedIdentity::ProviderAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_linked_identity_user_id")
                    .table(LinkedIdentity::Table)
                    .col(LinkedIdentity::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LinkedIdentity::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AppUser::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AppUser {
    Table,
    Id,
    Email,
    Name,
    CreatedAt,
    LastLoginAt,
}

#[derive(DeriveIden)]
enum LinkedIdentity {
    Table,
    Id,
    UserId,
    Provider,
    ProviderAccountId,
    Email,
    AccessToken,
    RefreshToken,
    TokenExpiresAt,
    Scope,
    CreatedAt,
    UpdatedAt,
}
