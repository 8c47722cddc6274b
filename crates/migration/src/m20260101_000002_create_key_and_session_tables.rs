//! Signing keys, sessions and refresh token families.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SigningKey::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SigningKey::Kid)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SigningKey::Alg).string().not_null())
                    .col(ColumnDef::new(SigningKey::PublicJwk).text().not_null())
                    .col(ColumnDef::new(SigningKey::PrivateKey).text().null())
                    .col(
                        ColumnDef::new(SigningKey::Sealed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(SigningKey::Status).string().not_null())
                    .col(
                        ColumnDef::new(SigningKey::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::RotatesAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::RetiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AuthSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthSession::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthSession::UserId).string().not_null())
                    .col(
                        ColumnDef::new(AuthSession::FamilyId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(AuthSession::Provider).string().null())
                    .col(ColumnDef::new(AuthSession::Tenant).string().null())
                    .col(
                        ColumnDef::new(AuthSession::Generation)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AuthSession::Revoked)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(AuthSession::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthSession::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthSession::LastRotatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_auth_session_user_id")
                    .table(AuthSession::Table)
                    .col(AuthSession::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RefreshToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RefreshToken::Fingerprint)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RefreshToken::FamilyId).string().not_null())
                    .col(ColumnDef::new(RefreshToken::SessionId).string().not_null())
                    .col(
                        ColumnDef::new(RefreshToken::Generation)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::IssuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RefreshToken::UsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_refresh_token_family")
                            .from(RefreshToken::Table, RefreshToken::FamilyId)
                            .to(AuthSession::Table, AuthSession::FamilyId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_refresh_token_family_id")
                    .table(RefreshToken::Table)
                    .col(RefreshToken::FamilyId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RefreshToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthSession::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SigningKey::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SigningKey {
    Table,
    Kid,
    Alg,
    PublicJwk,
    PrivateKey,
    Sealed,
    Status,
    CreatedAt,
    RotatesAt,
    RetiredAt,
}

#[derive(DeriveIden)]
enum AuthSession {
    Table,
    Id,
    UserId,
    FamilyId,
    Provider,
    Tenant,
    Generation,
    Revoked,
    CreatedAt,
    ExpiresAt,
    LastRotatedAt,
}

#[derive(DeriveIden)]
enum RefreshToken {
    Table,
    Fingerprint,
    FamilyId,
    SessionId,
    Generation,
    IssuedAt,
    ExpiresAt,
    UsedAt,
}
