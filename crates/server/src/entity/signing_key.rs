//! Signing keys that survive a restart.
//!
//! Private material is dropped once a key is retired; only its metadata
//! stays behind.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "signing_key")]
pub struct Model {
    /// RFC 7638 thumbprint of the public key
    #[sea_orm(primary_key, auto_increment = false)]
    pub kid: String,
    pub alg: String,
    /// Public key as a JWK document
    #[sea_orm(column_type = "Text")]
    pub public_jwk: String,
    /// PKCS#8 PEM, or an AES-256-GCM envelope of it when `sealed`
    #[sea_orm(column_type = "Text", nullable)]
    pub private_key: Option<String>,
    pub sealed: bool,
    /// "active", "retiring" or "retired"
    pub status: String,
    pub created_at: OffsetDateTime,
    pub rotates_at: OffsetDateTime,
    pub retired_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
