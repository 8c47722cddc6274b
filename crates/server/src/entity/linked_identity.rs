//! Upstream provider account attached to a broker user.
//!
//! A user may have any number of identities; `(provider, provider_account_id)`
//! is unique across the table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "linked_identity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Reference to app_user.id
    pub user_id: String,
    /// Provider id as configured (e.g. "google", "github")
    pub provider: String,
    /// Provider-side account id (`sub` or `id` from userinfo)
    pub provider_account_id: String,
    pub email: Option<String>,
    /// Provider tokens, kept opaque
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<OffsetDateTime>,
    pub scope: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Model {
    /// Whether the stored provider access token is past its expiry.
    pub fn is_token_expired(&self, now: OffsetDateTime) -> bool {
        self.token_expires_at.is_some_and(|exp| exp < now)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::app_user::Entity",
        from = "Column::UserId",
        to = "super::app_user::Column::Id"
    )]
    User,
}

impl Related<super::app_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
