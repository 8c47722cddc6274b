//! One refresh token of a family. The token itself is never stored, only its
//! SHA-256 fingerprint.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "refresh_token")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub fingerprint: String,
    /// Reference to auth_session.family_id
    pub family_id: String,
    pub session_id: String,
    pub generation: i64,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    /// Set once the token has been exchanged
    pub used_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::auth_session::Entity",
        from = "Column::FamilyId",
        to = "super::auth_session::Column::FamilyId"
    )]
    Session,
}

impl Related<super::auth_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
