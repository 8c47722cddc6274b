//! Account linking: maps upstream provider accounts onto broker users.
//!
//! The first login through a provider account creates the user, with an id
//! derived from that account. Further provider accounts can be attached to
//! the same user with [`AccountLinker::link`].

use crate::clock::{SharedClock, datetime};
use crate::entity::{app_user, linked_identity};
use crate::error::AuthError;
use crate::oauth2::provider::ProviderIdentity;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AccountLinker {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl AccountLinker {
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// User id assigned to accounts created by a first login.
    pub fn user_id_for(identity: &ProviderIdentity) -> String {
        format!(
            "user:{}:{}",
            identity.provider, identity.provider_account_id
        )
    }

    /// Returns the user linked to `identity`, creating both on first login.
    #[tracing::instrument(skip(self, identity), fields(provider = %identity.provider))]
    pub async fn resolve(&self, identity: &ProviderIdentity) -> Result<app_user::Model, AuthError> {
        let now = datetime(self.clock.now());

        if let Some(existing) = self
            .find_identity(&identity.provider, &identity.provider_account_id)
            .await?
        {
            let user_id = existing.user_id.clone();
            self.refresh_identity(existing, identity).await?;
            let user = app_user::Entity::find_by_id(&user_id)
                .one(self.db.as_ref())
                .await?
                .ok_or_else(|| {
                    AuthError::Internal(format!("identity points at missing user {user_id}"))
                })?;
            return self.touch_user(user, identity).await;
        }

        let user_id = Self::user_id_for(identity);
        let user = match app_user::Entity::find_by_id(&user_id)
            .one(self.db.as_ref())
            .await?
        {
            Some(user) => user,
            None => {
                let user = app_user::ActiveModel {
                    id: Set(user_id.clone()),
                    email: Set(identity.email.clone()),
                    name: Set(identity.name.clone()),
                    created_at: Set(now),
                    last_login_at: Set(Some(now)),
                };
                match user.insert(self.db.as_ref()).await {
                    Ok(user) => {
                        tracing::info!(user_id = %user.id, "Created user on first login");
                        user
                    }
                    // Lost a race with a concurrent first login.
                    Err(e) => app_user::Entity::find_by_id(&user_id)
                        .one(self.db.as_ref())
                        .await?
                        .ok_or(e)?,
                }
            }
        };

        self.link(&user.id, identity).await?;
        self.touch_user(user, identity).await
    }

    /// Attaches `identity` to an existing user.
    ///
    /// Re-linking an identity the user already owns refreshes its stored
    /// provider tokens. An identity owned by another user is refused.
    #[tracing::instrument(skip(self, identity), fields(provider = %identity.provider))]
    pub async fn link(
        &self,
        user_id: &str,
        identity: &ProviderIdentity,
    ) -> Result<linked_identity::Model, AuthError> {
        if let Some(existing) = self
            .find_identity(&identity.provider, &identity.provider_account_id)
            .await?
        {
            if existing.user_id != user_id {
                return Err(AuthError::InvalidRequest(format!(
                    "{} account is already linked to another user",
                    identity.provider
                )));
            }
            return self.refresh_identity(existing, identity).await;
        }

        let now = datetime(self.clock.now());
        let row = linked_identity::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            user_id: Set(user_id.to_string()),
            provider: Set(identity.provider.clone()),
            provider_account_id: Set(identity.provider_account_id.clone()),
            email: Set(identity.email.clone()),
            access_token: Set(identity.access_token.clone()),
            refresh_token: Set(identity.refresh_token.clone()),
            token_expires_at: Set(identity.token_expires_at),
            scope: Set(identity.scope.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        match row.insert(self.db.as_ref()).await {
            Ok(linked) => {
                tracing::info!(user_id, "Linked provider identity");
                Ok(linked)
            }
            Err(e) => {
                // Unique (provider, provider_account_id) violated by a
                // concurrent insert; use whatever won.
                let winner = self
                    .find_identity(&identity.provider, &identity.provider_account_id)
                    .await?
                    .ok_or(e)?;
                if winner.user_id != user_id {
                    return Err(AuthError::InvalidRequest(format!(
                        "{} account is already linked to another user",
                        identity.provider
                    )));
                }
                Ok(winner)
            }
        }
    }

    /// Find a user by provider account.
    #[tracing::instrument(skip(self))]
    pub async fn find_user_by_identity(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> Result<Option<app_user::Model>, sea_orm::DbErr> {
        match self.find_identity(provider, provider_account_id).await? {
            Some(identity) => {
                app_user::Entity::find_by_id(&identity.user_id)
                    .one(self.db.as_ref())
                    .await
            }
            None => Ok(None),
        }
    }

    /// All provider accounts linked to a user.
    #[tracing::instrument(skip(self))]
    pub async fn identities_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<linked_identity::Model>, sea_orm::DbErr> {
        linked_identity::Entity::find()
            .filter(linked_identity::Column::UserId.eq(user_id))
            .all(self.db.as_ref())
            .await
    }

    /// Detach every identity of `provider` from a user.
    #[tracing::instrument(skip(self))]
    pub async fn unlink(&self, user_id: &str, provider: &str) -> Result<bool, sea_orm::DbErr> {
        let result = linked_identity::Entity::delete_many()
            .filter(linked_identity::Column::UserId.eq(user_id))
            .filter(linked_identity::Column::Provider.eq(provider))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn find_identity(
        &self,
        provider: &str,
        provider_account_id: &str,
    ) -> Result<Option<linked_identity::Model>, sea_orm::DbErr> {
        linked_identity::Entity::find()
            .filter(linked_identity::Column::Provider.eq(provider))
            .filter(linked_identity::Column::ProviderAccountId.eq(provider_account_id))
            .one(self.db.as_ref())
            .await
    }

    async fn refresh_identity(
        &self,
        existing: linked_identity::Model,
        identity: &ProviderIdentity,
    ) -> Result<linked_identity::Model, AuthError> {
        let mut active: linked_identity::ActiveModel = existing.into();
        if identity.access_token.is_some() {
            active.access_token = Set(identity.access_token.clone());
            active.refresh_token = Set(identity.refresh_token.clone());
            active.token_expires_at = Set(identity.token_expires_at);
            active.scope = Set(identity.scope.clone());
        }
        if let Some(email) = &identity.email {
            active.email = Set(Some(email.clone()));
        }
        active.updated_at = Set(datetime(self.clock.now()));
        Ok(active.update(self.db.as_ref()).await?)
    }

    async fn touch_user(
        &self,
        user: app_user::Model,
        identity: &ProviderIdentity,
    ) -> Result<app_user::Model, AuthError> {
        let fill_email = user.email.is_none() && identity.email.is_some();
        let fill_name = user.name.is_none() && identity.name.is_some();
        let mut active: app_user::ActiveModel = user.into();
        active.last_login_at = Set(Some(datetime(self.clock.now())));
        if fill_email {
            active.email = Set(identity.email.clone());
        }
        if fill_name {
            active.name = Set(identity.name.clone());
        }
        Ok(active.update(self.db.as_ref()).await?)
    }
}
