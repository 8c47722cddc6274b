//! Sessions and refresh token families in the database.
//!
//! [`SessionStore::apply`] writes one [`SessionEvent`]; the journal task
//! started by [`spawn_journal`] feeds it every change the manager makes.
//! Refresh tokens are stored by fingerprint only.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FamilyState, PURGE_GRACE_SECS, Session, SessionEvent, SessionManager};
use crate::clock::datetime;
use crate::entity::{auth_session, refresh_token};
use crate::error::AuthError;
use crate::tokens::RefreshRecord;

#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Arc<DatabaseConnection>,
}

impl SessionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Writes one change. Each event is applied in its own transaction.
    pub async fn apply(&self, event: &SessionEvent) -> Result<(), AuthError> {
        let txn = self.db.begin().await?;
        match event {
            SessionEvent::Created { session, token } => {
                session_row(session, 0).insert(&txn).await?;
                token_row(token).insert(&txn).await?;
            }
            SessionEvent::Rotated {
                session,
                generation,
                spent,
                used_at,
                token,
            } => {
                auth_session::ActiveModel {
                    id: Set(session.id.clone()),
                    generation: Set(as_column(*generation)),
                    last_rotated_at: Set(datetime(session.last_rotated_at)),
                    ..Default::default()
                }
                .update(&txn)
                .await?;
                refresh_token::ActiveModel {
                    fingerprint: Set(spent.clone()),
                    used_at: Set(Some(datetime(*used_at))),
                    ..Default::default()
                }
                .update(&txn)
                .await?;
                token_row(token).insert(&txn).await?;
            }
            SessionEvent::Revoked { family_id } => {
                auth_session::Entity::update_many()
                    .col_expr(auth_session::Column::Revoked, Expr::value(true))
                    .filter(auth_session::Column::FamilyId.eq(family_id.as_str()))
                    .exec(&txn)
                    .await?;
            }
            SessionEvent::Purged { family_ids } => {
                delete_families(&txn, family_ids).await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    /// Reads back every family still inside the purge grace at `now`, and
    /// deletes the ones past it.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, now: i64) -> Result<Vec<FamilyState>, AuthError> {
        let cutoff = now - PURGE_GRACE_SECS;
        let (live, stale): (Vec<_>, Vec<_>) = auth_session::Entity::find()
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .partition(|row| row.expires_at.unix_timestamp() > cutoff);

        if !stale.is_empty() {
            let family_ids: Vec<String> = stale.into_iter().map(|row| row.family_id).collect();
            let txn = self.db.begin().await?;
            delete_families(&txn, &family_ids).await?;
            txn.commit().await?;
            tracing::info!(count = family_ids.len(), "Deleted expired stored sessions");
        }

        let mut tokens: HashMap<String, Vec<RefreshRecord>> = HashMap::new();
        for row in refresh_token::Entity::find().all(self.db.as_ref()).await? {
            tokens
                .entry(row.family_id.clone())
                .or_default()
                .push(RefreshRecord {
                    fingerprint: row.fingerprint,
                    family_id: row.family_id,
                    generation: from_column(row.generation),
                    session_id: row.session_id,
                    issued_at: row.issued_at.unix_timestamp(),
                    expires_at: row.expires_at.unix_timestamp(),
                    used_at: row.used_at.map(|at| at.unix_timestamp()),
                });
        }

        Ok(live
            .into_iter()
            .map(|row| FamilyState {
                tokens: tokens.remove(&row.family_id).unwrap_or_default(),
                generation: from_column(row.generation),
                session: Session {
                    id: row.id,
                    user_id: row.user_id,
                    family_id: row.family_id,
                    provider: row.provider,
                    tenant: row.tenant,
                    created_at: row.created_at.unix_timestamp(),
                    expires_at: row.expires_at.unix_timestamp(),
                    last_rotated_at: row.last_rotated_at.unix_timestamp(),
                    revoked: row.revoked,
                },
            })
            .collect())
    }
}

/// Attaches a journal to `sessions` and writes its events with `store` on a
/// background task, in order. Returns `None` if a journal was already
/// attached.
pub fn spawn_journal(sessions: &SessionManager, store: SessionStore) -> Option<JoinHandle<()>> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    if !sessions.attach_journal(sender) {
        return None;
    }
    Some(tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = store.apply(&event).await {
                tracing::error!(error = %e, event = ?event, "Failed to persist session change");
            }
        }
    }))
}

async fn delete_families<C: sea_orm::ConnectionTrait>(
    db: &C,
    family_ids: &[String],
) -> Result<(), AuthError> {
    // Chunked to stay below bind parameter limits.
    for chunk in family_ids.chunks(500) {
        refresh_token::Entity::delete_many()
            .filter(refresh_token::Column::FamilyId.is_in(chunk.iter().map(String::as_str)))
            .exec(db)
            .await?;
        auth_session::Entity::delete_many()
            .filter(auth_session::Column::FamilyId.is_in(chunk.iter().map(String::as_str)))
            .exec(db)
            .await?;
    }
    Ok(())
}

fn session_row(session: &Session, generation: u64) -> auth_session::ActiveModel {
    auth_session::ActiveModel {
        id: Set(session.id.clone()),
        user_id: Set(session.user_id.clone()),
        family_id: Set(session.family_id.clone()),
        provider: Set(session.provider.clone()),
        tenant: Set(session.tenant.clone()),
        generation: Set(as_column(generation)),
        revoked: Set(session.revoked),
        created_at: Set(datetime(session.created_at)),
        expires_at: Set(datetime(session.expires_at)),
        last_rotated_at: Set(datetime(session.last_rotated_at)),
    }
}

fn token_row(record: &RefreshRecord) -> refresh_token::ActiveModel {
    refresh_token::ActiveModel {
        fingerprint: Set(record.fingerprint.clone()),
        family_id: Set(record.family_id.clone()),
        session_id: Set(record.session_id.clone()),
        generation: Set(as_column(record.generation)),
        issued_at: Set(datetime(record.issued_at)),
        expires_at: Set(datetime(record.expires_at)),
        used_at: Set(record.used_at.map(datetime)),
    }
}

fn as_column(generation: u64) -> i64 {
    i64::try_from(generation).unwrap_or(i64::MAX)
}

fn from_column(generation: i64) -> u64 {
    u64::try_from(generation).unwrap_or_default()
}
