//! API keys: hashed bearer credentials owned by users.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use warden_id::{ApiKeyId, UserId};

use super::require_text;
use crate::db::Database;
use crate::error::{on_foreign_key, CoreError, CoreResult};
use crate::tokens;

const KEY_COLUMNS: &str =
    "id, user_id, identifier, token_hash, memo, allowed_ips, last_used_at, expires_at, created_at";

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    pub identifier: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub memo: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ApiKey {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let allowed_ips: Json<Vec<String>> = row.try_get("allowed_ips")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            identifier: row.try_get("identifier")?,
            token_hash: row.try_get("token_hash")?,
            memo: row.try_get("memo")?,
            allowed_ips: allowed_ips.0,
            last_used_at: row.try_get("last_used_at")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewApiKey {
    pub memo: Option<String>,
    pub allowed_ips: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly issued key. `token` is only ever available here.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub key: ApiKey,
    pub token: String,
}

#[derive(Clone)]
pub struct ApiKeyRepo {
    db: Database,
}

impl ApiKeyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn issue(&self, user_id: UserId, new: NewApiKey) -> CoreResult<IssuedApiKey> {
        if let Some(memo) = &new.memo {
            require_text("memo", memo, 500)?;
        }
        for ip in &new.allowed_ips {
            warden_networking::BindAddress::parse(ip)
                .map_err(|_| CoreError::invalid("allowed_ips", format!("{ip} is not an IP address")))?;
        }

        self.db
            .timed(async {
                let (identifier, token) = tokens::generate_api_key();
                let key = sqlx::query_as::<_, ApiKey>(&format!(
                    "INSERT INTO api_keys (id, user_id, identifier, token_hash, memo, allowed_ips, expires_at, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     RETURNING {KEY_COLUMNS}"
                ))
                .bind(ApiKeyId::new())
                .bind(user_id)
                .bind(&identifier)
                .bind(tokens::hash_token(&token))
                .bind(&new.memo)
                .bind(Json(&new.allowed_ips))
                .bind(new.expires_at)
                .bind(Utc::now())
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| on_foreign_key(e, || CoreError::not_found("user", user_id)))?;

                info!(key_id = %key.id, user_id = %user_id, identifier = %key.identifier, "API key issued");
                Ok(IssuedApiKey { key, token })
            })
            .await
    }

    /// Resolve a presented token to its key, stamping `last_used_at`.
    ///
    /// Unknown, mismatched and expired tokens all yield `None`.
    pub async fn authenticate(&self, token: &str) -> CoreResult<Option<ApiKey>> {
        let Some((identifier, _)) = tokens::split_api_key(token) else {
            return Ok(None);
        };

        self.db
            .timed(async {
                let key = sqlx::query_as::<_, ApiKey>(&format!(
                    "SELECT {KEY_COLUMNS} FROM api_keys WHERE identifier = ?"
                ))
                .bind(identifier)
                .fetch_optional(self.db.pool())
                .await?;

                let now = Utc::now();
                let Some(mut key) = key.filter(|k| tokens::verify_token(token, &k.token_hash))
                else {
                    debug!(identifier = %identifier, "API key rejected");
                    return Ok(None);
                };
                if key.is_expired(now) {
                    debug!(identifier = %identifier, "API key expired");
                    return Ok(None);
                }

                sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(key.id)
                    .execute(self.db.pool())
                    .await?;
                key.last_used_at = Some(now);
                Ok(Some(key))
            })
            .await
    }

    pub async fn list_for_user(&self, user_id: UserId) -> CoreResult<Vec<ApiKey>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, ApiKey>(&format!(
                    "SELECT {KEY_COLUMNS} FROM api_keys WHERE user_id = ? ORDER BY created_at"
                ))
                .bind(user_id)
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn revoke(&self, id: ApiKeyId) -> CoreResult<()> {
        self.db
            .timed(async {
                let deleted = sqlx::query("DELETE FROM api_keys WHERE id = ?")
                    .bind(id)
                    .execute(self.db.pool())
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("api key", id));
                }
                info!(key_id = %id, "API key revoked");
                Ok(())
            })
            .await
    }
}
