use anyhow::Result;
use chrono::{Duration, Utc};

use super::Database;
use crate::utils::{format_timestamp, now_timestamp};

impl Database {
    /// Cached value for `key`, if present and not expired.
    pub async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query_scalar::<_, String>(
            "SELECT value FROM cache WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now_timestamp())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn kv_set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_seconds: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = format_timestamp(now + Duration::seconds(ttl_seconds));
        sqlx::query(
            r#"INSERT INTO cache (key, value, expires_at, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at,
                   created_at = excluded.created_at"#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(&expires_at)
        .bind(format_timestamp(now))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Remove expired cache entries. Returns the number of rows deleted.
    pub async fn clear_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at < ?")
            .bind(now_timestamp())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
