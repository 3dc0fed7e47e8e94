use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use std::collections::HashMap;

use super::Database;
use crate::models::*;
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp};

/// Streams checked more recently than this are not due again, regardless of
/// the adaptive schedule.
const RECHECK_FLOOR_MINUTES: i64 = 10;

const STREAM_COLUMNS: &str = "id, channel_id, feed, title, url, referrer, user_agent, quality, \
     country, provider, health_status, health_checked_at, health_response_ms, \
     health_error, next_check_due";

pub(crate) fn stream_from_row(row: &sqlx::sqlite::SqliteRow) -> Stream {
    let status: String = row.get("health_status");
    let checked_at: Option<String> = row.get("health_checked_at");
    let next_check: Option<String> = row.get("next_check_due");
    Stream {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        feed: row.get("feed"),
        title: row.get("title"),
        url: row.get("url"),
        referrer: row.get("referrer"),
        user_agent: row.get("user_agent"),
        quality: row.get("quality"),
        country: row.get("country"),
        provider: row.get("provider"),
        health_status: HealthStatus::parse(&status),
        health_checked_at: checked_at.as_deref().and_then(parse_timestamp),
        health_response_ms: row.get("health_response_ms"),
        health_error: row.get("health_error"),
        next_check_due: next_check.as_deref().and_then(parse_timestamp),
    }
}

impl Database {
    /// Upsert catalog streams. Ids are a pure function of (url, channel), so
    /// re-importing the same pair never creates a duplicate; health columns
    /// are left untouched so probe results survive re-sync.
    pub async fn upsert_streams(&self, streams: &[UpstreamStream]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        for s in streams {
            let id = stable_stream_id(&s.url, s.channel.as_deref().unwrap_or(""));
            sqlx::query(
                r#"INSERT INTO streams
                   (id, channel_id, feed, title, url, referrer, user_agent, quality)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       channel_id = excluded.channel_id,
                       feed = excluded.feed,
                       title = excluded.title,
                       url = excluded.url,
                       referrer = excluded.referrer,
                       user_agent = excluded.user_agent,
                       quality = excluded.quality"#,
            )
            .bind(&id)
            .bind(&s.channel)
            .bind(&s.feed)
            .bind(&s.title)
            .bind(&s.url)
            .bind(&s.referrer)
            .bind(&s.user_agent)
            .bind(&s.quality)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(streams.len() as u64)
    }

    /// Upsert streams parsed from local playlist files. Ids come precomputed
    /// from the importer (url + country + provider digest).
    pub async fn upsert_m3u_streams(&self, streams: &[M3uStream]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        for s in streams {
            sqlx::query(
                r#"INSERT INTO streams
                   (id, channel_id, feed, title, url, quality, country, provider)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       channel_id = excluded.channel_id,
                       feed = excluded.feed,
                       title = excluded.title,
                       url = excluded.url,
                       quality = excluded.quality,
                       country = excluded.country,
                       provider = excluded.provider"#,
            )
            .bind(&s.id)
            .bind(&s.channel_id)
            .bind(&s.feed)
            .bind(&s.title)
            .bind(&s.url)
            .bind(&s.quality)
            .bind(&s.country)
            .bind(&s.provider)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(streams.len() as u64)
    }

    pub async fn get_stream_by_id(&self, stream_id: &str) -> Result<Option<Stream>> {
        let sql = format!("SELECT {} FROM streams WHERE id = ?", STREAM_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(stream_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(stream_from_row))
    }

    pub async fn get_streams_for_channel(&self, channel_id: &str) -> Result<Vec<Stream>> {
        let sql = format!("SELECT {} FROM streams WHERE channel_id = ?", STREAM_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(stream_from_row).collect())
    }

    /// One batched lookup of stream rows for a page of channels, grouped by
    /// channel id.
    pub(crate) async fn get_streams_for_channels(
        &self,
        channel_ids: &[String],
    ) -> Result<HashMap<String, Vec<Stream>>> {
        if channel_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; channel_ids.len()].join(",");
        let sql = format!(
            "SELECT {} FROM streams WHERE channel_id IN ({})",
            STREAM_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in channel_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;

        let mut grouped: HashMap<String, Vec<Stream>> = HashMap::new();
        for row in &rows {
            let stream = stream_from_row(row);
            if let Some(channel_id) = stream.channel_id.clone() {
                grouped.entry(channel_id).or_default().push(stream);
            }
        }
        Ok(grouped)
    }

    /// Streams due for a probe: never checked first, then oldest check, both
    /// gated on the recheck floor and the adaptive `next_check_due` schedule.
    pub async fn get_unchecked_streams(&self, limit: i64) -> Result<Vec<ProbeTarget>> {
        let now = Utc::now();
        let floor = format_timestamp(now - Duration::minutes(RECHECK_FLOOR_MINUTES));
        let now_str = format_timestamp(now);
        let rows = sqlx::query(
            r#"SELECT id, url, referrer, user_agent, channel_id, health_status
               FROM streams
               WHERE (health_checked_at IS NULL OR health_checked_at < ?)
                 AND (next_check_due IS NULL OR next_check_due <= ?)
               ORDER BY health_checked_at ASC NULLS FIRST
               LIMIT ?"#,
        )
        .bind(&floor)
        .bind(&now_str)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("health_status");
                ProbeTarget {
                    id: row.get("id"),
                    url: row.get("url"),
                    referrer: row.get("referrer"),
                    user_agent: row.get("user_agent"),
                    channel_id: row.get("channel_id"),
                    health_status: HealthStatus::parse(&status),
                }
            })
            .collect())
    }

    pub async fn update_stream_health(
        &self,
        stream_id: &str,
        status: HealthStatus,
        response_ms: Option<i64>,
        error: Option<&str>,
        next_check_due: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE streams
               SET health_status = ?,
                   health_checked_at = ?,
                   health_response_ms = ?,
                   health_error = ?,
                   next_check_due = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(now_timestamp())
        .bind(response_ms)
        .bind(error)
        .bind(next_check_due.map(format_timestamp))
        .bind(stream_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_recent_health_updates(
        &self,
        since_seconds: i64,
    ) -> Result<Vec<HealthUpdate>> {
        let cutoff = format_timestamp(Utc::now() - Duration::seconds(since_seconds));
        let rows = sqlx::query(
            r#"SELECT id, channel_id, health_status, health_error,
                      health_checked_at, health_response_ms
               FROM streams
               WHERE health_checked_at > ?
               ORDER BY health_checked_at DESC"#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("health_status");
                HealthUpdate {
                    id: row.get("id"),
                    channel_id: row.get("channel_id"),
                    health_status: HealthStatus::parse(&status),
                    health_error: row.get("health_error"),
                    health_checked_at: row.get("health_checked_at"),
                    health_response_ms: row.get("health_response_ms"),
                }
            })
            .collect())
    }

    /// Stream counts per health status.
    pub async fn get_health_stats(&self) -> Result<HashMap<String, i64>> {
        let rows =
            sqlx::query("SELECT health_status, COUNT(*) AS count FROM streams GROUP BY health_status")
                .fetch_all(self.pool())
                .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let status: Option<String> = row.get("health_status");
                (status.unwrap_or_else(|| "unknown".to_string()), row.get("count"))
            })
            .collect())
    }

    pub async fn get_stream_stats(&self) -> Result<StreamStats> {
        let total_streams = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM streams")
            .fetch_one(self.pool())
            .await?;
        let channels_with_streams = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT channel_id) FROM streams WHERE channel_id IS NOT NULL",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(StreamStats {
            total_streams,
            channels_with_streams,
        })
    }

    /// All streams ordered best-first (working, unknown, warning, failed,
    /// then fastest response). Feeds the health snapshot.
    pub async fn get_streams_by_health(&self, channel_id: Option<&str>) -> Result<Vec<Stream>> {
        let mut sql = format!("SELECT {} FROM streams", STREAM_COLUMNS);
        if channel_id.is_some() {
            sql.push_str(" WHERE channel_id = ?");
        }
        sql.push_str(
            r#" ORDER BY
                    CASE health_status
                        WHEN 'working' THEN 1
                        WHEN 'unknown' THEN 2
                        WHEN 'warning' THEN 3
                        WHEN 'failed' THEN 4
                    END,
                    health_response_ms ASC NULLS LAST"#,
        );
        let mut query = sqlx::query(&sql);
        if let Some(id) = channel_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.iter().map(stream_from_row).collect())
    }
}
