use anyhow::Result;
use sqlx::Row;

use super::Database;
use crate::models::*;

/// Filters accepted by [`Database::get_channels`].
#[derive(Debug, Clone, Default)]
pub struct ChannelFilters {
    pub country: Option<String>,
    pub category: Option<String>,
    pub provider: Option<String>,
    pub search: Option<String>,
    pub playable_only: bool,
}

/// Lightweight channel reference used by the EPG mapper's in-memory index.
#[derive(Debug, Clone)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
    pub alt_names: Vec<String>,
}

pub(crate) fn channel_from_row(row: &sqlx::sqlite::SqliteRow) -> Channel {
    let alt_names: String = row.get("alt_names");
    let categories: String = row.get("categories");
    Channel {
        id: row.get("id"),
        name: row.get("name"),
        alt_names: serde_json::from_str(&alt_names).unwrap_or_default(),
        network: row.get("network"),
        country: row.get("country"),
        categories: serde_json::from_str(&categories).unwrap_or_default(),
        is_nsfw: row.get::<i64, _>("is_nsfw") != 0,
        launched: row.get("launched"),
        closed: row.get("closed"),
        replaced_by: row.get("replaced_by"),
        website: row.get("website"),
        has_streams: row.get::<i64, _>("has_streams") != 0,
        stream_count: row.get("stream_count"),
    }
}

const CHANNEL_COLUMNS: &str = "id, name, alt_names, network, country, categories, is_nsfw, \
     launched, closed, replaced_by, website, has_streams, stream_count";

impl Database {
    /// Upsert a batch of catalog channels keyed on `id`. Rows not in the
    /// batch are untouched; derived columns survive re-sync.
    pub async fn upsert_channels(&self, channels: &[UpstreamChannel]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        for ch in channels {
            sqlx::query(
                r#"INSERT INTO channels
                   (id, name, alt_names, network, country, categories, is_nsfw,
                    launched, closed, replaced_by, website)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name,
                       alt_names = excluded.alt_names,
                       network = excluded.network,
                       country = excluded.country,
                       categories = excluded.categories,
                       is_nsfw = excluded.is_nsfw,
                       launched = excluded.launched,
                       closed = excluded.closed,
                       replaced_by = excluded.replaced_by,
                       website = excluded.website"#,
            )
            .bind(&ch.id)
            .bind(&ch.name)
            .bind(serde_json::to_string(&ch.alt_names)?)
            .bind(&ch.network)
            .bind(&ch.country)
            .bind(serde_json::to_string(&ch.categories)?)
            .bind(ch.is_nsfw as i64)
            .bind(&ch.launched)
            .bind(&ch.closed)
            .bind(&ch.replaced_by)
            .bind(&ch.website)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(channels.len() as u64)
    }

    /// Filtered, paginated channel listing ordered by name, with each
    /// returned channel's stream rows hydrated (including current health
    /// fields) from one batched lookup.
    pub async fn get_channels(
        &self,
        filters: &ChannelFilters,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<ChannelWithStreams>, i64)> {
        let mut conditions = vec!["closed IS NULL".to_string()];
        let mut params: Vec<String> = Vec::new();

        if filters.playable_only {
            conditions.push("has_streams = 1".to_string());
        }
        if let Some(country) = &filters.country {
            conditions.push("country = ?".to_string());
            params.push(country.to_uppercase());
        }
        if let Some(category) = &filters.category {
            conditions.push("categories LIKE ?".to_string());
            params.push(format!("%\"{}\"%", category));
        }
        if let Some(search) = &filters.search {
            conditions.push("(name LIKE ? OR alt_names LIKE ?)".to_string());
            params.push(format!("%{}%", search));
            params.push(format!("%{}%", search));
        }
        if let Some(provider) = &filters.provider {
            conditions.push(
                "id IN (SELECT channel_id FROM streams \
                 WHERE provider = ? AND channel_id IS NOT NULL)"
                    .to_string(),
            );
            params.push(provider.clone());
        }

        let where_clause = conditions.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM channels WHERE {}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for p in &params {
            count_query = count_query.bind(p);
        }
        let total = count_query.fetch_one(self.pool()).await?;

        let page = page.max(1);
        let offset = (page as i64 - 1) * per_page as i64;
        let rows_sql = format!(
            "SELECT {} FROM channels WHERE {} ORDER BY name LIMIT ? OFFSET ?",
            CHANNEL_COLUMNS, where_clause
        );
        let mut rows_query = sqlx::query(&rows_sql);
        for p in &params {
            rows_query = rows_query.bind(p);
        }
        let rows = rows_query
            .bind(per_page as i64)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;

        let channels: Vec<Channel> = rows.iter().map(channel_from_row).collect();

        let ids: Vec<String> = channels.iter().map(|c| c.id.clone()).collect();
        let mut streams_by_channel = self.get_streams_for_channels(&ids).await?;

        let hydrated = channels
            .into_iter()
            .map(|channel| {
                let streams = streams_by_channel.remove(&channel.id).unwrap_or_default();
                ChannelWithStreams {
                    channel,
                    streams,
                    now_playing: None,
                }
            })
            .collect();

        Ok((hydrated, total))
    }

    pub async fn get_channel_by_id(&self, channel_id: &str) -> Result<Option<Channel>> {
        let sql = format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    /// All channels as mapper references (id, name, alt names).
    pub async fn get_all_channels(&self) -> Result<Vec<ChannelRef>> {
        let rows = sqlx::query("SELECT id, name, alt_names FROM channels")
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let alt_names: String = row.get("alt_names");
                ChannelRef {
                    id: row.get("id"),
                    name: row.get("name"),
                    alt_names: serde_json::from_str(&alt_names).unwrap_or_default(),
                }
            })
            .collect())
    }

    /// Recompute `has_streams` and `stream_count` for every channel from the
    /// current streams table. Must run after any stream mutation that could
    /// change playability.
    pub async fn recompute_channel_stream_counts(&self) -> Result<PlayableCounts> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE channels SET has_streams = 0, stream_count = 0")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"UPDATE channels SET
                   has_streams = 1,
                   stream_count = (
                       SELECT COUNT(*) FROM streams
                       WHERE streams.channel_id = channels.id
                   )
               WHERE id IN (
                   SELECT DISTINCT channel_id FROM streams
                   WHERE channel_id IS NOT NULL
               )"#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let playable =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM channels WHERE has_streams = 1")
                .fetch_one(self.pool())
                .await?;
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM channels")
            .fetch_one(self.pool())
            .await?;

        Ok(PlayableCounts { playable, total })
    }

    pub async fn count_channels(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM channels")
            .fetch_one(self.pool())
            .await?)
    }

    /// Replace the categories lookup table, deriving channel counts from the
    /// serialized category tags.
    pub async fn store_categories(&self, categories: &[UpstreamCategory]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM categories").execute(&mut *tx).await?;
        for cat in categories {
            let count = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM channels WHERE categories LIKE ?",
            )
            .bind(format!("%\"{}\"%", cat.id))
            .fetch_one(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO categories (id, name, description, channel_count) VALUES (?, ?, ?, ?)",
            )
            .bind(&cat.id)
            .bind(&cat.name)
            .bind(&cat.description)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(categories.len() as u64)
    }

    pub async fn get_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query(
            "SELECT id, name, description, channel_count FROM categories ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| Category {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                channel_count: row.get("channel_count"),
            })
            .collect())
    }

    pub async fn store_countries(&self, countries: &[UpstreamCountry]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM countries").execute(&mut *tx).await?;
        for country in countries {
            let count =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM channels WHERE country = ?")
                    .bind(&country.code)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query(
                "INSERT INTO countries (code, name, languages, flag, channel_count) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&country.code)
            .bind(&country.name)
            .bind(serde_json::to_string(&country.languages)?)
            .bind(&country.flag)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(countries.len() as u64)
    }

    pub async fn get_countries(&self) -> Result<Vec<Country>> {
        let rows = sqlx::query(
            "SELECT code, name, languages, flag, channel_count FROM countries ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let languages: String = row.get("languages");
                Country {
                    code: row.get("code"),
                    name: row.get("name"),
                    languages: serde_json::from_str(&languages).unwrap_or_default(),
                    flag: row.get("flag"),
                    channel_count: row.get("channel_count"),
                }
            })
            .collect())
    }

    /// Distinct stream providers (from local playlist imports) with counts,
    /// busiest first.
    pub async fn get_providers(&self) -> Result<Vec<ProviderSummary>> {
        let rows = sqlx::query(
            "SELECT provider, COUNT(*) AS stream_count FROM streams \
             WHERE provider IS NOT NULL \
             GROUP BY provider ORDER BY stream_count DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("provider");
                let mut name = id.clone();
                if let Some(first) = name.get_mut(..1) {
                    first.make_ascii_uppercase();
                }
                ProviderSummary {
                    id,
                    name,
                    stream_count: row.get("stream_count"),
                }
            })
            .collect())
    }

    pub async fn store_logos(&self, logos: &[UpstreamLogo]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM logos").execute(&mut *tx).await?;
        for (i, logo) in logos.iter().enumerate() {
            let id = logo_id(&logo.url, &logo.channel, i);
            sqlx::query(
                "INSERT OR REPLACE INTO logos \
                 (id, channel_id, feed, url, width, height, format, tags) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&logo.channel)
            .bind(&logo.feed)
            .bind(&logo.url)
            .bind(logo.width)
            .bind(logo.height)
            .bind(&logo.format)
            .bind(serde_json::to_string(&logo.tags)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(logos.len() as u64)
    }

    pub async fn get_logos_for_channel(&self, channel_id: &str) -> Result<Vec<Logo>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, feed, url, width, height, format, tags \
             FROM logos WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let tags: String = row.get("tags");
                Logo {
                    id: row.get("id"),
                    channel_id: row.get("channel_id"),
                    feed: row.get("feed"),
                    url: row.get("url"),
                    width: row.get("width"),
                    height: row.get("height"),
                    format: row.get("format"),
                    tags: serde_json::from_str(&tags).unwrap_or_default(),
                }
            })
            .collect())
    }
}
