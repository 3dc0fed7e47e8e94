use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::Row;
use std::collections::{HashMap, HashSet};

use super::Database;
use crate::models::*;
use crate::utils::{format_timestamp, parse_timestamp};

/// The stored mapping dictionary lives in the KV cache under this key.
const EPG_MAPPINGS_KEY: &str = "epg_mappings";
const EPG_MAPPINGS_TTL_SECONDS: i64 = 86_400 * 30;

fn program_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Program> {
    let start: String = row.get("start_time");
    let stop: String = row.get("stop_time");
    Ok(Program {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        title: row.get("title"),
        sub_title: row.get("sub_title"),
        description: row.get("description"),
        start: parse_timestamp(&start)
            .ok_or_else(|| anyhow::anyhow!("unparsable program start: {}", start))?,
        stop: parse_timestamp(&stop)
            .ok_or_else(|| anyhow::anyhow!("unparsable program stop: {}", stop))?,
        category: row.get("category"),
        icon: row.get("icon"),
    })
}

impl Database {
    /// Upsert EPG programs keyed on id. Existing rows for other channels are
    /// untouched; re-importing a guide file is idempotent.
    pub async fn store_epg_programs(&self, programs: &[Program]) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        for prog in programs {
            sqlx::query(
                r#"INSERT INTO programs
                   (id, channel_id, title, sub_title, description,
                    start_time, stop_time, category, icon)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (id) DO UPDATE SET
                       channel_id = excluded.channel_id,
                       title = excluded.title,
                       sub_title = excluded.sub_title,
                       description = excluded.description,
                       start_time = excluded.start_time,
                       stop_time = excluded.stop_time,
                       category = excluded.category,
                       icon = excluded.icon"#,
            )
            .bind(&prog.id)
            .bind(&prog.channel_id)
            .bind(&prog.title)
            .bind(&prog.sub_title)
            .bind(&prog.description)
            .bind(format_timestamp(prog.start))
            .bind(format_timestamp(prog.stop))
            .bind(&prog.category)
            .bind(&prog.icon)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(programs.len() as u64)
    }

    /// Programs for a catalog channel over the next `hours`, resolving
    /// guide data stored under XMLTV ids through the reverse mapping.
    /// Returned programs carry the catalog id, not the XMLTV one.
    pub async fn get_epg_for_channel(&self, channel_id: &str, hours: i64) -> Result<Vec<Program>> {
        let now = Utc::now();
        let end = now + Duration::hours(hours);

        let mut epg_ids = vec![channel_id.to_string()];
        for (epg_id, catalog_id) in self.get_epg_mappings().await? {
            if catalog_id == channel_id {
                epg_ids.push(epg_id);
            }
        }

        let placeholders = vec!["?"; epg_ids.len()].join(",");
        let sql = format!(
            "SELECT id, channel_id, title, sub_title, description, start_time, stop_time, \
                    category, icon \
             FROM programs \
             WHERE channel_id IN ({}) AND stop_time > ? AND start_time < ? \
             ORDER BY start_time",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in &epg_ids {
            query = query.bind(id);
        }
        let rows = query
            .bind(format_timestamp(now))
            .bind(format_timestamp(end))
            .fetch_all(self.pool())
            .await?;

        let mut programs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut program = program_from_row(row)?;
            program.channel_id = channel_id.to_string();
            programs.push(program);
        }
        Ok(programs)
    }

    /// Currently airing programs across all guide channels.
    pub async fn get_now_playing(&self, limit: i64) -> Result<Vec<Program>> {
        let now = format_timestamp(Utc::now());
        let rows = sqlx::query(
            "SELECT id, channel_id, title, sub_title, description, start_time, stop_time, \
                    category, icon \
             FROM programs \
             WHERE start_time <= ? AND stop_time > ? \
             ORDER BY channel_id LIMIT ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(program_from_row).collect()
    }

    /// Current program per catalog channel id, batched. Guide rows stored
    /// under XMLTV ids are translated back through the reverse mapping.
    pub async fn get_now_playing_for_channels(
        &self,
        channel_ids: &[String],
    ) -> Result<HashMap<String, NowPlaying>> {
        if channel_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mappings = self.get_epg_mappings().await?;

        let mut epg_ids: HashSet<String> = HashSet::new();
        let mut channel_to_epg: HashMap<&str, Vec<String>> = HashMap::new();
        for catalog_id in channel_ids {
            epg_ids.insert(catalog_id.clone());
            let entry = channel_to_epg.entry(catalog_id.as_str()).or_default();
            entry.push(catalog_id.clone());
            for (epg_id, mapped) in &mappings {
                if mapped == catalog_id {
                    epg_ids.insert(epg_id.clone());
                    entry.push(epg_id.clone());
                }
            }
        }

        let epg_ids: Vec<String> = epg_ids.into_iter().collect();
        let placeholders = vec!["?"; epg_ids.len()].join(",");
        let now = format_timestamp(Utc::now());
        let sql = format!(
            "SELECT channel_id, title, start_time, stop_time FROM programs \
             WHERE channel_id IN ({}) AND start_time <= ? AND stop_time > ? \
             ORDER BY start_time",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in &epg_ids {
            query = query.bind(id);
        }
        let rows = query
            .bind(&now)
            .bind(&now)
            .fetch_all(self.pool())
            .await?;

        let by_epg_id: HashMap<String, NowPlaying> = rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("channel_id"),
                    NowPlaying {
                        title: row.get("title"),
                        start: row.get("start_time"),
                        stop: row.get("stop_time"),
                    },
                )
            })
            .collect();

        let mut result = HashMap::new();
        for catalog_id in channel_ids {
            if let Some(candidates) = channel_to_epg.get(catalog_id.as_str()) {
                for epg_id in candidates {
                    if let Some(current) = by_epg_id.get(epg_id) {
                        result.insert(catalog_id.clone(), current.clone());
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    pub async fn get_epg_stats(&self) -> Result<EpgStats> {
        let total_programs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM programs")
            .fetch_one(self.pool())
            .await?;
        let channels_with_epg =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(DISTINCT channel_id) FROM programs")
                .fetch_one(self.pool())
                .await?;
        Ok(EpgStats {
            total_programs,
            channels_with_epg,
        })
    }

    pub async fn clear_epg(&self) -> Result<()> {
        sqlx::query("DELETE FROM programs")
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Distinct XMLTV channel ids present in the programs table.
    pub async fn get_unique_epg_channels(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, Option<String>>(
            "SELECT DISTINCT channel_id FROM programs",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().flatten().filter(|id| !id.is_empty()).collect())
    }

    /// Persist the mapping dictionary atomically under one KV entry.
    pub async fn store_epg_mappings(&self, mappings: &EpgMappings) -> Result<()> {
        self.kv_set(
            EPG_MAPPINGS_KEY,
            &serde_json::to_value(mappings)?,
            EPG_MAPPINGS_TTL_SECONDS,
        )
        .await
    }

    pub async fn get_epg_mappings(&self) -> Result<EpgMappings> {
        match self.kv_get(EPG_MAPPINGS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_default()),
            None => Ok(EpgMappings::new()),
        }
    }
}
