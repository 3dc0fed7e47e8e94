//! EPG mapper: resolves XMLTV channel ids (`ABC.us@East`, `KACVDT1.us@SD`)
//! to catalog channel ids (`ABC.us`, `KACV.us`).
//!
//! Strategies are applied in order, first hit wins: direct equality, feed
//! suffix stripping, a normalized-name index, DT/HD/SD callsign suffix
//! stripping, and finally fuzzy similarity over the name index.

use anyhow::Result;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::database::Database;
use crate::models::{EpgMappings, MappingSummary};
use crate::utils::sequence_ratio;

/// Threshold for one-off lookups; batch mapping uses a stricter one.
pub const FUZZY_THRESHOLD: f64 = 0.75;
const BATCH_FUZZY_THRESHOLD: f64 = 0.8;

/// Score bonus when the candidate's country suffix matches the XMLTV id's.
const COUNTRY_BOOST: f64 = 0.10;

pub struct EpgMapper {
    db: Database,
    channel_ids: HashSet<String>,
    /// Exact lookups over normalized names.
    name_index: HashMap<String, String>,
    /// Same entries in insertion order, so fuzzy ties resolve to first seen.
    ordered_names: Vec<(String, String)>,
    suffix_re: Regex,
    callsign_re: Regex,
}

impl EpgMapper {
    pub fn new(db: Database) -> Result<Self> {
        Ok(Self {
            db,
            channel_ids: HashSet::new(),
            name_index: HashMap::new(),
            ordered_names: Vec::new(),
            suffix_re: Regex::new(r"(?i)\s*(hd|sd|4k|fhd|uhd|\d+p)\s*$")?,
            callsign_re: Regex::new(r"(?i)(dt\d?|hd|sd)$")?,
        })
    }

    /// Load the catalog into memory: channel ids for equality checks plus a
    /// normalized-name index built from each channel's id prefix, display
    /// name and alternate names.
    pub async fn load_channels(&mut self) -> Result<()> {
        let channels = self.db.get_all_channels().await?;

        self.channel_ids.clear();
        self.name_index.clear();
        self.ordered_names.clear();

        for channel in &channels {
            self.channel_ids.insert(channel.id.clone());

            let prefix = channel.id.split('.').next().unwrap_or("");
            let mut keys = vec![self.normalize_name(prefix), self.normalize_name(&channel.name)];
            for alt in &channel.alt_names {
                keys.push(self.normalize_name(alt));
            }

            for key in keys {
                if key.is_empty() || self.name_index.contains_key(&key) {
                    continue;
                }
                self.name_index.insert(key.clone(), channel.id.clone());
                self.ordered_names.push((key, channel.id.clone()));
            }
        }

        info!(
            "EPG mapper loaded {} channels ({} name keys)",
            self.channel_ids.len(),
            self.name_index.len()
        );
        Ok(())
    }

    /// Lowercase, drop a trailing quality token, strip non-alphanumerics.
    fn normalize_name(&self, name: &str) -> String {
        let lower = name.to_lowercase();
        let stripped = self.suffix_re.replace(&lower, "");
        stripped.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }

    /// Strategies 1-4; no fuzzy matching.
    pub fn map_channel_id(&self, epg_id: &str) -> Option<String> {
        if epg_id.is_empty() {
            return None;
        }

        // 1. direct equality
        if self.channel_ids.contains(epg_id) {
            return Some(epg_id.to_string());
        }

        // 2. strip the feed suffix (@East, @SD, ...)
        let base = epg_id.split('@').next().unwrap_or(epg_id);
        if self.channel_ids.contains(base) {
            return Some(base.to_string());
        }

        let (channel_part, country) = match base.split_once('.') {
            Some((channel, country)) => (channel, Some(country)),
            None => (base, None),
        };

        // 3. normalized-name index
        let normalized = self.normalize_name(channel_part);
        if let Some(id) = self.name_index.get(&normalized) {
            return Some(id.clone());
        }

        // 4. strip a trailing DT/HD/SD callsign suffix and retry equality
        if let Some(country) = country {
            let stripped = self.callsign_re.replace(channel_part, "");
            if stripped != channel_part {
                let candidate = format!("{}.{}", stripped, country);
                if self.channel_ids.contains(&candidate) {
                    return Some(candidate);
                }
            }
        }

        None
    }

    /// Strategy 5: best sequence-ratio candidate over the name index, with a
    /// country-suffix boost. Ties keep the first-seen candidate.
    pub fn fuzzy_match(&self, epg_id: &str, threshold: f64) -> Option<String> {
        let base = epg_id.split('@').next().unwrap_or(epg_id);
        let (channel_part, country) = match base.split_once('.') {
            Some((channel, country)) => (channel, Some(country.to_lowercase())),
            None => (base, None),
        };

        let normalized = self.normalize_name(channel_part);
        if normalized.is_empty() {
            return None;
        }

        let mut best: Option<(&str, f64)> = None;
        for (key, candidate_id) in &self.ordered_names {
            let mut score = sequence_ratio(&normalized, key);
            if let Some(country) = &country {
                if candidate_id
                    .to_lowercase()
                    .ends_with(&format!(".{}", country))
                {
                    score += COUNTRY_BOOST;
                }
            }
            if score >= threshold && best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate_id.as_str(), score));
            }
        }

        best.map(|(id, _)| id.to_string())
    }

    /// Strategies 1-5 with the default threshold. The bool marks a fuzzy hit.
    pub fn resolve(&self, epg_id: &str) -> Option<(String, bool)> {
        self.resolve_with_threshold(epg_id, FUZZY_THRESHOLD)
    }

    fn resolve_with_threshold(&self, epg_id: &str, threshold: f64) -> Option<(String, bool)> {
        if let Some(id) = self.map_channel_id(epg_id) {
            return Some((id, false));
        }
        self.fuzzy_match(epg_id, threshold).map(|id| (id, true))
    }

    /// Map every distinct XMLTV channel id found in the programs table and
    /// persist the resulting dictionary atomically.
    pub async fn map_all(&mut self) -> Result<MappingSummary> {
        self.load_channels().await?;
        let epg_channels = self.db.get_unique_epg_channels().await?;

        let mut mappings = EpgMappings::new();
        let mut fuzzy_matched = 0usize;
        let mut unmapped = Vec::new();

        for epg_id in &epg_channels {
            match self.resolve_with_threshold(epg_id, BATCH_FUZZY_THRESHOLD) {
                Some((catalog_id, fuzzy)) => {
                    if fuzzy {
                        fuzzy_matched += 1;
                    }
                    mappings.insert(epg_id.clone(), catalog_id);
                }
                None => unmapped.push(epg_id.clone()),
            }
        }

        self.db.store_epg_mappings(&mappings).await?;

        let total = epg_channels.len();
        let mapped = mappings.len();
        let mapping_rate = if total > 0 {
            format!("{:.1}%", mapped as f64 / total as f64 * 100.0)
        } else {
            "0%".to_string()
        };
        info!(
            "EPG mapping complete: {}/{} mapped ({} fuzzy)",
            mapped, total, fuzzy_matched
        );

        Ok(MappingSummary {
            total,
            mapped,
            fuzzy_matched,
            unmapped: unmapped.len(),
            mapping_rate,
            sample_unmapped: unmapped.into_iter().take(10).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpstreamChannel;

    fn channel(id: &str, name: &str) -> UpstreamChannel {
        UpstreamChannel {
            id: id.to_string(),
            name: name.to_string(),
            alt_names: Vec::new(),
            network: None,
            country: id.rsplit('.').next().unwrap_or("").to_uppercase(),
            categories: Vec::new(),
            is_nsfw: false,
            launched: None,
            closed: None,
            replaced_by: None,
            website: None,
        }
    }

    async fn mapper_with(channels: &[UpstreamChannel]) -> EpgMapper {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db.upsert_channels(channels).await.unwrap();
        let mut mapper = EpgMapper::new(db).unwrap();
        mapper.load_channels().await.unwrap();
        mapper
    }

    #[tokio::test]
    async fn test_direct_and_feed_stripped_match() {
        let mapper = mapper_with(&[channel("ABC.us", "ABC"), channel("CNN.us", "CNN")]).await;

        assert_eq!(mapper.map_channel_id("ABC.us"), Some("ABC.us".to_string()));
        assert_eq!(
            mapper.map_channel_id("ABC.us@East"),
            Some("ABC.us".to_string())
        );
    }

    #[tokio::test]
    async fn test_callsign_suffix_strip() {
        let mapper = mapper_with(&[channel("KACV.us", "KACV")]).await;
        assert_eq!(
            mapper.map_channel_id("KACVDT1.us@SD"),
            Some("KACV.us".to_string())
        );
    }

    #[tokio::test]
    async fn test_unmapped_returns_none() {
        let mapper = mapper_with(&[channel("ABC.us", "ABC")]).await;
        assert_eq!(mapper.map_channel_id("UnknownXYZ.zz"), None);
        assert_eq!(mapper.resolve("UnknownXYZ.zz"), None);
    }

    #[tokio::test]
    async fn test_normalized_name_match() {
        let mapper = mapper_with(&[channel("FoxNews.us", "Fox News")]).await;
        // "foxnews" normalizes to the indexed display name
        assert_eq!(
            mapper.map_channel_id("FOXNEWS.us"),
            Some("FoxNews.us".to_string())
        );
    }

    #[tokio::test]
    async fn test_direct_match_wins_over_fuzzy() {
        let mapper =
            mapper_with(&[channel("ABC.us", "ABC"), channel("ABCNews.us", "ABC News")]).await;
        let (id, fuzzy) = mapper.resolve("ABC.us").unwrap();
        assert_eq!(id, "ABC.us");
        assert!(!fuzzy);
    }

    #[tokio::test]
    async fn test_fuzzy_country_boost_prefers_same_country() {
        let mapper = mapper_with(&[
            channel("Nationwide.uk", "Nationwide"),
            channel("Nationwides.us", "Nationwides"),
        ])
        .await;

        // Both candidates are close; the .us boost must decide it.
        let result = mapper.fuzzy_match("Nationwidez.us", FUZZY_THRESHOLD);
        assert_eq!(result, Some("Nationwides.us".to_string()));
    }

    #[tokio::test]
    async fn test_batch_mapping_summary() {
        let mapper = mapper_with(&[channel("ABC.us", "ABC"), channel("CNN.us", "CNN")]).await;
        let db = mapper.db.clone();

        let programs = [
            ("ABC.us@East", "Morning Show"),
            ("CNN.us", "Newsroom"),
            ("Unknown.xx", "Mystery"),
        ];
        let mut rows = Vec::new();
        for (channel_id, title) in programs {
            rows.push(crate::models::Program {
                id: crate::models::program_id(channel_id, "20250101000000", title),
                channel_id: channel_id.to_string(),
                title: title.to_string(),
                sub_title: None,
                description: None,
                start: chrono::Utc::now(),
                stop: chrono::Utc::now() + chrono::Duration::hours(1),
                category: None,
                icon: None,
            });
        }
        db.store_epg_programs(&rows).await.unwrap();

        let mut mapper = mapper;
        let summary = mapper.map_all().await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.mapped, 2);
        assert_eq!(summary.unmapped, 1);
        assert_eq!(summary.sample_unmapped, vec!["Unknown.xx".to_string()]);

        let stored = db.get_epg_mappings().await.unwrap();
        assert_eq!(stored.get("ABC.us@East"), Some(&"ABC.us".to_string()));
        assert_eq!(stored.get("CNN.us"), Some(&"CNN.us".to_string()));
    }
}
