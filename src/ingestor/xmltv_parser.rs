use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use tracing::{error, info, warn};

use super::{FileImporter, ImportSummary};
use crate::database::Database;
use crate::models::{program_id, Program};

/// A `<channel>` definition from the guide. Kept as a side record; only the
/// display name is used downstream.
#[derive(Debug, Clone)]
pub struct GuideChannel {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParsedGuide {
    pub channels: Vec<GuideChannel>,
    pub programs: Vec<Program>,
}

/// Streaming XMLTV parser. Programs are stored under the guide's own channel
/// ids; translation to catalog ids happens at read time via the EPG mapping.
pub struct XmltvParser {
    db: Database,
}

impl XmltvParser {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn parse_file(&self, path: &Path) -> Result<ParsedGuide> {
        if !path.exists() {
            return Err(anyhow!("EPG file not found: {}", path.display()));
        }
        info!("Parsing EPG file: {}", path.display());

        let content = tokio::fs::read_to_string(path).await?;
        let guide = parse_guide(&content)?;
        info!(
            "Parsed {} channels and {} programs from {}",
            guide.channels.len(),
            guide.programs.len(),
            path.display()
        );
        Ok(guide)
    }
}

#[async_trait]
impl FileImporter for XmltvParser {
    async fn import_file(&self, path: &Path) -> Result<ImportSummary> {
        let guide = self.parse_file(path).await?;
        let programs = self.db.store_epg_programs(&guide.programs).await?;
        Ok(ImportSummary {
            files_processed: 1,
            channels: guide.channels.len() as u64,
            programs,
            ..Default::default()
        })
    }
}

pub fn parse_guide(content: &str) -> Result<ParsedGuide> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut guide = ParsedGuide::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"channel" => {
                    if let Some(channel) = parse_channel(&mut reader, &e)? {
                        guide.channels.push(channel);
                    }
                }
                b"programme" => {
                    if let Some(program) = parse_programme(&mut reader, &e)? {
                        guide.programs.push(program);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!(
                    "XML parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
            _ => {}
        }
    }

    Ok(guide)
}

fn attribute(start: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    Ok(start
        .try_get_attribute(name)?
        .map(|attr| attr.unescape_value().map(|v| v.into_owned()))
        .transpose()?)
}

fn parse_channel(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Option<GuideChannel>> {
    let id = attribute(start, b"id")?;

    let mut name: Option<String> = None;
    let mut url: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"display-name" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if name.is_none() {
                        name = Some(text);
                    }
                }
                b"url" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if url.is_none() {
                        url = Some(text);
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"channel" => break,
            Ok(Event::Eof) => return Err(anyhow!("unexpected EOF inside <channel>")),
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    match (id, name) {
        (Some(id), Some(name)) => Ok(Some(GuideChannel { id, name, url })),
        _ => Ok(None),
    }
}

fn parse_programme(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Option<Program>> {
    let channel = attribute(start, b"channel")?;
    let start_raw = attribute(start, b"start")?;
    let stop_raw = attribute(start, b"stop")?;

    let mut title: Option<String> = None;
    let mut sub_title: Option<String> = None;
    let mut description: Option<String> = None;
    let mut category: Option<String> = None;
    let mut icon: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"title" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if title.is_none() {
                        title = Some(text);
                    }
                }
                b"sub-title" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if sub_title.is_none() {
                        sub_title = Some(text);
                    }
                }
                b"desc" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if description.is_none() {
                        description = Some(text);
                    }
                }
                b"category" => {
                    let text = reader.read_text(e.name())?.into_owned();
                    if category.is_none() {
                        category = Some(text);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"icon" => {
                if icon.is_none() {
                    icon = attribute(&e, b"src")?;
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"programme" => break,
            Ok(Event::Eof) => return Err(anyhow!("unexpected EOF inside <programme>")),
            Err(e) => return Err(e.into()),
            _ => {}
        }
    }

    let (Some(channel), Some(start_raw), Some(stop_raw)) = (channel, start_raw, stop_raw) else {
        return Ok(None);
    };

    let (start, stop) = match (
        parse_xmltv_timestamp(&start_raw),
        parse_xmltv_timestamp(&stop_raw),
    ) {
        (Ok(start), Ok(stop)) => (start, stop),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to parse programme date: {}", e);
            return Ok(None);
        }
    };
    if stop <= start {
        warn!("Skipping programme with non-positive duration on {}", channel);
        return Ok(None);
    }

    let title = title.unwrap_or_else(|| "Unknown".to_string());

    Ok(Some(Program {
        id: program_id(&channel, &start_raw, &title),
        channel_id: channel,
        title,
        sub_title,
        description,
        start,
        stop,
        category,
        icon,
    }))
}

/// Parse the XMLTV timestamp format `YYYYMMDDHHMMSS [±ZZZZ]`. A declared
/// offset is honored and the result converted to UTC; a missing offset is
/// treated as UTC.
pub fn parse_xmltv_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim();

    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S %z") {
        return Ok(dt.with_timezone(&Utc));
    }

    let digits = trimmed
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty timestamp"))?;
    let naive = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .map_err(|e| anyhow!("invalid timestamp '{}': {}", s, e))?;
    Ok(naive.and_utc())
}

/// Import every `*_guide.xml` file in a directory. Per-file failures are
/// logged and skipped.
pub async fn import_epg_directory(db: &Database, dir: &Path) -> Result<ImportSummary> {
    let parser = XmltvParser::new(db.clone());

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_guide.xml"))
        })
        .collect();
    paths.sort();

    let mut summary = ImportSummary::default();
    for path in paths {
        match parser.import_file(&path).await {
            Ok(file_summary) => summary.merge(&file_summary),
            Err(e) => error!("Failed to parse {}: {}", path.display(), e),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="ABC.us">
    <display-name>ABC</display-name>
    <url>https://abc.example.com</url>
  </channel>
  <programme start="20251212040000 +0000" stop="20251212050000 +0000" channel="ABC.us">
    <title>Evening News</title>
    <sub-title>Late Edition</sub-title>
    <desc>Daily news roundup.</desc>
    <category>News</category>
    <icon src="https://img.example.com/news.png"/>
  </programme>
  <programme start="20251212050000 +0000" stop="20251212060000 +0000" channel="ABC.us">
    <desc>Program without a title.</desc>
  </programme>
</tv>
"#;

    #[test]
    fn test_parse_guide_channels_and_programs() {
        let guide = parse_guide(GUIDE).unwrap();

        assert_eq!(guide.channels.len(), 1);
        assert_eq!(guide.channels[0].id, "ABC.us");
        assert_eq!(guide.channels[0].name, "ABC");

        assert_eq!(guide.programs.len(), 2);
        let program = &guide.programs[0];
        assert_eq!(program.channel_id, "ABC.us");
        assert_eq!(program.title, "Evening News");
        assert_eq!(program.sub_title.as_deref(), Some("Late Edition"));
        assert_eq!(program.category.as_deref(), Some("News"));
        assert_eq!(
            program.icon.as_deref(),
            Some("https://img.example.com/news.png")
        );
        assert_eq!(program.id.len(), 16);
        assert!(program.stop > program.start);
    }

    #[test]
    fn test_missing_title_defaults_to_unknown() {
        let guide = parse_guide(GUIDE).unwrap();
        assert_eq!(guide.programs[1].title, "Unknown");
    }

    #[test]
    fn test_timestamp_offset_is_honored() {
        let dt = parse_xmltv_timestamp("20251212040000 +0100").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 12, 12, 3, 0, 0).unwrap());

        let dt = parse_xmltv_timestamp("20251212040000 +0000").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 12, 12, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_timestamp_without_offset_is_utc() {
        let dt = parse_xmltv_timestamp("20251212040000").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 12, 12, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_timestamp_is_rejected() {
        assert!(parse_xmltv_timestamp("not-a-date").is_err());
        assert!(parse_xmltv_timestamp("").is_err());
    }

    #[test]
    fn test_programme_with_unparsable_date_is_skipped() {
        let xml = r#"<tv>
  <programme start="garbage" stop="20251212050000" channel="ABC.us">
    <title>Broken</title>
  </programme>
</tv>"#;
        let guide = parse_guide(xml).unwrap();
        assert!(guide.programs.is_empty());
    }
}
