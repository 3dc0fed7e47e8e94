//! Local file importers: M3U playlists and XMLTV program guides.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

pub mod m3u_parser;
pub mod xmltv_parser;

pub use m3u_parser::{import_m3u_directory, M3uParser};
pub use xmltv_parser::{import_epg_directory, XmltvParser};

/// Counts reported by a directory import. Importers fill in the fields
/// relevant to their format and leave the rest at zero.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub files_processed: u32,
    pub streams: u64,
    pub channels: u64,
    pub programs: u64,
}

impl ImportSummary {
    pub fn merge(&mut self, other: &ImportSummary) {
        self.files_processed += other.files_processed;
        self.streams += other.streams;
        self.channels += other.channels;
        self.programs += other.programs;
    }
}

/// A file importer ingests one local file into the store and reports counts.
#[async_trait]
pub trait FileImporter {
    async fn import_file(&self, path: &Path) -> Result<ImportSummary>;
}
