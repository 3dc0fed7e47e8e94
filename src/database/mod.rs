use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};
use tracing::info;

pub mod channels;
pub mod epg;
pub mod kv;
pub mod streams;

pub use channels::ChannelFilters;

/// The store: a SQLite database owning all persisted state (catalog, stream
/// health columns, EPG programs and the TTL key-value cache).
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn connect(database_path: &str) -> Result<Self> {
        let url = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite://{}", database_path)
        };

        let in_memory = url.contains(":memory:");

        if !in_memory {
            if let Some(parent) = std::path::Path::new(database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            if !Sqlite::database_exists(&url).await? {
                Sqlite::create_database(&url).await?;
            }
        }

        // An in-memory database is per-connection; pin the pool to one
        // connection so every caller sees the same schema.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await?
        } else {
            SqlitePoolOptions::new().connect(&url).await?
        };

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Create tables, add late columns and build indexes.
    ///
    /// Every step is idempotent and additive; existing rows are never
    /// dropped. Late columns cover databases created by earlier versions.
    pub async fn initialize(&self) -> Result<()> {
        let tables = [
            r#"CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                alt_names TEXT NOT NULL DEFAULT '[]',
                network TEXT,
                country TEXT NOT NULL DEFAULT '',
                categories TEXT NOT NULL DEFAULT '[]',
                is_nsfw INTEGER NOT NULL DEFAULT 0,
                launched TEXT,
                closed TEXT,
                replaced_by TEXT,
                website TEXT,
                has_streams INTEGER NOT NULL DEFAULT 0,
                stream_count INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS streams (
                id TEXT PRIMARY KEY,
                channel_id TEXT,
                feed TEXT,
                title TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                referrer TEXT,
                user_agent TEXT,
                quality TEXT,
                country TEXT,
                provider TEXT,
                health_status TEXT NOT NULL DEFAULT 'unknown',
                health_checked_at TEXT,
                health_response_ms INTEGER,
                health_error TEXT,
                next_check_due TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                channel_count INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS countries (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                languages TEXT NOT NULL DEFAULT '[]',
                flag TEXT NOT NULL DEFAULT '',
                channel_count INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS logos (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                feed TEXT,
                url TEXT NOT NULL,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                format TEXT,
                tags TEXT NOT NULL DEFAULT '[]'
            )"#,
            r#"CREATE TABLE IF NOT EXISTS programs (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                title TEXT NOT NULL,
                sub_title TEXT,
                description TEXT,
                start_time TEXT NOT NULL,
                stop_time TEXT NOT NULL,
                category TEXT,
                icon TEXT
            )"#,
        ];

        for sql in tables {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        // Late columns for databases created before these fields existed.
        let late_columns = [
            "ALTER TABLE streams ADD COLUMN health_status TEXT DEFAULT 'unknown'",
            "ALTER TABLE streams ADD COLUMN health_checked_at TEXT",
            "ALTER TABLE streams ADD COLUMN health_response_ms INTEGER",
            "ALTER TABLE streams ADD COLUMN health_error TEXT",
            "ALTER TABLE streams ADD COLUMN next_check_due TEXT",
            "ALTER TABLE streams ADD COLUMN country TEXT",
            "ALTER TABLE streams ADD COLUMN provider TEXT",
            "ALTER TABLE channels ADD COLUMN has_streams INTEGER DEFAULT 0",
            "ALTER TABLE channels ADD COLUMN stream_count INTEGER DEFAULT 0",
            "ALTER TABLE programs ADD COLUMN sub_title TEXT",
        ];

        for sql in late_columns {
            self.add_column(sql).await?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_channels_country ON channels(country)",
            "CREATE INDEX IF NOT EXISTS idx_channels_has_streams ON channels(has_streams)",
            "CREATE INDEX IF NOT EXISTS idx_streams_channel ON streams(channel_id)",
            "CREATE INDEX IF NOT EXISTS idx_streams_health ON streams(health_status)",
            "CREATE INDEX IF NOT EXISTS idx_streams_next_check ON streams(next_check_due)",
            "CREATE INDEX IF NOT EXISTS idx_logos_channel ON logos(channel_id)",
            "CREATE INDEX IF NOT EXISTS idx_programs_channel ON programs(channel_id)",
            "CREATE INDEX IF NOT EXISTS idx_programs_time ON programs(start_time, stop_time)",
        ];

        for sql in indexes {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        info!("Database schema initialized");
        Ok(())
    }

    async fn add_column(&self, sql: &str) -> Result<()> {
        match sqlx::query(sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
