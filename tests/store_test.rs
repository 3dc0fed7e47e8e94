//! Store integration tests against an in-memory database: upsert behavior,
//! playability derivation, health scheduling and EPG mapping reads.

use std::collections::HashMap;

use iptv_gateway::database::{ChannelFilters, Database};
use iptv_gateway::models::*;

async fn store() -> Database {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    db.initialize().await.unwrap();
    db
}

fn channel(id: &str, name: &str, country: &str) -> UpstreamChannel {
    UpstreamChannel {
        id: id.to_string(),
        name: name.to_string(),
        alt_names: Vec::new(),
        network: None,
        country: country.to_string(),
        categories: Vec::new(),
        is_nsfw: false,
        launched: None,
        closed: None,
        replaced_by: None,
        website: None,
    }
}

fn stream(url: &str, channel: &str) -> UpstreamStream {
    UpstreamStream {
        channel: Some(channel.to_string()),
        feed: None,
        title: String::new(),
        url: url.to_string(),
        referrer: None,
        user_agent: None,
        quality: None,
    }
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let db = store().await;
    // A second run must tolerate existing tables, columns and indexes.
    db.initialize().await.unwrap();
}

#[tokio::test]
async fn test_channel_upsert_preserves_unmentioned_rows() {
    let db = store().await;

    db.upsert_channels(&[
        channel("ch1", "Channel One", "US"),
        channel("ch2", "Channel Two", "UK"),
    ])
    .await
    .unwrap();

    db.upsert_channels(&[
        channel("ch2", "Channel Two Updated", "UK"),
        channel("ch3", "Channel Three", "CA"),
    ])
    .await
    .unwrap();

    let filters = ChannelFilters {
        playable_only: false,
        ..Default::default()
    };
    let (channels, total) = db.get_channels(&filters, 1, 100).await.unwrap();
    assert_eq!(total, 3);

    let ch2 = channels
        .iter()
        .find(|c| c.channel.id == "ch2")
        .expect("ch2 present");
    assert_eq!(ch2.channel.name, "Channel Two Updated");
    assert!(channels.iter().any(|c| c.channel.id == "ch1"));
}

#[tokio::test]
async fn test_channel_upsert_applied_twice_is_idempotent() {
    let db = store().await;
    let batch = [channel("ch1", "One", "US"), channel("ch2", "Two", "UK")];

    db.upsert_channels(&batch).await.unwrap();
    db.upsert_channels(&batch).await.unwrap();

    assert_eq!(db.count_channels().await.unwrap(), 2);
}

#[tokio::test]
async fn test_stream_ids_are_stable_across_reimports() {
    let db = store().await;
    let batch = [
        stream("https://example.com/stream1.m3u8", "ch1"),
        stream("https://example.com/stream2.m3u8", "ch2"),
    ];

    db.upsert_streams(&batch).await.unwrap();
    db.upsert_streams(&batch).await.unwrap();

    let expected = stable_stream_id("https://example.com/stream1.m3u8", "ch1");
    let found = db.get_stream_by_id(&expected).await.unwrap();
    assert!(found.is_some(), "stream with derived id should exist");

    let stats = db.get_stream_stats().await.unwrap();
    assert_eq!(stats.total_streams, 2, "re-import must not duplicate rows");
}

#[tokio::test]
async fn test_reimport_preserves_health_columns() {
    let db = store().await;
    let batch = [stream("https://example.com/stream1.m3u8", "ch1")];
    db.upsert_streams(&batch).await.unwrap();

    let id = stable_stream_id("https://example.com/stream1.m3u8", "ch1");
    db.update_stream_health(&id, HealthStatus::Working, Some(120), None, None)
        .await
        .unwrap();

    db.upsert_streams(&batch).await.unwrap();

    let row = db.get_stream_by_id(&id).await.unwrap().unwrap();
    assert_eq!(row.health_status, HealthStatus::Working);
    assert_eq!(row.health_response_ms, Some(120));
}

#[tokio::test]
async fn test_playability_derivation_and_filter() {
    let db = store().await;

    db.upsert_channels(&[
        channel("ch1", "One", "US"),
        channel("ch2", "Two", "UK"),
        channel("ch3", "Three", "CA"),
    ])
    .await
    .unwrap();
    db.upsert_streams(&[stream("http://a", "ch1"), stream("http://b", "ch2")])
        .await
        .unwrap();

    let counts = db.recompute_channel_stream_counts().await.unwrap();
    assert_eq!(counts.playable, 2);
    assert_eq!(counts.total, 3);

    let playable = ChannelFilters {
        playable_only: true,
        ..Default::default()
    };
    let (channels, total) = db.get_channels(&playable, 1, 100).await.unwrap();
    let ids: Vec<&str> = channels.iter().map(|c| c.channel.id.as_str()).collect();

    assert_eq!(total, 2);
    assert!(ids.contains(&"ch1"));
    assert!(ids.contains(&"ch2"));
    assert!(!ids.contains(&"ch3"));

    for entry in &channels {
        assert!(entry.channel.has_streams);
        assert_eq!(entry.channel.stream_count > 0, entry.channel.has_streams);
    }

    let all = ChannelFilters {
        playable_only: false,
        ..Default::default()
    };
    let (_, total) = db.get_channels(&all, 1, 100).await.unwrap();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_get_channels_hydrates_stream_health() {
    let db = store().await;

    db.upsert_channels(&[channel("ch1", "One", "US")]).await.unwrap();
    db.upsert_streams(&[stream("http://a", "ch1")]).await.unwrap();
    db.recompute_channel_stream_counts().await.unwrap();

    let id = stable_stream_id("http://a", "ch1");
    db.update_stream_health(
        &id,
        HealthStatus::Warning,
        Some(50),
        Some("403 Forbidden (possible geo-block)"),
        None,
    )
    .await
    .unwrap();

    let (channels, _) = db
        .get_channels(&ChannelFilters::default(), 1, 10)
        .await
        .unwrap();
    // playable_only defaults false on the raw struct; ch1 is playable anyway
    let ch1 = channels.iter().find(|c| c.channel.id == "ch1").unwrap();
    assert_eq!(ch1.streams.len(), 1);
    assert_eq!(ch1.streams[0].health_status, HealthStatus::Warning);
    assert_eq!(
        ch1.streams[0].health_error.as_deref(),
        Some("403 Forbidden (possible geo-block)")
    );
}

#[tokio::test]
async fn test_closed_channels_are_hidden() {
    let db = store().await;

    let mut closed = channel("old", "Closed Channel", "US");
    closed.closed = Some("2020-01-01".to_string());
    db.upsert_channels(&[closed, channel("live", "Live Channel", "US")])
        .await
        .unwrap();

    let filters = ChannelFilters {
        playable_only: false,
        ..Default::default()
    };
    let (channels, total) = db.get_channels(&filters, 1, 100).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(channels[0].channel.id, "live");
}

#[tokio::test]
async fn test_unchecked_streams_and_schedule_gating() {
    let db = store().await;
    db.upsert_streams(&[stream("http://a", "ch1"), stream("http://b", "ch2")])
        .await
        .unwrap();

    let due = db.get_unchecked_streams(10).await.unwrap();
    assert_eq!(due.len(), 2, "never-checked streams are due immediately");
    assert!(due.iter().all(|s| !s.url.is_empty()));

    // A fresh check with a future next_check_due takes the stream out of
    // the queue.
    let id = stable_stream_id("http://a", "ch1");
    db.update_stream_health(
        &id,
        HealthStatus::Working,
        Some(80),
        None,
        Some(chrono::Utc::now() + chrono::Duration::hours(6)),
    )
    .await
    .unwrap();

    let due = db.get_unchecked_streams(10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_ne!(due[0].id, id);
}

#[tokio::test]
async fn test_health_stats_and_recent_updates() {
    let db = store().await;
    db.upsert_streams(&[stream("http://a", "ch1"), stream("http://b", "ch2")])
        .await
        .unwrap();

    let id = stable_stream_id("http://a", "ch1");
    db.update_stream_health(&id, HealthStatus::Failed, None, Some("Timeout"), None)
        .await
        .unwrap();

    let stats = db.get_health_stats().await.unwrap();
    assert_eq!(stats.get("failed"), Some(&1));
    assert_eq!(stats.get("unknown"), Some(&1));

    let updates = db.get_recent_health_updates(60).await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, id);
    assert_eq!(updates[0].health_error.as_deref(), Some("Timeout"));
}

#[tokio::test]
async fn test_kv_ttl_and_expiry() {
    let db = store().await;

    db.kv_set("languages", &serde_json::json!(["en", "fr"]), 3600)
        .await
        .unwrap();
    assert_eq!(
        db.kv_get("languages").await.unwrap(),
        Some(serde_json::json!(["en", "fr"]))
    );

    // An already-expired entry is invisible to reads and swept by cleanup.
    db.kv_set("stale", &serde_json::json!(1), -1).await.unwrap();
    assert_eq!(db.kv_get("stale").await.unwrap(), None);
    let removed = db.clear_expired().await.unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_epg_reads_resolve_through_reverse_mapping() {
    let db = store().await;

    let now = chrono::Utc::now();
    let program = Program {
        id: program_id("ABC.us@East", "now", "Live Show"),
        channel_id: "ABC.us@East".to_string(),
        title: "Live Show".to_string(),
        sub_title: Some("Part 1".to_string()),
        description: None,
        start: now - chrono::Duration::minutes(10),
        stop: now + chrono::Duration::minutes(50),
        category: None,
        icon: None,
    };
    db.store_epg_programs(&[program]).await.unwrap();

    let mappings: EpgMappings =
        HashMap::from([("ABC.us@East".to_string(), "ABC.us".to_string())]);
    db.store_epg_mappings(&mappings).await.unwrap();

    // Programs stored under the XMLTV id resolve under the catalog id.
    let programs = db.get_epg_for_channel("ABC.us", 24).await.unwrap();
    assert_eq!(programs.len(), 1);
    assert_eq!(programs[0].channel_id, "ABC.us");
    assert_eq!(programs[0].sub_title.as_deref(), Some("Part 1"));

    let now_playing = db
        .get_now_playing_for_channels(&["ABC.us".to_string()])
        .await
        .unwrap();
    assert_eq!(now_playing.get("ABC.us").map(|p| p.title.as_str()), Some("Live Show"));

    let stats = db.get_epg_stats().await.unwrap();
    assert_eq!(stats.total_programs, 1);

    db.clear_epg().await.unwrap();
    assert_eq!(db.get_epg_stats().await.unwrap().total_programs, 0);
}

#[tokio::test]
async fn test_store_epg_programs_upserts_on_id() {
    let db = store().await;
    let now = chrono::Utc::now();

    let mut program = Program {
        id: program_id("CNN.us", "20250101", "Newsroom"),
        channel_id: "CNN.us".to_string(),
        title: "Newsroom".to_string(),
        sub_title: None,
        description: None,
        start: now,
        stop: now + chrono::Duration::hours(1),
        category: None,
        icon: None,
    };
    db.store_epg_programs(std::slice::from_ref(&program)).await.unwrap();

    program.description = Some("Updated".to_string());
    db.store_epg_programs(&[program]).await.unwrap();

    let stats = db.get_epg_stats().await.unwrap();
    assert_eq!(stats.total_programs, 1);
}

#[tokio::test]
async fn test_category_and_provider_filters() {
    let db = store().await;

    let mut news = channel("news1", "News One", "US");
    news.categories = vec!["news".to_string()];
    let mut sports = channel("sports1", "Sports One", "US");
    sports.categories = vec!["sports".to_string()];
    db.upsert_channels(&[news, sports]).await.unwrap();

    db.upsert_m3u_streams(&[M3uStream {
        id: m3u_stream_id("http://n", "US", "pluto"),
        channel_id: Some("news1".to_string()),
        feed: None,
        title: "News One".to_string(),
        url: "http://n".to_string(),
        quality: None,
        country: Some("US".to_string()),
        provider: Some("pluto".to_string()),
        source_file: "us_pluto.m3u".to_string(),
    }])
    .await
    .unwrap();
    db.recompute_channel_stream_counts().await.unwrap();

    let by_category = ChannelFilters {
        category: Some("news".to_string()),
        playable_only: false,
        ..Default::default()
    };
    let (channels, total) = db.get_channels(&by_category, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(channels[0].channel.id, "news1");

    let by_provider = ChannelFilters {
        provider: Some("pluto".to_string()),
        playable_only: false,
        ..Default::default()
    };
    let (channels, total) = db.get_channels(&by_provider, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(channels[0].channel.id, "news1");

    let providers = db.get_providers().await.unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].id, "pluto");
    assert_eq!(providers[0].stream_count, 1);
}
