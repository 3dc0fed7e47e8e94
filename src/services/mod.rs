pub mod catalog_sync;
pub mod epg_mapper;
pub mod geo_bypass;
pub mod health_worker;
pub mod stream_proxy;
pub mod transcoder;
