//! Bulk ingestion of per-cell hourly population series from a relational
//! row store into a dense `[hours, cells]` chunked array.

pub mod config;
pub mod export;
pub mod matrix;
pub mod mesh;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod store;
pub mod timeline;
pub mod wire;
