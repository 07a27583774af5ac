//! nimbus-transfer: encrypted chunked transfer engine
//!
//! ```text
//! Client ──> DownloadEngine / UploadEngine ──> Session ──> RequestExecutor ──> StorageApi
//!                  │            │                 └── AuthRefreshGate (401 → refresh → replay once)
//!                  │            └── S3Coordinator (direct parts + completion polling)
//!                  └── ChunkCodec (nimbus-crypto)
//! ```
//!
//! Engines are owned by one task. Distinct transfers share only the session,
//! whose credential refresh is serialized by the gate.

pub mod api;
pub mod auth;
pub mod client;
pub mod download;
pub mod driver;
pub mod executor;
pub mod http;
pub mod keys;
pub mod listener;
pub mod s3;
pub mod session;
pub mod upload;

pub use api::{Credentials, StorageApi, TokenRefresher};
pub use auth::AuthRefreshGate;
pub use client::{Client, ClientBuilder, NoRefresh};
pub use download::{DownloadEngine, DownloadState};
pub use driver::{download_to_writer, spawn_download, spawn_upload, upload_from_reader, TransferHandle};
pub use executor::RequestExecutor;
pub use http::HttpApi;
pub use keys::{FileKeyManager, MISSING_KEYS_BATCH};
pub use listener::{NoopListener, ProgressThrottle, TransferListener};
pub use s3::{PollPolicy, S3Coordinator};
pub use session::Session;
pub use upload::{UploadEngine, UploadState, S3_MIN_CHUNK_SIZE};
