//! Persistence + HTTP fetch utilities for Roomfeed.
//!
//! The SQLite store is the single source of truth; the image file store and
//! the perceptual-hash column are derivable from it and safe to rebuild.

pub mod db;
pub mod files;
pub mod http;

pub const CRATE_NAME: &str = "roomfeed-storage";

pub use db::{
    DownloadFilter, ImageFilter, ImageStore, NewImage, OrderBy, StoreError, StoreStats,
    UpsertOutcome,
};
pub use files::{FileStore, StoredImage};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
