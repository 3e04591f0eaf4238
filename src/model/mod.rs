/// Static model artifact table
pub mod catalog;
/// Download, verification, and cache lifecycle
pub mod manager;

pub use catalog::{artifact_filename, CatalogEntry, CATALOG};
pub use manager::{
    DownloadProgress, EnsureTask, FetchError, HttpFetcher, ModelDescriptor, ModelFetcher,
    ModelManager, ModelSpec, ModelStatus, Prefetcher, ProgressFn,
};
