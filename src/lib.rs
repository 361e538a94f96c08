//! Segmented, resumable HTTP downloads.
//!
//! A [`Downloader`] resolves each URL with a `HEAD` request, splits known-size
//! files into byte ranges fetched in parallel, and writes every range in place
//! into a preallocated destination file. Transfers can be paused, resumed from
//! their per-segment checkpoints, cancelled and retried; a global cap decides
//! how many of them run at once, the rest wait in `hold`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use segdl::{Downloader, EngineConfig, NoopObserver};
//!
//! # async fn run() -> segdl::Result<()> {
//! let downloader = Downloader::new(EngineConfig::default(), Arc::new(NoopObserver));
//! let record = downloader
//!     .enqueue("https://example.com/file.iso", "downloads", None)
//!     .await?;
//! downloader.pause(&record.destination_path)?;
//! downloader.resume(&record.destination_path)?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod downloader;
pub mod error;
pub mod observer;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod utils;
pub mod worker;

pub use config::EngineConfig;
pub use downloader::{Downloader, Summary};
pub use error::{DownloadError, Result};
pub use observer::{NoopObserver, TransferEvent, TransferObserver};
pub use state::{TransferRecord, TransferStatus};
