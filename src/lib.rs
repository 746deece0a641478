//! Turns Debian netinst ISOs into netboot-ready installer files.
//!
//! A run has two phases:
//!
//! - **Fetch** - discover image URLs and download them in parallel into
//!   `<dest_dir>/<version>/<image>.iso`, skipping files already present
//! - **Transform** - for each downloaded image, extract it, embed the disc's
//!   package pool into the installer initrd, patch the installer to use it,
//!   and publish `initrd-iso.gz` and `vmlinuz` under `<boot_root>/<version>`
//!
//! # Architecture
//!
//! ```text
//! Discovery ──▶ FetchQueue ──▶ FetchWorkerPool ──▶ <dest_dir>/<version>/*.iso
//!                                   │
//!                                   └──▶ ProgressCounters (single reporter)
//!
//! <dest_dir> walk ──▶ TransformPipeline (one image at a time)
//!                        Extract ─▶ UnpackInitrd ─▶ Stage ─▶ Patch ─▶ Repack ─▶ Publish
//! ```
//!
//! Archive handling sits behind [`archive::ArchiveCodec`] and downloads
//! behind [`fetch::Fetch`], so both phases can run against fakes.

pub mod archive;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod transform;

pub use archive::{ArchiveCodec, DiscExtractor, NativeCodec};
pub use config::Config;
pub use discovery::{ArchiveIndexDiscovery, Discovery, StaticDiscovery};
pub use error::{ArtifactError, RunError};
pub use fetch::{CancelFlag, Fetch, HttpFetcher};
pub use orchestrator::{Orchestrator, OrchestratorOptions, RunSummary};
pub use transform::{PipelineOptions, PipelineState, TransformOutcome, TransformPipeline};
