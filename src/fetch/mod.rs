//! Bounded-concurrency image download.
//!
//! - [`queue`] - [`FetchTask`] and the bounded [`FetchQueue`]
//! - [`pool`] - [`FetchWorkerPool`] and its [`CancelFlag`]
//! - [`http`] - the [`Fetch`] seam and the streaming [`HttpFetcher`]
//! - [`progress`] - completion events and the single progress reporter
//!
//! ```text
//! producer ──enqueue──▶ FetchQueue ──dequeue──▶ worker × N ──Completion──▶ reporter
//! ```

pub mod http;
pub mod pool;
pub mod progress;
pub mod queue;

pub use http::{Fetch, HttpFetcher};
pub use pool::{CancelFlag, FetchWorkerPool};
pub use progress::{Completion, FetchOutcome, ProgressCounters, ProgressUpdate};
pub use queue::{version_dir_name, FetchQueue, FetchTask, QueueError};
