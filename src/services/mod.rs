//! Service layer for imagesheet business logic.
//!
//! This module contains domain logic separated from UI concerns.
//! Services can be used by CLI, web server, or other interfaces.

pub mod download;
pub mod embed;
pub mod jobs;
pub mod pipeline;
pub mod progress;
pub mod scan;

pub use download::{DownloadScheduler, DEFAULT_CONCURRENCY};
pub use embed::{embed_images, EmbedError, EmbedReport};
pub use jobs::{new_job_id, JobManager, JobOptions};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
pub use progress::{ProgressBus, Subscription};
pub use scan::{detect_extension, scan_document, ImageReference, ReferenceIndex};
