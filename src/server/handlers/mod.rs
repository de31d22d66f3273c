//! HTTP request handlers.

mod api;
mod jobs;

pub use api::health;
pub use jobs::{download_output, job_progress, upload_workbook};
