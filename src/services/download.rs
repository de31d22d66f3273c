//! Image download service.
//!
//! Fetches every distinct URL of a job in fixed-size batches: all fetches of a
//! batch run concurrently and the next batch starts only once the whole batch
//! has resolved. Separated from UI concerns - progress goes to the bus.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::progress::ProgressBus;
use crate::fetch::{FetchOutcome, FetchResult, ResourceFetcher};
use crate::models::{Stage, DOWNLOAD_BAND};

/// Default number of concurrent fetches.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Percentage published once every download has resolved.
const DOWNLOADED_PERCENT: u8 = 75;

/// Runs fetches for a set of URLs under a concurrency cap.
#[derive(Clone)]
pub struct DownloadScheduler {
    fetcher: ResourceFetcher,
    concurrency: usize,
}

impl DownloadScheduler {
    /// Create a scheduler. A concurrency of zero is treated as one.
    pub fn new(fetcher: ResourceFetcher, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every URL once, publishing a `downloading` event per completion
    /// and a final `downloaded` event.
    ///
    /// Returns one result per URL, in completion order.
    pub async fn download_all(
        &self,
        job_id: &str,
        urls: &[&str],
        bus: &ProgressBus,
    ) -> Vec<FetchResult> {
        let total = urls.len();
        let mut results = Vec::with_capacity(total);
        let mut completed = 0;

        for (batch_no, batch) in urls.chunks(self.concurrency).enumerate() {
            debug!(
                "Job {}: starting download batch {} ({} urls)",
                job_id,
                batch_no + 1,
                batch.len()
            );

            let mut in_flight: FuturesUnordered<_> =
                batch.iter().map(|url| self.fetcher.fetch(url)).collect();

            while let Some(result) = in_flight.next().await {
                completed += 1;

                if let FetchOutcome::Failed { reason, attempts } = &result.outcome {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        result.url, attempts, reason
                    );
                }

                bus.publish(
                    job_id,
                    Stage::Downloading,
                    format!("downloading images {}/{}", completed, total),
                    DOWNLOAD_BAND.at(completed, total),
                );
                results.push(result);
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed > 0 {
            warn!("Job {}: {} of {} downloads failed", job_id, failed, total);
        }

        bus.publish(
            job_id,
            Stage::Downloaded,
            "images downloaded, embedding",
            DOWNLOADED_PERCENT,
        );
        results
    }
}
