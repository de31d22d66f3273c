//! Per-job progress publish/subscribe.
//!
//! The bus keeps the latest event for every job and fans new events out to
//! live subscribers. A new subscriber first receives a synthetic `connected`
//! event, then the stored snapshot (if any), then everything published after.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::models::{ProgressEvent, Stage};

#[derive(Default)]
struct JobChannel {
    latest: Option<ProgressEvent>,
    subscribers: Vec<(u64, UnboundedSender<ProgressEvent>)>,
    /// Set once live streams were torn down; later subscribers get the
    /// snapshot only.
    closed: bool,
}

/// Shared progress registry. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct ProgressBus {
    jobs: Arc<Mutex<HashMap<String, JobChannel>>>,
    next_subscriber: Arc<AtomicU64>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobChannel>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record and broadcast a progress update.
    ///
    /// The percentage never drops below the previous event's, except for
    /// `error`. Returns `None` (and publishes nothing) once the job has
    /// reached a terminal stage.
    pub fn publish(
        &self,
        job_id: &str,
        stage: Stage,
        message: impl Into<String>,
        percentage: u8,
    ) -> Option<ProgressEvent> {
        let mut jobs = self.lock();
        let channel = jobs.entry(job_id.to_string()).or_default();

        let mut percentage = percentage.min(100);
        if let Some(latest) = &channel.latest {
            if latest.stage.is_terminal() {
                debug!(
                    "Ignoring {} update for finished job {}",
                    stage.as_str(),
                    job_id
                );
                return None;
            }
            if stage != Stage::Error {
                percentage = percentage.max(latest.percentage);
            }
        }

        let event = ProgressEvent::new(job_id, stage, message, percentage);
        info!("[progress] {}: {}% - {}", job_id, percentage, event.message);

        channel
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        channel.latest = Some(event.clone());
        Some(event)
    }

    /// Open a stream of events for `job_id`.
    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        // The receiver is alive, so these sends cannot fail.
        let _ = tx.send(ProgressEvent::connected(job_id));

        let mut jobs = self.lock();
        let channel = jobs.entry(job_id.to_string()).or_default();
        if let Some(latest) = &channel.latest {
            let _ = tx.send(latest.clone());
        }
        if !channel.closed {
            channel.subscribers.push((id, tx));
        }
        debug!("Subscriber {} attached to {}", id, job_id);

        Subscription {
            id,
            job_id: job_id.to_string(),
            rx,
            bus: self.clone(),
        }
    }

    /// Detach a subscriber. Safe to call repeatedly.
    pub fn unsubscribe(&self, job_id: &str, subscriber_id: u64) {
        let mut jobs = self.lock();
        let Some(channel) = jobs.get_mut(job_id) else {
            return;
        };
        channel.subscribers.retain(|(id, _)| *id != subscriber_id);

        // Drop bookkeeping created by subscribers to jobs that never published.
        if channel.latest.is_none() && channel.subscribers.is_empty() {
            jobs.remove(job_id);
        }
    }

    /// End every live stream for `job_id`, keeping the latest snapshot.
    pub fn close_subscribers(&self, job_id: &str) {
        if let Some(channel) = self.lock().get_mut(job_id) {
            let count = channel.subscribers.len();
            channel.subscribers.clear();
            channel.closed = true;
            debug!("Closed {} progress subscribers for {}", count, job_id);
        }
    }

    /// Forget everything about `job_id`.
    pub fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn latest(&self, job_id: &str) -> Option<ProgressEvent> {
        self.lock().get(job_id).and_then(|c| c.latest.clone())
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.lock()
            .get(job_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}

/// A live progress stream. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    job_id: String,
    rx: UnboundedReceiver<ProgressEvent>,
    bus: ProgressBus,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the stream has been closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.job_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn stages(events: &[ProgressEvent]) -> Vec<Stage> {
        events.iter().map(|e| e.stage).collect()
    }

    #[tokio::test]
    async fn test_subscriber_gets_connected_then_live_events() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("job");

        bus.publish("job", Stage::Reading, "file read", 10);
        bus.publish("job", Stage::Scanning, "found 0 image links", 20);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.stage, Stage::Connected);
        assert_eq!(first.percentage, 0);
        assert_eq!(sub.recv().await.unwrap().stage, Stage::Reading);
        assert_eq!(sub.recv().await.unwrap().stage, Stage::Scanning);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Reading, "file read", 10);
        bus.publish("job", Stage::Scanning, "found 3 image links", 20);

        let mut sub = bus.subscribe("job");
        assert_eq!(sub.recv().await.unwrap().stage, Stage::Connected);
        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot.stage, Stage::Scanning);
        assert_eq!(snapshot.message, "found 3 image links");
    }

    #[tokio::test]
    async fn test_subscriber_after_completion_sees_complete_then_ends() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Saving, "saving", 95);
        bus.publish("job", Stage::Complete, "done", 100);
        bus.close_subscribers("job");

        let events: Vec<ProgressEvent> = bus.subscribe("job").collect().await;

        assert_eq!(stages(&events), vec![Stage::Connected, Stage::Complete]);
        assert_eq!(events[1].percentage, 100);
    }

    #[tokio::test]
    async fn test_percentage_never_decreases_except_error() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Downloading, "2/4", 45);
        let event = bus.publish("job", Stage::Downloading, "late", 30).unwrap();
        assert_eq!(event.percentage, 45);

        let event = bus.publish("job", Stage::Error, "boom", 0).unwrap();
        assert_eq!(event.percentage, 0);
    }

    #[tokio::test]
    async fn test_terminal_stage_blocks_further_events() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Complete, "done", 100);

        assert!(bus.publish("job", Stage::Error, "too late", 0).is_none());
        assert_eq!(bus.latest("job").unwrap().stage, Stage::Complete);
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_keeps_snapshot() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe("job");
        bus.publish("job", Stage::Complete, "done", 100);
        assert_eq!(bus.subscriber_count("job"), 1);

        bus.close_subscribers("job");

        let events: Vec<ProgressEvent> = sub.collect().await;
        assert_eq!(stages(&events), vec![Stage::Connected, Stage::Complete]);
        assert_eq!(bus.subscriber_count("job"), 0);
        assert!(bus.latest("job").is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Reading, "file read", 10);
        let sub = bus.subscribe("job");
        let id = sub.id();

        bus.unsubscribe("job", id);
        bus.unsubscribe("job", id);
        drop(sub);
        bus.unsubscribe("unknown", id);

        assert_eq!(bus.subscriber_count("job"), 0);
        bus.publish("job", Stage::Scanning, "still works", 20);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_of_unknown_job_leaves_nothing_behind() {
        let bus = ProgressBus::new();
        drop(bus.subscribe("nobody"));
        assert!(bus.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_forgets_job() {
        let bus = ProgressBus::new();
        bus.publish("job", Stage::Complete, "done", 100);
        bus.remove("job");

        assert!(bus.latest("job").is_none());
        assert!(bus.publish("job", Stage::Uploaded, "again", 5).is_some());
    }
}
