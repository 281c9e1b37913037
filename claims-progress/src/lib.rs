#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Progress Publisher: delivers progress/log events to subscribers
//! addressed by `(seller, job_id)`.
//!
//! Grounded in this workspace's "shared registry behind an async `RwLock`,
//! one channel per key" idiom (already used for the per-provider token
//! bucket and per-match evidence link store) composed with
//! `tokio::sync::broadcast` for fan-out delivery — FIFO-per-key falls out
//! of `broadcast`'s single-producer ordering guarantee for free.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

pub type SellerId = String;
pub type JobId = String;

pub type ProgressResult<T> = Result<T, ProgressError>;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("subscriber is not authorized for this seller's job")]
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEventKind {
    Progress,
    Log(LogLevel),
    Completed,
    Failed,
    Notification,
}

/// One event published for a `(seller, job_id)` pair. `current`/`total`
/// are cumulative across the whole job, not per-event, so a subscriber
/// that only sees the latest event still knows overall completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub seller_id: SellerId,
    pub job_id: JobId,
    pub kind: ProgressEventKind,
    pub current: u64,
    pub total: u64,
    pub report_type: Option<String>,
    pub message: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressEventKind::Completed | ProgressEventKind::Failed
        )
    }
}

/// The narrow publish-only interface callers (the Sync Orchestrator) depend
/// on, kept separate from the subscribe side the same way `RouterEventSink`
/// keeps telemetry decoupled from the router's own decision state.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent);
}

#[derive(Default)]
pub struct NoopProgressSink;

#[async_trait::async_trait]
impl ProgressSink for NoopProgressSink {
    async fn publish(&self, _event: ProgressEvent) {}
}

struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    latest: Option<ProgressEvent>,
}

/// Lazily creates one broadcast channel per `(seller, job_id)` on first
/// publish, retaining it until the job reaches a terminal state. A late
/// subscriber is handed the latest cumulative progress immediately, then
/// streams whatever is published after that — it never sees the full
/// history, only where the job currently stands plus what's new.
pub struct ProgressPublisher {
    channels: RwLock<HashMap<(SellerId, JobId), Channel>>,
    capacity: usize,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribes to `(seller_id, job_id)` after checking the caller-proven
    /// `authorized_seller_id` matches. Returns the latest cumulative event,
    /// if any has been published yet, plus a receiver for subsequent ones.
    pub async fn subscribe(
        &self,
        seller_id: &SellerId,
        job_id: &JobId,
        authorized_seller_id: &SellerId,
    ) -> ProgressResult<(Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        if authorized_seller_id != seller_id {
            return Err(ProgressError::Unauthorized);
        }
        let key = (seller_id.clone(), job_id.clone());
        let mut channels = self.channels.write().await;
        let channel = channels.entry(key).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            latest: None,
        });
        Ok((channel.latest.clone(), channel.sender.subscribe()))
    }

    /// Drops the channel for a job that has reached a terminal state, so
    /// its resources aren't retained forever. Safe to call more than once.
    pub async fn retire(&self, seller_id: &SellerId, job_id: &JobId) {
        self.channels
            .write()
            .await
            .remove(&(seller_id.clone(), job_id.clone()));
    }
}

#[async_trait::async_trait]
impl ProgressSink for ProgressPublisher {
    async fn publish(&self, event: ProgressEvent) {
        let key = (event.seller_id.clone(), event.job_id.clone());
        let mut channels = self.channels.write().await;
        let channel = channels.entry(key).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            latest: None,
        });
        channel.latest = Some(event.clone());
        // A send with no active receivers is not an error: events are
        // best-effort, and a subscriber that arrives later gets `latest`.
        let _ = channel.sender.send(event);
    }
}

#[must_use]
pub fn shared() -> Arc<ProgressPublisher> {
    Arc::new(ProgressPublisher::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(seller_id: &str, job_id: &str, current: u64, total: u64, kind: ProgressEventKind) -> ProgressEvent {
        ProgressEvent {
            seller_id: seller_id.into(),
            job_id: job_id.into(),
            kind,
            current,
            total,
            report_type: Some("orders".into()),
            message: None,
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn late_subscriber_receives_latest_cumulative_progress() {
        let publisher = ProgressPublisher::default();
        publisher
            .publish(event("seller-1", "job-1", 5, 10, ProgressEventKind::Progress))
            .await;

        let (latest, _receiver) = publisher
            .subscribe(&"seller-1".into(), &"job-1".into(), &"seller-1".into())
            .await
            .expect("subscribe");
        assert_eq!(latest.map(|e| e.current), Some(5));
    }

    #[tokio::test]
    async fn subscriber_receives_live_events_in_order() {
        let publisher = ProgressPublisher::default();
        let (_, mut receiver) = publisher
            .subscribe(&"seller-1".into(), &"job-1".into(), &"seller-1".into())
            .await
            .expect("subscribe");

        publisher
            .publish(event("seller-1", "job-1", 1, 10, ProgressEventKind::Progress))
            .await;
        publisher
            .publish(event("seller-1", "job-1", 2, 10, ProgressEventKind::Progress))
            .await;

        let first = receiver.recv().await.expect("first event");
        let second = receiver.recv().await.expect("second event");
        assert_eq!(first.current, 1);
        assert_eq!(second.current, 2);
    }

    #[tokio::test]
    async fn cross_job_channels_do_not_interfere() {
        let publisher = ProgressPublisher::default();
        publisher
            .publish(event("seller-1", "job-1", 1, 10, ProgressEventKind::Progress))
            .await;
        publisher
            .publish(event("seller-1", "job-2", 9, 10, ProgressEventKind::Progress))
            .await;

        let (latest_job1, _) = publisher
            .subscribe(&"seller-1".into(), &"job-1".into(), &"seller-1".into())
            .await
            .expect("subscribe job-1");
        let (latest_job2, _) = publisher
            .subscribe(&"seller-1".into(), &"job-2".into(), &"seller-1".into())
            .await
            .expect("subscribe job-2");

        assert_eq!(latest_job1.map(|e| e.current), Some(1));
        assert_eq!(latest_job2.map(|e| e.current), Some(9));
    }

    #[tokio::test]
    async fn unauthorized_subscriber_is_rejected() {
        let publisher = ProgressPublisher::default();
        let err = publisher
            .subscribe(&"seller-1".into(), &"job-1".into(), &"seller-2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::Unauthorized));
    }

    #[tokio::test]
    async fn retire_removes_the_channel() {
        let publisher = ProgressPublisher::default();
        publisher
            .publish(event("seller-1", "job-1", 10, 10, ProgressEventKind::Completed))
            .await;
        publisher.retire(&"seller-1".into(), &"job-1".into()).await;

        let (latest, _) = publisher
            .subscribe(&"seller-1".into(), &"job-1".into(), &"seller-1".into())
            .await
            .expect("subscribe after retire creates a fresh channel");
        assert_eq!(latest, None);
    }
}
