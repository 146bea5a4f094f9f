//! OCR queue: worker pool, polling, wake-ups, retry and the stale upload reaper.
//!
//! Shutdown: [`OcrQueue::shutdown`] stops the pool from claiming more uploads; it does not
//! wait for in-flight attempts. An attempt interrupted by process exit stays in
//! `processing` until the reaper requeues it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::models::Upload;
use tally_core::{OcrEngine, WorkerConfig};
use tally_services::{OcrDisposition, ProcessingService, UploadNotifier};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

/// Maximum delay in seconds before an upload is offered to OCR again.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Capacity of the wake-up channel. Overflow is harmless; polling picks the uploads up.
const WAKE_CHANNEL_CAPACITY: usize = 256;

/// Backoff in seconds after the given number of attempts (exponential with cap).
#[inline]
pub fn compute_retry_backoff_seconds(attempts: i32) -> u64 {
    let exp = attempts.clamp(0, 16) as u32;
    2_u64.pow(exp).min(MAX_RETRY_BACKOFF_SECS)
}

/// What one OCR attempt did to its upload.
#[derive(Debug)]
enum AttemptOutcome {
    Finished(OcrDisposition),
    Retrying { next_attempt_at: DateTime<Utc> },
    Failed,
    /// Another worker or the reaper moved the upload first.
    Superseded,
}

#[derive(Clone)]
struct Worker {
    processing: ProcessingService,
    engine: Arc<dyn OcrEngine>,
    ocr_timeout: Duration,
    max_attempts: u32,
}

impl Worker {
    #[tracing::instrument(skip(self, upload), fields(upload_id = %upload.id, attempt = upload.attempts))]
    async fn attempt(&self, upload: Upload) -> Result<AttemptOutcome> {
        let bytes = self
            .processing
            .load_bytes(&upload)
            .await
            .context("Failed to load upload bytes")?;

        let failure = match tokio::time::timeout(self.ocr_timeout, self.engine.extract(&bytes)).await {
            Ok(Ok(output)) => {
                let disposition = self
                    .processing
                    .finish(&upload, &output)
                    .await
                    .context("Failed to record OCR result")?;
                return Ok(AttemptOutcome::Finished(disposition));
            }
            Ok(Err(e)) if !e.is_retryable() => {
                tracing::error!(error = %e, "OCR engine rejected the upload");
                return self.give_up(&upload, &e.to_string()).await;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "OCR timed out after {}s",
                self.ocr_timeout.as_secs()
            ),
        };

        let attempts = u32::try_from(upload.attempts).unwrap_or(0);
        if attempts >= self.max_attempts {
            return self.give_up(&upload, &failure).await;
        }

        let backoff = compute_retry_backoff_seconds(upload.attempts);
        let next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff as i64);
        let requeued = self
            .processing
            .retry_later(&upload, next_attempt_at, &failure)
            .await
            .context("Failed to schedule OCR retry")?;
        Ok(match requeued {
            Some(_) => AttemptOutcome::Retrying { next_attempt_at },
            None => AttemptOutcome::Superseded,
        })
    }

    async fn give_up(&self, upload: &Upload, reason: &str) -> Result<AttemptOutcome> {
        let failed = self
            .processing
            .give_up(upload, reason)
            .await
            .context("Failed to mark upload as failed")?;
        Ok(match failed {
            Some(_) => AttemptOutcome::Failed,
            None => AttemptOutcome::Superseded,
        })
    }
}

#[derive(Clone)]
pub struct OcrQueue {
    wake_tx: mpsc::Sender<Uuid>,
    shutdown_tx: mpsc::Sender<()>,
}

impl OcrQueue {
    /// Spawn the worker pool. It polls for queued uploads every `poll_interval_ms` and
    /// also wakes immediately for uploads announced through [`UploadNotifier`].
    pub fn start(processing: ProcessingService, engine: Arc<dyn OcrEngine>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);

        let worker = Worker {
            processing,
            engine,
            ocr_timeout: Duration::from_secs(config.ocr_timeout_secs),
            max_attempts: config.max_attempts.max(1),
        };
        tokio::spawn(async move {
            Self::worker_pool(worker, config, wake_rx, shutdown_rx).await;
        });

        Self {
            wake_tx,
            shutdown_tx,
        }
    }

    async fn worker_pool(
        worker: Worker,
        config: WorkerConfig,
        mut wake_rx: mpsc::Receiver<Uuid>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval_ms,
            max_attempts = config.max_attempts,
            "OCR worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if config.stale_reap_interval_secs > 0 {
            let processing = worker.processing.clone();
            let reap_interval = Duration::from_secs(config.stale_reap_interval_secs);
            let grace = chrono::Duration::seconds(config.stale_grace_period_secs)
                + chrono::Duration::seconds(config.ocr_timeout_secs as i64);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match processing.requeue_stale(Utc::now() - grace).await {
                                Ok(ids) if !ids.is_empty() => {
                                    tracing::warn!(count = ids.len(), "Requeued uploads stuck in processing");
                                }
                                Ok(_) => {}
                                Err(e) => tracing::error!(error = %e, "Stale upload reaper failed"),
                            }
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("OCR worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    break;
                }
                Some(upload_id) = wake_rx.recv() => {
                    Self::claim_and_dispatch_one(&worker, &semaphore, Some(upload_id)).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch_one(&worker, &semaphore, None).await;
                }
            }
        }

        tracing::info!("OCR worker pool stopped");
    }

    /// Claim one upload (a specific one when woken for it) and run it on a pool slot.
    async fn claim_and_dispatch_one(worker: &Worker, semaphore: &Arc<Semaphore>, upload_id: Option<Uuid>) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No OCR workers available, skipping claim");
                return;
            }
        };

        let claimed = match upload_id {
            Some(id) => worker.processing.claim(id).await,
            None => worker.processing.claim_next().await,
        };

        match claimed {
            Ok(Some(upload)) => {
                let worker = worker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let upload_id = upload.id;
                    match worker.attempt(upload).await {
                        Ok(outcome) => tracing::debug!(upload_id = %upload_id, outcome = ?outcome, "OCR attempt finished"),
                        Err(e) => tracing::error!(upload_id = %upload_id, error = ?e, "OCR attempt failed"),
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No uploads waiting for OCR");
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim upload for OCR");
            }
        }
    }

    /// Signals the pool to stop claiming uploads. Returns without waiting for in-flight attempts.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating OCR queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[async_trait]
impl UploadNotifier for OcrQueue {
    async fn notify(&self, upload_id: Uuid) {
        if let Err(e) = self.wake_tx.try_send(upload_id) {
            tracing::debug!(upload_id = %upload_id, error = %e, "Wake-up dropped, upload will be polled");
        }
    }
}
