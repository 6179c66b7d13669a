//! Shared scan dispatcher
//!
//! Every job submits its scan units into one queue. A single batcher task packs
//! them FIFO into batches of at most `max_batch_size`, flushing a partial batch
//! once `linger` has passed, and runs at most `max_in_flight` batches against
//! the classifier at once. This is the only global concurrency ceiling in the
//! pipeline.
//!
//! `submit` always yields exactly one [`ScanResult`] per unit. Unreadable
//! files, per-unit classifier errors and exhausted retries all surface as
//! errored results rather than failing the submission.
//!
//! Units whose submitter has gone away (its `submit` future was dropped by a
//! timeout) are skipped before their file is read, and a classifier call whose
//! every submitter has gone away is abandoned. [`ScanDispatcher::cancel`]
//! aborts everything still queued or in flight.

pub mod classifier;
pub mod retry;

use bytes::Bytes;
use futures::future::join_all;
use media_scan_common::{DispatcherConfig, ScanResult, ScanUnit};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use classifier::{Classifier, ClassifierError, HttpClassifier, UnitOutcome, NSFW_LABEL};
pub use retry::RetryPolicy;

/// Dispatcher tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherSettings {
    pub max_batch_size: usize,
    pub max_in_flight: usize,
    pub linger: Duration,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// `nsfw_score >= threshold` marks a unit positive
    pub threshold: f32,
}

impl DispatcherSettings {
    #[must_use]
    pub fn from_config(config: &DispatcherConfig, threshold: f32) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_in_flight: config.max_in_flight.max(1),
            linger: config.linger(),
            queue_capacity: config.queue_capacity.max(1),
            retry: RetryPolicy::from(&config.retry),
            threshold,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default(), 0.5)
    }
}

struct Submission {
    unit: ScanUnit,
    reply: oneshot::Sender<ScanResult>,
}

impl Submission {
    fn abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// A submission whose image has been read
struct Loaded {
    submission: Submission,
    image: Bytes,
}

/// Handle to the running dispatcher; cheap to share behind an `Arc`
pub struct ScanDispatcher {
    queue: Mutex<Option<mpsc::Sender<Submission>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    settings: DispatcherSettings,
}

impl ScanDispatcher {
    /// Start the batcher task on the current runtime
    #[must_use]
    pub fn spawn(classifier: Arc<dyn Classifier>, settings: DispatcherSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_batcher(rx, classifier, settings, cancel.clone()));
        info!(
            "Scan dispatcher started (batch size {}, in-flight {}, retries {})",
            settings.max_batch_size, settings.max_in_flight, settings.retry.max_retries
        );
        Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            cancel,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Classify `units`; one result per unit, in input order
    pub async fn submit(&self, units: Vec<ScanUnit>) -> Vec<ScanResult> {
        let queue = self.queue.lock().ok().and_then(|guard| guard.clone());

        let mut pending = Vec::with_capacity(units.len());
        for unit in units {
            let (reply, rx) = oneshot::channel();
            let accepted = match &queue {
                Some(tx) => tx
                    .send(Submission {
                        unit: unit.clone(),
                        reply,
                    })
                    .await
                    .is_ok(),
                None => false,
            };
            pending.push((unit, accepted.then_some(rx)));
        }

        join_all(pending.into_iter().map(|(unit, rx)| async move {
            match rx {
                Some(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => ScanResult::failed(&unit, "scan dispatcher dropped the unit"),
                },
                None => ScanResult::failed(&unit, "scan dispatcher is shut down"),
            }
        }))
        .await
    }

    /// Abort every queued and in-flight batch
    ///
    /// Pending submitters receive an errored result. Follow with
    /// [`ScanDispatcher::shutdown`] to wait for the batcher to exit.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling scan dispatcher");
            self.cancel.cancel();
        }
    }

    /// Stop accepting units and wait for in-flight batches to finish
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.queue.lock() {
            guard.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Scan dispatcher worker failed: {}", e);
            }
            info!("Scan dispatcher stopped");
        }
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<Submission>,
    classifier: Arc<dyn Classifier>,
    settings: DispatcherSettings,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(settings.max_in_flight));
    let mut in_flight = JoinSet::new();

    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(submission) => submission,
                None => break,
            },
        };
        if first.abandoned() {
            debug!("Skipping abandoned unit {}", first.unit.path.display());
            continue;
        }

        let mut batch = vec![first];
        let deadline = Instant::now() + settings.linger;
        while batch.len() < settings.max_batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(submission)) if submission.abandoned() => {
                    debug!("Skipping abandoned unit {}", submission.unit.path.display());
                }
                Ok(Some(submission)) => batch.push(submission),
                Ok(None) | Err(_) => break,
            }
        }

        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        while let Some(finished) = in_flight.try_join_next() {
            report_batch_task(finished);
        }
        let classifier = Arc::clone(&classifier);
        in_flight.spawn(async move {
            run_batch(batch, classifier.as_ref(), &settings).await;
            drop(permit);
        });
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if !in_flight.is_empty() {
                    warn!("Aborting {} in-flight classifier batches", in_flight.len());
                }
                in_flight.shutdown().await;
                break;
            }
            finished = in_flight.join_next() => match finished {
                Some(finished) => report_batch_task(finished),
                None => break,
            },
        }
    }
    // Queued submissions are dropped with the receiver; their submitters see a dropped unit
    rx.close();
}

fn report_batch_task(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Classifier batch task panicked: {}", e);
        }
    }
}

/// Completes once every submitter in `ready` has gone away
async fn submitters_gone(ready: &mut [Loaded]) {
    join_all(ready.iter_mut().map(|loaded| loaded.submission.reply.closed())).await;
}

async fn run_batch(batch: Vec<Submission>, classifier: &dyn Classifier, settings: &DispatcherSettings) {
    let mut ready: Vec<Loaded> = Vec::with_capacity(batch.len());
    for submission in batch {
        if submission.abandoned() {
            debug!("Skipping abandoned unit {}", submission.unit.path.display());
            continue;
        }
        match tokio::fs::read(&submission.unit.path).await {
            Ok(data) => ready.push(Loaded {
                submission,
                image: Bytes::from(data),
            }),
            Err(e) => {
                warn!("Cannot read scan unit {}: {}", submission.unit.path.display(), e);
                let result = ScanResult::failed(&submission.unit, format!("unreadable unit: {e}"));
                let _ = submission.reply.send(result);
            }
        }
    }

    let mut retry = 0;
    loop {
        ready.retain(|loaded| !loaded.submission.abandoned());
        if ready.is_empty() {
            debug!("Classifier batch has no live units left");
            return;
        }

        let size = ready.len();
        let attempt = retry + 1;
        let images: Vec<Bytes> = ready.iter().map(|loaded| loaded.image.clone()).collect();
        let outcome = tokio::select! {
            outcome = classifier.classify(images) => Some(outcome),
            () = submitters_gone(&mut ready) => None,
        };
        let Some(outcome) = outcome else {
            debug!("Dropping classifier call for {} abandoned units", size);
            return;
        };

        match outcome {
            Ok(outcomes) if outcomes.len() == size => {
                info!("Classifier batch of {} units succeeded on attempt {}", size, attempt);
                for (loaded, outcome) in ready.into_iter().zip(outcomes) {
                    let unit = &loaded.submission.unit;
                    let result = match outcome {
                        UnitOutcome::Scored { nsfw_score, probs } => {
                            ScanResult::scored(unit, nsfw_score, probs, settings.threshold)
                        }
                        UnitOutcome::Failed(message) => ScanResult::failed(unit, message),
                    };
                    let _ = loaded.submission.reply.send(result);
                }
                return;
            }
            Ok(outcomes) => {
                let message = format!(
                    "classifier returned {} results for {} units",
                    outcomes.len(),
                    size
                );
                error!("{}", message);
                fail_all(ready, &message);
                return;
            }
            Err(e) if e.is_transient() && retry < settings.retry.max_retries => {
                let delay = settings.retry.backoff(retry);
                warn!(
                    "Classifier batch of {} units failed on attempt {} ({}), retrying in {:?}",
                    size, attempt, e, delay
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = submitters_gone(&mut ready) => {}
                }
                retry += 1;
            }
            Err(e) => {
                warn!(
                    "Classifier batch of {} units failed after {} attempts: {}",
                    size, attempt, e
                );
                fail_all(ready, &format!("{e} (after {attempt} attempts)"));
                return;
            }
        }
    }
}

fn fail_all(ready: Vec<Loaded>, message: &str) {
    for Loaded { submission, .. } in ready {
        let result = ScanResult::failed(&submission.unit, message);
        if submission.reply.send(result).is_err() {
            debug!("Submitter for {} went away", submission.unit.job_id);
        }
    }
}
