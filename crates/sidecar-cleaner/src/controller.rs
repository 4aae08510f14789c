//! Controller loop
//!
//! Wires the Pod feed to the work queue and the queue to a pool of workers:
//!
//! ```text
//! feed ──(classifier)──▶ RetryQueue ──▶ worker × N ──▶ Reconciler ──▶ handle_err
//! ```
//!
//! The queue is the only state shared between the feed and the workers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use sidecar_cleaner_common::Error;

use crate::classifier;
use crate::cleanup::SidecarCleaner;
use crate::config::{CleanerConfig, SidecarProfile};
use crate::error::CleanerError;
use crate::feed::{PodEventHandler, PodFeed};
use crate::pod::PodKey;
use crate::queue::RetryQueue;
use crate::reconciler::{handle_err, ErrorReporter, Reconciler};

/// Feed handler that turns Pod events into queue keys
struct EnqueueHandler {
    queue: RetryQueue<PodKey>,
    profile: SidecarProfile,
}

impl EnqueueHandler {
    fn enqueue_if_eligible(&self, pod: &Pod) {
        if !classifier::can_process(pod, &self.profile) {
            return;
        }
        if let Some(key) = PodKey::from_pod(pod) {
            if self.queue.add(key.clone()) {
                trace!(pod = %key, "Enqueued");
            }
        }
    }
}

impl PodEventHandler for EnqueueHandler {
    fn on_add(&self, pod: &Pod) {
        self.enqueue_if_eligible(pod);
    }

    fn on_update(&self, pod: &Pod) {
        self.enqueue_if_eligible(pod);
    }

    fn on_delete(&self, pod: &Pod) {
        // Always enqueued so the reconciler can forget the Pod
        match PodKey::from_pod(pod) {
            Some(key) => {
                self.queue.add(key);
            }
            None => warn!("Deleted pod has no name, skipping"),
        }
    }
}

/// One reconcile loop; several run concurrently over the same queue
#[derive(Clone)]
struct Worker {
    queue: RetryQueue<PodKey>,
    reconciler: Arc<Reconciler>,
    reporter: Arc<dyn ErrorReporter>,
    max_retries: u32,
}

impl Worker {
    async fn run(self, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn process(&self, key: PodKey) {
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic);
                error!(pod = %key, panic = %message, "Reconcile panicked");
                Err(CleanerError::Panic {
                    pod: key.clone(),
                    message,
                })
            });

        handle_err(
            &self.queue,
            &key,
            &result,
            self.max_retries,
            self.reporter.as_ref(),
        );
        self.queue.done(&key);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The sidecar cleaner controller
pub struct Controller {
    config: CleanerConfig,
    feed: Arc<dyn PodFeed>,
    queue: RetryQueue<PodKey>,
    reconciler: Arc<Reconciler>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Controller {
    pub fn new(
        config: CleanerConfig,
        feed: Arc<dyn PodFeed>,
        cleaner: SidecarCleaner,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let queue = RetryQueue::new(&config.rate_limit);
        let reconciler = Arc::new(Reconciler::new(
            feed.clone(),
            cleaner,
            config.profile.clone(),
        ));
        Self {
            config,
            feed,
            queue,
            reconciler,
            reporter,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Workers start once the feed has synced. On shutdown the feed stops,
    /// keys already queued are still processed, and this returns after every
    /// task has finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CleanerError> {
        let handler = Arc::new(EnqueueHandler {
            queue: self.queue.clone(),
            profile: self.config.profile.clone(),
        });

        let mut feed_task = {
            let feed = self.feed.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = feed.run(handler, token).await {
                    error!(error = %e, "Pod feed failed");
                }
            })
        };

        info!("Waiting for pod cache to sync");
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before pod cache synced");
                self.queue.shut_down();
                feed_task.abort();
                return Ok(());
            }
            _ = &mut feed_task => {
                self.queue.shut_down();
                return Err(Error::internal_with_context(
                    "controller",
                    "pod feed stopped before the cache synced",
                )
                .into());
            }
            synced = self.feed.wait_for_sync() => {
                if let Err(e) = synced {
                    self.queue.shut_down();
                    feed_task.abort();
                    return Err(e);
                }
            }
        }

        info!(workers = self.config.workers, "Pod cache synced, starting workers");
        let worker = Worker {
            queue: self.queue.clone(),
            reconciler: self.reconciler.clone(),
            reporter: self.reporter.clone(),
            max_retries: self.config.max_retries,
        };
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(worker.clone().run(id)))
            .collect();

        shutdown.cancelled().await;
        info!(queued = self.queue.len(), "Shutting down controller");

        if let Err(e) = feed_task.await {
            warn!(error = %e, "Pod feed task ended abnormally");
        }
        self.queue.shut_down();

        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        info!("Controller stopped");
        Ok(())
    }
}
