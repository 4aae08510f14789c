//! Pod watch feed and snapshot cache
//!
//! [`KubePodFeed`] keeps a reflector store of every Pod in the cluster and
//! turns raw watcher events into add/update/delete callbacks. The reconciler
//! only reads the store; the feed task is its sole writer.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use parking_lot::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sidecar_cleaner_common::Error;

use crate::error::CleanerError;
use crate::pod::PodKey;

/// Server-side watch timeout, below the default client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Callbacks invoked by the feed for each observed change
pub trait PodEventHandler: Send + Sync {
    /// A Pod the cache did not hold before
    fn on_add(&self, pod: &Pod);

    /// A newer state of a cached Pod, or a resync of it
    fn on_update(&self, pod: &Pod);

    /// Last known state of a Pod that is gone
    fn on_delete(&self, pod: &Pod);
}

/// Source of Pod events plus the snapshot cache they maintain
#[async_trait]
pub trait PodFeed: Send + Sync {
    /// Latest cached state of the Pod, if it still exists
    fn get(&self, key: &PodKey) -> Option<Arc<Pod>>;

    /// Drive the feed, dispatching to `handler` until `shutdown` fires
    async fn run(
        &self,
        handler: Arc<dyn PodEventHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), CleanerError>;

    /// Resolve once the cache holds a complete initial listing
    async fn wait_for_sync(&self) -> Result<(), CleanerError>;
}

/// [`PodFeed`] backed by a cluster-wide Pod watch
pub struct KubePodFeed {
    api: Api<Pod>,
    store: Store<Pod>,
    writer: Mutex<Option<Writer<Pod>>>,
    resync_period: Option<Duration>,
}

impl KubePodFeed {
    pub fn new(client: Client, resync_period: Option<Duration>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api: Api::all(client),
            store,
            writer: Mutex::new(Some(writer)),
            resync_period: enabled_resync(resync_period),
        }
    }
}

#[async_trait]
impl PodFeed for KubePodFeed {
    fn get(&self, key: &PodKey) -> Option<Arc<Pod>> {
        self.store.get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    async fn run(
        &self,
        handler: Arc<dyn PodEventHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), CleanerError> {
        let writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| Error::internal_with_context("pod_feed", "feed is already running"))?;

        let stream = watcher::watcher(
            self.api.clone(),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff();

        info!(resync = ?self.resync_period, "Pod feed started");
        drive(
            stream,
            self.store.clone(),
            EventApplier::new(writer),
            handler,
            self.resync_period,
            shutdown,
        )
        .await;

        Ok(())
    }

    async fn wait_for_sync(&self) -> Result<(), CleanerError> {
        self.store.wait_until_ready().await.map_err(|e| {
            CleanerError::from(Error::internal_with_context("pod_feed", e.to_string()))
        })
    }
}

/// A zero period disables resync
fn enabled_resync(period: Option<Duration>) -> Option<Duration> {
    period.filter(|p| !p.is_zero())
}

/// Apply watch events, resync on every tick, stop on shutdown or stream end
async fn drive<S>(
    stream: S,
    store: Store<Pod>,
    mut applier: EventApplier,
    handler: Arc<dyn PodEventHandler>,
    resync_period: Option<Duration>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>>,
{
    let mut stream = pin!(stream);
    let mut resync = resync_period.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Pod feed stopping");
                break;
            }
            _ = tick(&mut resync) => resync_all(&store, handler.as_ref()),
            event = stream.next() => match event {
                Some(Ok(event)) => applier.apply(&store, event, handler.as_ref()),
                Some(Err(e)) => warn!(error = %e, "Pod watch error, retrying"),
                None => {
                    warn!("Pod watch stream ended");
                    break;
                }
            },
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn resync_all(store: &Store<Pod>, handler: &dyn PodEventHandler) {
    let pods = store.state();
    debug!(count = pods.len(), "Resyncing cached pods");
    for pod in pods {
        handler.on_update(&pod);
    }
}

/// Writes watcher events into the store and dispatches the matching callbacks
///
/// A callback only runs once the store serves the object it reports. Add and
/// update are told apart by looking the object up before the write. A relist
/// becomes visible all at once when it completes, so its Pods are held back
/// until then, and Pods missing from the new listing are reported as deleted.
struct EventApplier {
    writer: Writer<Pod>,
    /// Pods of the relist in progress and whether the store held them before
    relisted: Vec<(Pod, bool)>,
}

impl EventApplier {
    fn new(writer: Writer<Pod>) -> Self {
        Self {
            writer,
            relisted: Vec::new(),
        }
    }

    fn apply(&mut self, store: &Store<Pod>, event: Event<Pod>, handler: &dyn PodEventHandler) {
        match &event {
            Event::Apply(pod) => {
                let known = store.get(&ObjectRef::from_obj(pod)).is_some();
                self.writer.apply_watcher_event(&event);
                dispatch_apply(handler, pod, known);
            }
            Event::Delete(pod) => {
                self.writer.apply_watcher_event(&event);
                handler.on_delete(pod);
            }
            Event::Init => {
                self.relisted.clear();
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(pod) => {
                let known = store.get(&ObjectRef::from_obj(pod)).is_some();
                self.writer.apply_watcher_event(&event);
                self.relisted.push((pod.clone(), known));
            }
            Event::InitDone => {
                let before = store.state();
                self.writer.apply_watcher_event(&event);
                for (pod, known) in self.relisted.drain(..) {
                    dispatch_apply(handler, &pod, known);
                }
                for pod in before {
                    if store.get(&ObjectRef::from_obj(pod.as_ref())).is_none() {
                        handler.on_delete(&pod);
                    }
                }
            }
        }
    }
}

fn dispatch_apply(handler: &dyn PodEventHandler, pod: &Pod, known: bool) {
    if known {
        handler.on_update(pod);
    } else {
        handler.on_add(pod);
    }
}
