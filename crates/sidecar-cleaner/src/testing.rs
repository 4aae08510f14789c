//! Pod fixtures and an in-memory feed for unit tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CleanerError;
use crate::feed::{PodEventHandler, PodFeed};
use crate::pod::PodKey;

/// Builds Pods from JSON the way the API server would serve them
pub struct PodFixture {
    namespace: String,
    name: String,
    uid: String,
    phase: String,
    restart_policy: String,
    owners: Vec<Value>,
    annotations: serde_json::Map<String, Value>,
    containers: Vec<String>,
    statuses: Vec<Value>,
}

impl PodFixture {
    /// A Running Pod owned by a Job, restart policy Never, no containers yet
    pub fn job_pod(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            phase: "Running".to_string(),
            restart_policy: "Never".to_string(),
            owners: vec![json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "name": format!("{name}-job"),
                "uid": "job-uid",
            })],
            annotations: serde_json::Map::new(),
            containers: Vec::new(),
            statuses: Vec::new(),
        }
    }

    pub fn uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn restart_policy(mut self, policy: &str) -> Self {
        self.restart_policy = policy.to_string();
        self
    }

    pub fn owner(mut self, kind: &str) -> Self {
        self.owners = vec![json!({
            "apiVersion": "apps/v1",
            "kind": kind,
            "name": "owner",
            "uid": "owner-uid",
        })];
        self
    }

    pub fn no_owner(mut self) -> Self {
        self.owners.clear();
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    /// Declare a container in the spec without reporting a status for it
    pub fn container(mut self, name: &str) -> Self {
        self.declare(name);
        self
    }

    pub fn running(self, name: &str) -> Self {
        self.status(name, json!({ "running": { "startedAt": "2024-01-01T00:00:00Z" } }))
    }

    pub fn waiting(self, name: &str, reason: &str) -> Self {
        self.status(name, json!({ "waiting": { "reason": reason } }))
    }

    pub fn terminated(self, name: &str, reason: &str) -> Self {
        let exit_code = if reason == "Completed" { 0 } else { 1 };
        self.status(
            name,
            json!({ "terminated": { "reason": reason, "exitCode": exit_code } }),
        )
    }

    pub fn status_without_state(mut self, name: &str) -> Self {
        self.declare(name);
        self.statuses.push(json!({
            "name": name,
            "image": "example/image:latest",
            "imageID": "",
            "ready": false,
            "restartCount": 0,
        }));
        self
    }

    fn status(mut self, name: &str, state: Value) -> Self {
        self.declare(name);
        self.statuses.push(json!({
            "name": name,
            "image": "example/image:latest",
            "imageID": "",
            "ready": false,
            "restartCount": 0,
            "state": state,
        }));
        self
    }

    fn declare(&mut self, name: &str) {
        if !self.containers.iter().any(|c| c == name) {
            self.containers.push(name.to_string());
        }
    }

    pub fn build(self) -> Pod {
        let containers: Vec<Value> = self
            .containers
            .iter()
            .map(|name| json!({ "name": name, "image": "example/image:latest" }))
            .collect();

        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "uid": self.uid,
                "ownerReferences": self.owners,
                "annotations": self.annotations,
            },
            "spec": {
                "restartPolicy": self.restart_policy,
                "containers": containers,
            },
            "status": {
                "phase": self.phase,
                "containerStatuses": self.statuses,
            },
        }))
        .expect("fixture is a valid Pod")
    }
}

enum FeedEvent {
    Apply(Pod),
    Delete(Pod),
}

/// [`PodFeed`] over a map, driven by events pushed from the test
pub struct FakePodFeed {
    pods: Mutex<HashMap<PodKey, Arc<Pod>>>,
    tx: mpsc::UnboundedSender<FeedEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
    synced: bool,
}

impl FakePodFeed {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pods: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            synced: true,
        }
    }

    /// A feed whose initial listing never completes
    pub fn unsynced() -> Self {
        Self {
            synced: false,
            ..Self::new()
        }
    }

    /// Set the cached state without dispatching an event
    pub fn insert(&self, pod: Pod) {
        let key = PodKey::from_pod(&pod).expect("fixture pods are named");
        self.pods.lock().insert(key, Arc::new(pod));
    }

    /// Drop the cached state without dispatching an event
    pub fn remove(&self, key: &PodKey) {
        self.pods.lock().remove(key);
    }

    /// Deliver an add or update through the running feed
    pub fn apply(&self, pod: Pod) {
        let _ = self.tx.send(FeedEvent::Apply(pod));
    }

    /// Deliver a delete through the running feed
    pub fn delete(&self, pod: Pod) {
        let _ = self.tx.send(FeedEvent::Delete(pod));
    }
}

#[async_trait]
impl PodFeed for FakePodFeed {
    fn get(&self, key: &PodKey) -> Option<Arc<Pod>> {
        self.pods.lock().get(key).cloned()
    }

    async fn run(
        &self,
        handler: Arc<dyn PodEventHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), CleanerError> {
        let mut rx = self.rx.lock().take().expect("feed runs once");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };
            match event {
                FeedEvent::Apply(pod) => {
                    let key = PodKey::from_pod(&pod).expect("fixture pods are named");
                    let known = self.pods.lock().insert(key, Arc::new(pod.clone())).is_some();
                    if known {
                        handler.on_update(&pod);
                    } else {
                        handler.on_add(&pod);
                    }
                }
                FeedEvent::Delete(pod) => {
                    if let Some(key) = PodKey::from_pod(&pod) {
                        self.pods.lock().remove(&key);
                    }
                    handler.on_delete(&pod);
                }
            }
        }
    }

    async fn wait_for_sync(&self) -> Result<(), CleanerError> {
        if !self.synced {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
