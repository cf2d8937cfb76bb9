//! Operator assembly.
//!
//! Wires the Kubernetes-backed adapters into the reconciler, starts the
//! worker pool, and feeds the work queue from watch streams: one watch on
//! the JivaVolume resources themselves and one per owned sub-resource
//! kind. Watch events carry no payload into the queue, only the owning
//! volume's key; every pass re-reads live state.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use prometheus::Registry;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::JivaVolume;
use crate::domain::{
    EventSinkRef, ReplicaProbeRef, SubResourceStoreRef, VolumeKey, VolumeStoreRef,
};
use crate::events::KubeEventSink;
use crate::metrics::Metrics;
use crate::reconcile::Reconciler;
use crate::scheduler::{PassDriver, WorkQueue, WorkerPool};
use crate::store::kube::{CAS_TYPE_JIVA, LABEL_CAS_TYPE, LABEL_PERSISTENT_VOLUME};
use crate::store::{KubeStore, TargetApiProbe};

// ===== Operator =====

/// Fully-wired operator instance.
pub struct Operator {
    config: OperatorConfig,
    client: Client,
    queue: Arc<WorkQueue>,
    pool: WorkerPool,
    token: CancellationToken,
    ready: Arc<AtomicBool>,
}

impl Operator {
    /// Assemble the operator against a connected client, registering its
    /// metrics with `registry`.
    pub fn new(
        config: OperatorConfig,
        client: Client,
        registry: &Registry,
    ) -> crate::error::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new(registry)?);
        let queue = Arc::new(WorkQueue::new(config.queue_capacity, Arc::clone(&metrics)));
        let token = CancellationToken::new();

        let store = Arc::new(KubeStore::new(client.clone(), config.api_timeout));
        let probe = Arc::new(TargetApiProbe::new(config.api_timeout)?);
        let events = Arc::new(KubeEventSink::new(client.clone()));

        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            Arc::clone(&store) as VolumeStoreRef,
            store as SubResourceStoreRef,
            probe as ReplicaProbeRef,
            events as EventSinkRef,
            Arc::clone(&metrics),
        ));

        let pool = WorkerPool::new(
            config.workers,
            Arc::clone(&queue),
            reconciler as Arc<dyn PassDriver>,
            metrics,
            config.backoff.clone(),
            token.clone(),
        );

        Ok(Self {
            config,
            client,
            queue,
            pool,
            token,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flips to true once watches are running; wired into `/readyz`.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Cancelling this token drains and stops the operator.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until the shutdown token fires, then drain the queue's workers.
    pub async fn run(&self) -> crate::error::Result<()> {
        let workers = self.pool.spawn();
        info!(
            workers = self.config.workers,
            namespace = %self.config.namespace,
            "reconcile workers started"
        );

        let watches = vec![
            tokio::spawn(watch_owned::<Deployment>(
                self.client.clone(),
                self.config.namespace.clone(),
                "deployment",
                Arc::clone(&self.queue),
                self.token.clone(),
            )),
            tokio::spawn(watch_owned::<Service>(
                self.client.clone(),
                self.config.namespace.clone(),
                "service",
                Arc::clone(&self.queue),
                self.token.clone(),
            )),
            tokio::spawn(watch_owned::<PersistentVolumeClaim>(
                self.client.clone(),
                self.config.namespace.clone(),
                "persistentvolumeclaim",
                Arc::clone(&self.queue),
                self.token.clone(),
            )),
        ];

        self.ready.store(true, Ordering::SeqCst);
        self.watch_volumes().await;
        self.ready.store(false, Ordering::SeqCst);

        // Let in-flight passes finish before reporting shutdown complete.
        self.queue.close();
        for handle in workers {
            let _ = handle.await;
        }
        for handle in watches {
            let _ = handle.await;
        }
        info!("operator stopped");
        Ok(())
    }

    /// Watch the JivaVolume resources and enqueue every touched key. The
    /// initial relist (and any relist after a watch desync) enqueues all
    /// volumes, which doubles as the startup resync.
    async fn watch_volumes(&self) {
        let api: Api<JivaVolume> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        info!(namespace = %self.config.namespace, "watching jivavolumes");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                maybe = stream.next() => {
                    let Some(event) = maybe else { break };
                    match event {
                        Ok(watcher::Event::Applied(volume)) => self.enqueue_volume(&volume),
                        Ok(watcher::Event::Deleted(volume)) => self.enqueue_volume(&volume),
                        Ok(watcher::Event::Restarted(volumes)) => {
                            debug!(count = volumes.len(), "volume watch relisted, resyncing");
                            for volume in &volumes {
                                self.enqueue_volume(volume);
                            }
                        }
                        Err(err) => warn!(error = %err, "volume watch error"),
                    }
                }
            }
        }
    }

    fn enqueue_volume(&self, volume: &JivaVolume) {
        let Some(name) = volume.metadata.name.as_deref() else {
            return;
        };
        let namespace = volume
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(&self.config.namespace);
        self.queue.enqueue(VolumeKey::new(namespace, name));
    }
}

// ===== Owned-Resource Watches =====

/// Map a labelled sub-resource back to its owning volume's key.
fn owner_volume_key(labels: &BTreeMap<String, String>, namespace: &str) -> Option<VolumeKey> {
    labels
        .get(LABEL_PERSISTENT_VOLUME)
        .map(|volume| VolumeKey::new(namespace, volume.as_str()))
}

/// Watch one owned kind, filtered to jiva-managed objects, and enqueue the
/// owner key for every touched object (deletions included, so an external
/// delete of a child wakes the owner and gets repaired).
async fn watch_owned<K>(
    client: Client,
    namespace: String,
    kind: &'static str,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + 'static,
    K::DynamicType: Clone + Default,
{
    let api: Api<K> = Api::namespaced(client, &namespace);
    let selector = format!("{}={}", LABEL_CAS_TYPE, CAS_TYPE_JIVA);
    let mut stream = watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .touched_objects()
        .boxed();

    debug!(kind, namespace = %namespace, "watching owned sub-resources");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            maybe = stream.next() => {
                let Some(result) = maybe else { break };
                match result {
                    Ok(object) => {
                        if let Some(key) = owner_volume_key(object.labels(), &namespace) {
                            queue.enqueue(key);
                        }
                    }
                    Err(err) => warn!(kind, error = %err, "owned watch error"),
                }
            }
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_key_from_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CAS_TYPE.to_string(), CAS_TYPE_JIVA.to_string());
        labels.insert(
            LABEL_PERSISTENT_VOLUME.to_string(),
            "pvc-4f9a".to_string(),
        );

        let key = owner_volume_key(&labels, "openebs").unwrap();
        assert_eq!(key, VolumeKey::new("openebs", "pvc-4f9a"));
    }

    #[test]
    fn test_unlabelled_object_has_no_owner_key() {
        let labels = BTreeMap::from([("app".to_string(), "something-else".to_string())]);
        assert!(owner_volume_key(&labels, "openebs").is_none());
    }
}
