//! Local cache mirrors and change notifications
//!
//! A [`Mirror`] keeps a `kube` reflector store for one kind and turns raw
//! watcher events into add/update/delete [`Notification`]s. An [`Informer`]
//! drives a live watch into a mirror and hands notifications to an
//! [`EventHandler`]. Readers use the mirror through the [`Lister`] trait.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Read access to a local cache of objects of kind `K`
#[cfg_attr(test, automock)]
pub trait Lister<K: Send + Sync + 'static>: Send + Sync {
    /// Look up an object by namespace and name; `Ok(None)` if it is not cached
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, Error>;

    /// Whether the initial full listing has completed
    fn has_synced(&self) -> bool;
}

/// A change observed in a mirror
#[derive(Clone, Debug)]
pub enum Notification<K> {
    /// Object appeared in the cache
    Added(Arc<K>),
    /// Object changed (or was replayed by a resync)
    Updated {
        /// Previously cached version
        old: Arc<K>,
        /// Newly cached version
        new: Arc<K>,
    },
    /// Object left the cache
    Deleted(Arc<K>),
}

/// Receives notifications from an informer
///
/// Returning an error stops the informer; handlers only do so for
/// invariant violations that no retry can fix.
pub trait EventHandler<K>: Send + Sync {
    /// Handle one notification
    fn on_event(&self, notification: Notification<K>) -> Result<(), Error>;
}

/// Object kinds that can be mirrored
pub trait Mirrored:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> Mirrored for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Reflector store for one kind plus notification translation
pub struct Mirror<K: Mirrored> {
    store: Store<K>,
    writer: reflector::store::Writer<K>,
    synced: Arc<AtomicBool>,
    relist: Option<Relist<K>>,
}

/// Notifications buffered while a (re)list is in progress
struct Relist<K: Mirrored> {
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<Notification<K>>,
}

impl<K: Mirrored> Default for Mirror<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Mirrored> Mirror<K> {
    /// Create an empty, unsynced mirror
    pub fn new() -> Self {
        let (store, writer) = reflector::store();
        Self {
            store,
            writer,
            synced: Arc::new(AtomicBool::new(false)),
            relist: None,
        }
    }

    /// A lister reading this mirror's store
    pub fn lister(&self) -> StoreLister<K> {
        StoreLister {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }

    /// Apply a watcher event and return the resulting notifications
    ///
    /// During a (re)list nothing is emitted until `InitDone`, when the store
    /// is swapped in one step so readers never see a half-listed cache.
    pub fn apply(&mut self, event: Event<K>) -> Vec<Notification<K>> {
        match event {
            Event::Init => {
                self.writer.apply_watcher_event(&Event::Init);
                self.relist = Some(Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                Vec::new()
            }
            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(&obj);
                let old = self.store.get(&obj_ref);
                let new = Arc::new(obj.clone());
                self.writer.apply_watcher_event(&Event::InitApply(obj));
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.insert(obj_ref);
                    relist.pending.push(changed(old, new));
                }
                Vec::new()
            }
            Event::InitDone => {
                let before = self.store.state();
                self.writer.apply_watcher_event(&Event::InitDone);
                self.synced.store(true, Ordering::Release);

                let Some(relist) = self.relist.take() else {
                    return Vec::new();
                };
                let mut out = relist.pending;
                out.extend(
                    before
                        .into_iter()
                        .filter(|obj| !relist.seen.contains(&ObjectRef::from_obj(&**obj)))
                        .map(Notification::Deleted),
                );
                out
            }
            Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(&obj));
                let new = Arc::new(obj.clone());
                self.writer.apply_watcher_event(&Event::Apply(obj));
                vec![changed(old, new)]
            }
            Event::Delete(obj) => {
                let last = self
                    .store
                    .get(&ObjectRef::from_obj(&obj))
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                self.writer.apply_watcher_event(&Event::Delete(obj));
                vec![Notification::Deleted(last)]
            }
        }
    }

    /// Replay every cached object as an update to itself
    pub fn resync(&self) -> Vec<Notification<K>> {
        self.store
            .state()
            .into_iter()
            .map(|obj| Notification::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect()
    }
}

fn changed<K>(old: Option<Arc<K>>, new: Arc<K>) -> Notification<K> {
    match old {
        Some(old) => Notification::Updated { old, new },
        None => Notification::Added(new),
    }
}

/// [`Lister`] backed by a reflector store
pub struct StoreLister<K: Mirrored> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: Mirrored> Clone for StoreLister<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K: Mirrored> Lister<K> for StoreLister<K> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, Error> {
        let mut obj_ref = ObjectRef::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        Ok(self.store.get(&obj_ref))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Watches one kind, mirrors it locally, and dispatches notifications
pub struct Informer<K: Mirrored> {
    api: Api<K>,
    config: watcher::Config,
    mirror: Mirror<K>,
    resync_period: Option<Duration>,
}

impl<K: Mirrored> Informer<K> {
    /// Create an informer over `api`
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self {
            api,
            config,
            mirror: Mirror::new(),
            resync_period: None,
        }
    }

    /// Periodically replay every cached object as an update
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Lister over this informer's cache
    pub fn lister(&self) -> StoreLister<K> {
        self.mirror.lister()
    }

    /// Run until cancelled or until the handler reports a fatal error
    pub async fn run<H>(mut self, handler: Arc<H>, cancel: CancellationToken) -> Result<(), Error>
    where
        H: EventHandler<K> + ?Sized,
    {
        let kind = K::kind(&()).into_owned();
        let stream = watcher::watcher(self.api.clone(), self.config.clone()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        // First tick of an interval fires immediately; push it one period out
        let period = self.resync_period.unwrap_or(Duration::from_secs(3600));
        let mut resync =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(%kind, "starting informer");

        loop {
            let notifications = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%kind, "informer stopped");
                    return Ok(());
                }
                _ = resync.tick(), if self.resync_period.is_some() => {
                    debug!(%kind, "resyncing cached objects");
                    self.mirror.resync()
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.mirror.apply(event),
                    Some(Err(e)) => {
                        warn!(%kind, error = %e, "watch error, backing off");
                        continue;
                    }
                    None => {
                        warn!(%kind, "watch stream ended");
                        return Ok(());
                    }
                },
            };

            for notification in notifications {
                if let Err(e) = handler.on_event(notification) {
                    error!(%kind, error = %e, "event handler failed, stopping informer");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(notifications: &[Notification<ConfigMap>]) -> Vec<String> {
        notifications
            .iter()
            .map(|n| match n {
                Notification::Added(o) => format!("add:{}", o.metadata.name.as_deref().unwrap_or("")),
                Notification::Updated { new, .. } => {
                    format!("update:{}", new.metadata.name.as_deref().unwrap_or(""))
                }
                Notification::Deleted(o) => {
                    format!("delete:{}", o.metadata.name.as_deref().unwrap_or(""))
                }
            })
            .collect()
    }

    fn listed(mirror: &mut Mirror<ConfigMap>, objs: Vec<ConfigMap>) -> Vec<Notification<ConfigMap>> {
        let mut out = mirror.apply(Event::Init);
        for obj in objs {
            out.extend(mirror.apply(Event::InitApply(obj)));
        }
        out.extend(mirror.apply(Event::InitDone));
        out
    }

    /// Story: the cache only reports synced once the initial list completes
    #[test]
    fn story_initial_list_marks_cache_synced() {
        let mut mirror = Mirror::<ConfigMap>::new();
        let lister = mirror.lister();
        assert!(!lister.has_synced());

        assert!(mirror.apply(Event::Init).is_empty());
        assert!(mirror.apply(Event::InitApply(cm("a", "1"))).is_empty());
        assert!(!lister.has_synced());
        assert!(lister.get("default", "a").expect("lookup").is_none());

        let out = mirror.apply(Event::InitDone);
        assert!(lister.has_synced());
        assert_eq!(names(&out), vec!["add:a"]);
        assert!(lister.get("default", "a").expect("lookup").is_some());
    }

    #[test]
    fn story_apply_reports_previous_version() {
        let mut mirror = Mirror::<ConfigMap>::new();
        listed(&mut mirror, vec![cm("a", "1")]);

        let out = mirror.apply(Event::Apply(cm("a", "2")));
        match out.as_slice() {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("expected one update, got {}", other.len()),
        }

        let out = mirror.apply(Event::Apply(cm("b", "3")));
        assert_eq!(names(&out), vec!["add:b"]);
    }

    #[test]
    fn story_delete_removes_from_cache() {
        let mut mirror = Mirror::<ConfigMap>::new();
        let lister = mirror.lister();
        listed(&mut mirror, vec![cm("a", "1")]);

        let out = mirror.apply(Event::Delete(cm("a", "1")));
        assert_eq!(names(&out), vec!["delete:a"]);
        assert!(lister.get("default", "a").expect("lookup").is_none());
    }

    /// Story: after a watch restart, objects missing from the relist are deleted
    #[test]
    fn story_relist_reports_vanished_objects() {
        let mut mirror = Mirror::<ConfigMap>::new();
        let lister = mirror.lister();
        listed(&mut mirror, vec![cm("a", "1"), cm("b", "1")]);

        let out = listed(&mut mirror, vec![cm("a", "2")]);
        let mut got = names(&out);
        got.sort();
        assert_eq!(got, vec!["delete:b", "update:a"]);
        assert!(lister.get("default", "b").expect("lookup").is_none());
    }

    #[test]
    fn story_resync_replays_objects_unchanged() {
        let mut mirror = Mirror::<ConfigMap>::new();
        listed(&mut mirror, vec![cm("a", "7")]);

        let out = mirror.resync();
        match out.as_slice() {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version, new.metadata.resource_version);
            }
            other => panic!("expected one replayed update, got {}", other.len()),
        }
    }

    #[test]
    fn story_lister_ignores_other_namespaces() {
        let mut mirror = Mirror::<ConfigMap>::new();
        let lister = mirror.lister();
        listed(&mut mirror, vec![cm("a", "1")]);

        assert!(lister.get("other", "a").expect("lookup").is_none());
    }
}
