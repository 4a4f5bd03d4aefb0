//! Event ingestion and the worker loop
//!
//! The [`Engine`] is registered as the event handler of both informers. It
//! turns notifications into Foo keys on a rate-limited work queue, and its
//! workers pull keys off that queue and run [`reconcile`].

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::foo::{key_for, reconcile, Context};
use crate::crd::Foo;
use crate::informer::{EventHandler, Notification};
use crate::queue::{default_controller_rate_limiter, RateLimitConfig, WorkQueue};
use crate::workload::controller_of;
use crate::Error;

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Owns the work queue and drives reconciliation
pub struct Engine {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue<String>>,
}

impl Engine {
    /// Create an engine over `ctx` with a fresh queue
    pub fn new(ctx: Arc<Context>, rate_limit: &RateLimitConfig) -> Self {
        Self {
            ctx,
            queue: WorkQueue::new("foos", default_controller_rate_limiter(rate_limit)),
        }
    }

    /// The engine's work queue
    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Queue the Foo for reconciliation
    pub fn enqueue(&self, foo: &Foo) {
        let key = key_for(foo);
        trace!(key = %key, "enqueueing Foo");
        self.queue.add(key);
    }

    /// Queue the Foo controlling `deployment`, if there is one
    ///
    /// A controller reference to another kind, or to a Foo missing from the
    /// cache, means the caches disagree with the cluster; both are reported
    /// as [`Error::InvariantViolation`].
    fn enqueue_owner(&self, deployment: &Deployment) -> Result<(), Error> {
        let Some(owner) = controller_of(&deployment.metadata) else {
            return Ok(());
        };

        let owner_kind = self.ctx.scheme.owner_kind();
        if owner.kind != owner_kind {
            return Err(Error::invariant(format!(
                "deployment {} is controlled by kind {}, expected {}",
                key_for(deployment),
                owner.kind,
                owner_kind
            )));
        }

        let namespace = deployment.namespace().unwrap_or_default();
        match self.ctx.foos.get(&namespace, &owner.name) {
            Ok(Some(foo)) => {
                self.enqueue(&foo);
                Ok(())
            }
            Ok(None) => Err(Error::invariant(format!(
                "deployment {} is controlled by {} {}/{} which is not cached",
                key_for(deployment),
                owner_kind,
                namespace,
                owner.name
            ))),
            Err(e) => Err(Error::invariant(format!(
                "looking up owner of deployment {}: {}",
                key_for(deployment),
                e
            ))),
        }
    }

    /// Wait until both caches report synced
    ///
    /// Returns `false` if `cancel` fired first. With a `timeout`, a warning is
    /// logged once it elapses and `true` is returned so workers start against
    /// whatever has been cached so far.
    pub async fn wait_for_cache_sync(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut poll = tokio::time::interval(CACHE_SYNC_POLL);

        loop {
            if self.ctx.foos.has_synced() && self.ctx.deployments.has_synced() {
                info!("caches synced");
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    timeout_secs = timeout.unwrap_or_default().as_secs(),
                    "timed out waiting for caches to sync, starting workers anyway"
                );
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = poll.tick() => {}
            }
        }
    }

    /// Wait for the caches, then run `workers` workers until `cancel` fires
    ///
    /// Cancelling shuts the queue down; reconciles already in progress run
    /// to completion before this returns.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        cache_sync_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) {
        let shutdown = {
            let queue = self.queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                info!(queue = queue.name(), "shutting down work queue");
                queue.shut_down();
            })
        };

        info!("waiting for informer caches to sync");
        if !self.wait_for_cache_sync(&cancel, cache_sync_timeout).await {
            info!("shutdown requested before caches synced");
            self.queue.shut_down();
            shutdown.abort();
            return;
        }

        let workers = workers.max(1);
        info!(workers, "starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let engine = self.clone();
                tokio::spawn(async move { engine.run_worker(id).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
        shutdown.abort();
        info!("workers stopped");
    }

    async fn run_worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "worker stopped");
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match reconcile(&key, self.ctx.clone()).await {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(key = %key, "synced");
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = self.queue.num_requeues(&key),
                    "reconcile failed, requeueing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(key = %key, error = %e, "reconcile failed, not retrying");
                self.queue.forget(&key);
            }
        }

        self.queue.done(&key);
        true
    }
}

impl EventHandler<Foo> for Engine {
    fn on_event(&self, notification: Notification<Foo>) -> Result<(), Error> {
        match notification {
            Notification::Added(foo) | Notification::Updated { new: foo, .. } => {
                self.enqueue(&foo);
            }
            Notification::Deleted(foo) => {
                debug!(key = %key_for(&*foo), "Foo deleted");
            }
        }
        Ok(())
    }
}

impl EventHandler<Deployment> for Engine {
    fn on_event(&self, notification: Notification<Deployment>) -> Result<(), Error> {
        let deployment = match notification {
            Notification::Updated { old, new } => {
                if old.resource_version() == new.resource_version() {
                    // Periodic resync; nothing changed
                    return Ok(());
                }
                new
            }
            Notification::Added(deployment) | Notification::Deleted(deployment) => deployment,
        };
        if !self.ctx.foos.has_synced() {
            // Owners are not resolvable yet; the initial Foo list enqueues
            // every Foo once it completes.
            trace!(deployment = %key_for(&*deployment), "Foo cache not synced, skipping");
            return Ok(());
        }
        self.enqueue_owner(&deployment)
    }
}
