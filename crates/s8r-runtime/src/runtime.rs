//! [`Runtime`] – wires the kernel, the event publisher and an optional
//! persistence backend together inside a Tokio runtime.
//!
//! The kernel stays synchronous.  The runtime owns the asynchronous parts:
//! the dispatcher task that drains the publisher into subscribers, and
//! fire-and-forget snapshot writes to the [`PersistencePort`].

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use s8r_kernel::{Kernel, TerminationHooks};
use s8r_middleware::{EventPublisher, EventSubscriber};
use s8r_types::{EventSink, S8rError, SubjectId};
use tokio::sync::watch;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::persistence::PersistencePort;

/// Assembles a [`Runtime`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use s8r_runtime::{InMemoryPersistence, Runtime, RuntimeConfig};
/// use s8r_middleware::LoggingSubscriber;
/// use s8r_types::SubjectKind;
///
/// # #[tokio::main] async fn main() -> Result<(), s8r_types::S8rError> {
/// let runtime = Runtime::builder(RuntimeConfig::default())
///     .with_subscriber(Arc::new(LoggingSubscriber))
///     .with_persistence(Arc::new(InMemoryPersistence::new()))
///     .start();
///
/// let root = runtime.kernel().create_root(SubjectKind::Component, "orchestrator")?;
/// runtime.kernel().terminate(root, "done")?;
/// runtime.shutdown().await;
/// # Ok(()) }
/// ```
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    hooks: TerminationHooks,
    persistence: Option<Arc<dyn PersistencePort>>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl RuntimeBuilder {
    pub fn with_hooks(mut self, hooks: TerminationHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistencePort>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Build the kernel and spawn the dispatcher.  Must be called from
    /// within a Tokio runtime; that runtime also runs every background
    /// snapshot write, whichever thread asks for it.
    pub fn start(self) -> Runtime {
        let handle = Handle::current();
        let publisher = Arc::new(EventPublisher::new(self.config.publisher_config()));
        for subscriber in self.subscribers {
            publisher.subscribe(subscriber);
        }
        let sink: Arc<dyn EventSink> = publisher.clone();
        let kernel =
            Arc::new(Kernel::new(self.config.kernel_config(), sink).with_hooks(self.hooks));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = handle.spawn(Arc::clone(&publisher).run(shutdown_rx));
        info!(
            subscribers = publisher.subscriber_count(),
            persistence = self.persistence.is_some(),
            "lifecycle runtime started"
        );

        Runtime {
            kernel,
            publisher,
            persistence: self.persistence,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
            handle,
        }
    }
}

/// A running lifecycle core.
pub struct Runtime {
    kernel: Arc<Kernel>,
    publisher: Arc<EventPublisher>,
    persistence: Option<Arc<dyn PersistencePort>>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    handle: Handle,
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            hooks: TerminationHooks::default(),
            persistence: None,
            subscribers: Vec::new(),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    /// Snapshot `id` and hand it to the persistence backend without waiting
    /// for the write.  A no-op when no backend is configured.
    ///
    /// Safe to call from any thread, including ones outside the runtime.
    pub fn persist(&self, id: SubjectId) -> Result<(), S8rError> {
        let Some(port) = self.persistence.clone() else {
            return Ok(());
        };
        let snapshot = self.kernel.snapshot(id)?;
        self.handle.spawn(async move {
            if let Err(e) = port.save(snapshot).await {
                warn!(subject = %id, error = %e, "snapshot write failed");
            }
        });
        Ok(())
    }

    /// Snapshot every live subject and wait until all writes have finished.
    /// Returns the number of snapshots written.
    pub async fn checkpoint(&self) -> Result<usize, S8rError> {
        let Some(port) = self.persistence.as_ref() else {
            return Ok(0);
        };
        let snapshots: Vec<_> = self
            .kernel
            .subject_ids()
            .into_iter()
            .filter_map(|id| self.kernel.snapshot(id).ok())
            .collect();
        let written = snapshots.len();
        for result in join_all(snapshots.into_iter().map(|s| port.save(s))).await {
            result?;
        }
        info!(written, "checkpoint complete");
        Ok(written)
    }

    /// Rebuild every stored subject that is not already live, ancestors
    /// first.  Returns the ids restored.
    pub async fn restore_all(&self) -> Result<Vec<SubjectId>, S8rError> {
        let Some(port) = self.persistence.as_ref() else {
            return Ok(Vec::new());
        };
        let mut restored = Vec::new();
        for snapshot in port.load_all().await? {
            match self.kernel.restore(&snapshot) {
                Ok(id) => restored.push(id),
                Err(e) => warn!(
                    subject = %snapshot.identity.id,
                    error = %e,
                    "snapshot not restored"
                ),
            }
        }
        info!(restored = restored.len(), "subjects restored from persistence");
        Ok(restored)
    }

    /// Drop a terminal origin and its subtree from the kernel and from the
    /// persistence backend.
    pub async fn reclaim(&self, id: SubjectId) -> Result<usize, S8rError> {
        let mut ids = self.kernel.subject_ids();
        let released = self.kernel.reclaim(id)?;
        if let Some(port) = self.persistence.as_ref() {
            ids.retain(|candidate| !self.kernel.contains(*candidate));
            for gone in ids {
                port.remove(gone).await?;
            }
        }
        Ok(released)
    }

    /// Stop the dispatcher after it has delivered everything still queued.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "event dispatcher task failed");
        }
        info!("lifecycle runtime stopped");
    }
}
