//! # Processing Engine
//!
//! Drives the processing loop on top of the synchronous store:
//!
//! 1. claim a batch of due entities (leases them)
//! 2. run each through the orchestrator
//! 3. persist the result (or only its errors)
//! 4. stitch the entity and everything its relations touch
//!
//! Every store and stitch call runs on the blocking pool. Each claimed item
//! is its own task, so a failing item never takes its siblings down; the
//! item simply becomes due again when its lease runs out.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    CatalogError, CatalogProcessingOrchestrator, EntityProcessingRequest, EntityProcessingResult,
    EntityProvider, EntityProviderConnection, EntityRef, ProcessableEntity, ProcessedEntityUpdate,
    ProcessingStore, StitchReport, Stitcher,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Items claimed per round.
    pub batch_size: usize,
    /// Sleep when a round found nothing to do.
    pub poll_interval: Duration,
    /// Sleep after a round failed.
    pub error_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

// =============================================================================
// ENGINE
// =============================================================================

struct EngineInner {
    store: Arc<ProcessingStore>,
    orchestrator: Arc<dyn CatalogProcessingOrchestrator>,
    stitcher: Stitcher,
    providers: Vec<Arc<dyn EntityProvider>>,
    config: EngineConfig,
}

/// What happened to one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Processed,
    Failed,
}

/// The catalog processing engine.
#[derive(Clone)]
pub struct ProcessingEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ProcessingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingEngine")
            .field("store", &self.inner.store)
            .field("providers", &self.inner.providers.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ProcessingEngine {
    #[must_use]
    pub fn new(
        store: Arc<ProcessingStore>,
        orchestrator: Arc<dyn CatalogProcessingOrchestrator>,
        stitcher: Stitcher,
        providers: Vec<Arc<dyn EntityProvider>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                orchestrator,
                stitcher,
                providers,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Hand every provider its connection. Providers typically submit their
    /// first full mutation from inside `connect`.
    pub async fn connect_providers(&self) -> Result<(), CatalogError> {
        for provider in &self.inner.providers {
            let provider = Arc::clone(provider);
            let connection = EntityProviderConnection::new(
                Arc::clone(&self.inner.store),
                self.inner.stitcher.clone(),
                provider.provider_name(),
            );
            let name = provider.provider_name().to_string();
            run_blocking(move || provider.connect(connection)).await?;
            tracing::info!(provider = %name, "entity provider connected");
        }
        Ok(())
    }

    /// Connect the providers and spawn the worker loops.
    pub async fn start(self) -> Result<EngineHandle, CatalogError> {
        self.connect_providers().await?;

        let (stop, stop_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for worker in 0..self.inner.config.workers {
            let engine = self.clone();
            let stop_rx = stop_rx.clone();
            workers.spawn(async move { engine.run_worker(worker, stop_rx).await });
        }
        tracing::info!(
            workers = self.inner.config.workers,
            batch_size = self.inner.config.batch_size,
            "processing engine started"
        );

        Ok(EngineHandle { stop, workers })
    }

    /// One round: claim up to `batch_size` due items and see each through.
    ///
    /// Returns the number of items claimed. Item-level failures are logged
    /// and do not fail the round.
    pub async fn process_batch(&self) -> Result<usize, CatalogError> {
        let store = Arc::clone(&self.inner.store);
        let batch_size = self.inner.config.batch_size;
        let items =
            run_blocking(move || store.transaction(|tx| tx.get_processable_entities(batch_size)))
                .await?;
        let claimed = items.len();

        let mut tasks = JoinSet::new();
        for item in items {
            let inner = Arc::clone(&self.inner);
            let entity_ref = item.entity_ref.clone();
            tasks.spawn_blocking(move || (entity_ref, inner.process_item(item)));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((entity_ref, Ok(outcome))) => {
                    tracing::debug!(entity_ref = %entity_ref, ?outcome, "processed entity");
                }
                Ok((entity_ref, Err(e))) => {
                    tracing::warn!(entity_ref = %entity_ref, error = %e, "failed to process entity");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "processing task aborted");
                }
            }
        }

        Ok(claimed)
    }

    async fn run_worker(self, worker: usize, mut stop: watch::Receiver<bool>) {
        tracing::debug!(worker, "processing worker started");

        while !*stop.borrow() {
            let pause = match self.process_batch().await {
                Ok(0) => Some(self.inner.config.poll_interval),
                Ok(claimed) => {
                    tracing::debug!(worker, claimed, "processing round finished");
                    None
                }
                Err(e) => {
                    tracing::warn!(worker, error = %e, "processing round failed");
                    Some(self.inner.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(worker, "processing worker stopped");
    }
}

impl EngineInner {
    /// Process, persist and stitch one claimed item. Runs on the blocking pool.
    fn process_item(&self, item: ProcessableEntity) -> Result<ItemOutcome, CatalogError> {
        let ProcessableEntity {
            entity_id,
            entity_ref,
            unprocessed_entity,
            state,
        } = item;

        let result = self.orchestrator.process(EntityProcessingRequest {
            entity: unprocessed_entity,
            state,
        });

        match result {
            EntityProcessingResult::Failed { errors } => {
                tracing::debug!(entity_ref = %entity_ref, errors = errors.len(), "processing reported errors");
                self.store
                    .transaction(|tx| tx.update_processed_entity_errors(&entity_id, errors))?;
                self.stitch(&BTreeSet::from([entity_ref]))?;
                Ok(ItemOutcome::Failed)
            }
            EntityProcessingResult::Completed {
                mut completed_entity,
                state,
                relations,
                deferred_entities,
                errors,
            } => {
                completed_entity.metadata.uid = Some(entity_id.clone());

                let mut touched: BTreeSet<EntityRef> = relations
                    .iter()
                    .flat_map(|r| [r.source.to_ref(), r.target.to_ref()])
                    .collect();
                touched.insert(entity_ref);

                let pruned = self.store.transaction(|tx| {
                    tx.update_processed_entity(ProcessedEntityUpdate {
                        id: entity_id,
                        processed_entity: completed_entity,
                        state,
                        relations,
                        deferred_entities,
                        errors,
                    })
                })?;
                if !pruned.deleted.is_empty() {
                    tracing::info!(deleted = pruned.deleted.len(), "pruned orphaned entities");
                }
                // Refs deleted by this pass have nothing left to stitch.
                touched.retain(|r| !pruned.deleted.contains(r));
                touched.extend(pruned.restitch);

                self.stitch(&touched)?;
                Ok(ItemOutcome::Processed)
            }
        }
    }

    fn stitch(&self, refs: &BTreeSet<EntityRef>) -> Result<StitchReport, CatalogError> {
        let report = self.stitcher.stitch(refs)?;
        if report.superseded > 0 {
            tracing::debug!(superseded = report.superseded, "stitch superseded by a newer run");
        }
        Ok(report)
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Control handle for a started engine.
#[derive(Debug)]
pub struct EngineHandle {
    stop: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl EngineHandle {
    /// Number of worker loops still running.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker to stop and wait for in-flight rounds to finish.
    pub async fn stop(mut self) -> Result<(), CatalogError> {
        self.stop.send_replace(true);
        while let Some(joined) = self.workers.join_next().await {
            joined.map_err(|e| CatalogError::Task(e.to_string()))?;
        }
        tracing::info!("processing engine stopped");
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Run a synchronous store operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, CatalogError>
where
    F: FnOnce() -> Result<T, CatalogError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CatalogError::Task(e.to_string()))?
}
