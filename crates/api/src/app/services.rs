//! Runtime wiring: stores, adapters, workers.
//!
//! `CLINSYNC_DATABASE_URL` selects Postgres; without it everything runs in
//! memory (dev/test), including the legacy EMR tables.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use clinsync_core::{RetryPolicy, TargetSystem};
use clinsync_infra::{
    adapters::{
        Adapters, FhirServerAdapter, InMemoryLegacyRepository, LegacyEmrAdapter, LegacyRepository,
        PostgresLegacyRepository,
    },
    admin::{SyncAdmin, SyncOperations},
    config::{FhirConfig, SyncConfig},
    credentials::{CredentialCache, HttpTokenFetcher},
    enqueue::Enqueuer,
    ledger::{ExternalLinks, InMemoryLedgerStore, LedgerStore, PostgresLedgerStore},
    payload::PayloadBuilders,
    workers::{
        BatchSweeper, Dispatcher, PoolStats, RetentionSweeper, SyncExecutor, WorkerHandle,
        WorkerPool, WorkerPoolHandle,
    },
};

/// Everything that runs behind one ledger store.
#[derive(Debug)]
pub struct SyncRuntime<S> {
    store: S,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    pool: WorkerPoolHandle,
    sweeper: WorkerHandle,
    retention: WorkerHandle,
}

impl<S> SyncRuntime<S>
where
    S: LedgerStore + ExternalLinks + Clone,
{
    /// Spawn the worker pool, batch sweeper and retention sweeper.
    pub fn start(store: S, builders: PayloadBuilders, adapters: Adapters, config: &SyncConfig) -> Self {
        let (dispatcher, queue) = Dispatcher::channel(config.pool.queue_capacity);
        let executor = Arc::new(SyncExecutor::new(
            store.clone(),
            builders,
            adapters,
            config.retry.clone(),
            config.delivery_timeout,
        ));

        let pool = WorkerPool::spawn(executor, queue, &config.pool);
        let sweeper = BatchSweeper::new(
            store.clone(),
            dispatcher.clone(),
            config.retry.clone(),
            config.sweeper.clone(),
        )
        .spawn();
        let retention = RetentionSweeper::new(store.clone(), config.retention.clone()).spawn();

        Self {
            store,
            dispatcher,
            policy: config.retry.clone(),
            pool,
            sweeper,
            retention,
        }
    }

    /// Write-side entry point for the business layer.
    pub fn enqueuer(&self) -> Enqueuer<S> {
        Enqueuer::new(self.store.clone(), self.dispatcher.clone(), self.policy.clone())
    }

    pub fn operations(&self) -> Arc<dyn SyncOperations> {
        SyncAdmin::new(self.store.clone(), self.dispatcher.clone()).into_operations()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the sweepers first so nothing new is queued, then drain the pool.
    pub async fn shutdown(self) {
        self.sweeper.shutdown().await;
        self.retention.shutdown().await;
        self.pool.shutdown().await;
        tracing::info!("sync runtime stopped");
    }
}

/// The runtime for whichever store the configuration selected.
#[derive(Debug)]
pub enum AppServices {
    InMemory {
        runtime: SyncRuntime<Arc<InMemoryLedgerStore>>,
    },
    Persistent {
        runtime: SyncRuntime<PostgresLedgerStore>,
    },
}

impl AppServices {
    pub fn operations(&self) -> Arc<dyn SyncOperations> {
        match self {
            AppServices::InMemory { runtime } => runtime.operations(),
            AppServices::Persistent { runtime } => runtime.operations(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        match self {
            AppServices::InMemory { runtime } => runtime.pool_stats(),
            AppServices::Persistent { runtime } => runtime.pool_stats(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            AppServices::InMemory { runtime } => runtime.shutdown().await,
            AppServices::Persistent { runtime } => runtime.shutdown().await,
        }
    }
}

pub async fn build_services(config: &SyncConfig) -> anyhow::Result<AppServices> {
    let builders = PayloadBuilders::with_defaults(config.fhir.identifier_system.clone());
    let fhir = fhir_adapter(&config.fhir)?;

    match &config.database_url {
        None => {
            tracing::warn!("CLINSYNC_DATABASE_URL not set; using in-memory ledger and legacy tables");
            let store = InMemoryLedgerStore::arc();
            let legacy = Arc::new(InMemoryLegacyRepository::new());
            let adapters = adapters(legacy, fhir);
            Ok(AppServices::InMemory {
                runtime: SyncRuntime::start(store, builders, adapters, config),
            })
        }
        Some(url) => {
            let pool = connect(url)
                .await
                .context("failed to connect to the ledger database")?;
            let store = PostgresLedgerStore::new(pool.clone());
            store
                .ensure_schema()
                .await
                .context("failed to create ledger schema")?;

            let legacy_pool = match &config.legacy_database_url {
                Some(url) => connect(url)
                    .await
                    .context("failed to connect to the legacy EMR database")?,
                None => pool,
            };
            let adapters = adapters(PostgresLegacyRepository::new(legacy_pool), fhir);
            Ok(AppServices::Persistent {
                runtime: SyncRuntime::start(store, builders, adapters, config),
            })
        }
    }
}

async fn connect(url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(10).connect(url).await
}

fn adapters(legacy: impl LegacyRepository + 'static, fhir: FhirServerAdapter) -> Adapters {
    Adapters::new().with(LegacyEmrAdapter::new(legacy)).with(fhir)
}

fn fhir_adapter(config: &FhirConfig) -> anyhow::Result<FhirServerAdapter> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let mut adapter =
        FhirServerAdapter::new(client.clone(), config.base_url.clone(), config.request_timeout);

    if let Some(credentials) = &config.credentials {
        let fetcher = HttpTokenFetcher::new(client)
            .with_timeout(config.request_timeout)
            .with_credentials(TargetSystem::FhirServer, credentials.clone());
        adapter = adapter.with_credentials(Arc::new(CredentialCache::new(Arc::new(fetcher))));
    } else {
        tracing::info!("no FHIR client credentials configured; requests are unauthenticated");
    }
    Ok(adapter)
}
