//! # enrichd: Payee Enrichment Service
//!
//! `enrichd` classifies payee names, matches them against a cached supplier
//! snapshot, validates postal addresses, and resolves business payees against
//! an external merchant bulk-search service. It exposes both a progressive
//! single-payee API (`POST /classify-single`) and a bulk CSV upload flow
//! (`POST /upload/preview`, `POST /upload/process`) backed by a durable
//! Batch/Record store.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); persistence is
//! PostgreSQL via `sqlx`, accessed through per-entity repositories in
//! [`db::handlers`]. The merchant bulk-search submit/poll/webhook/reconcile
//! state machine lives in the separate `bsc` crate; this crate only implements
//! [`eo::MerchantGateway`] over it and folds reconciled matches back into
//! Records via [`eo::RecordReconciler`].
//!
//! A record moves through up to four stages — classify, supplier match
//! (finexio), address validation, merchant enrichment — driven either inline
//! (the progressive single-payee path) or by the background batch-tick loop
//! in [`BackgroundServices`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use enrichd::{Application, Config, telemetry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = enrichd::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Database Setup
//!
//! Migrations run automatically on startup, for both this crate's own tables
//! (`batches`, `records`, `suppliers`) and `bsc`'s own (`merchant_searches`,
//! `webhook_events`):
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::Error> {
//! enrichd::db::migrator().run(&pool).await?;
//! bsc::manager::postgres::PostgresSearchStore::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module.

pub mod api;
pub mod av;
pub mod cg;
pub mod config;
pub mod db;
pub mod domain;
pub mod eo;
pub mod errors;
pub mod fm;
pub mod rl;
pub mod sc;
pub mod telemetry;
pub mod upload;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{debug, info};

pub use config::Config;

use av::HttpAddressVendor;
use cg::HttpClassifier;
use db::handlers::BatchRepository;
use eo::{Deps, RecordReconciler, SharedMerchantGateway};
use rl::RateLimiters;
use upload::UploadCache;

/// Shared resources every handler in [`api`] reaches through `State<AppState>`.
///
/// Cheap to clone: every field is either `Copy`, an `Arc`, or (for `PgPool`)
/// already internally reference-counted.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub classifier: Arc<dyn cg::Classifier>,
    pub address_vendor: Arc<dyn av::AddressVendor>,
    pub address_config: Arc<av::AddressValidatorConfig>,
    pub rate_limiters: Arc<RateLimiters>,
    pub merchant: SharedMerchantGateway,
    pub search_store: Arc<bsc::manager::postgres::PostgresSearchStore>,
    pub poller: Arc<bsc::Poller<bsc::manager::postgres::PostgresSearchStore, bsc::client::ReqwestBulkSearchClient, RecordReconciler>>,
    pub upload_cache: Arc<UploadCache>,
}

pub fn migrator() -> sqlx::migrate::Migrator {
    db::migrator()
}

async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("failed to connect to database")?;

    db::migrator().run(&pool).await.context("failed to run enrichd migrations")?;
    bsc::manager::postgres::PostgresSearchStore::migrator()
        .run(&pool)
        .await
        .context("failed to run bsc migrations")?;

    Ok(pool)
}

fn mastercard_env(env: config::MerchantEnv) -> bsc::client::MastercardEnv {
    match env {
        config::MerchantEnv::Production => bsc::client::MastercardEnv::Production,
        config::MerchantEnv::Sandbox => bsc::client::MastercardEnv::Sandbox,
    }
}

/// Builds every process-wide collaborator (classifier, address vendor,
/// signer, bulk-search client, coordinator, poller, rate limiters, upload
/// cache) and assembles them into [`AppState`].
async fn build_app_state(config: Config, pool: PgPool) -> anyhow::Result<AppState> {
    let config = Arc::new(config);

    let classifier: Arc<dyn cg::Classifier> =
        Arc::new(HttpClassifier::new(config.classifier.base_url.clone(), config.classifier.api_key.clone()));
    let address_vendor: Arc<dyn av::AddressVendor> =
        Arc::new(HttpAddressVendor::new(config.address_validator.base_url.clone(), config.address_validator.api_key.clone()));
    let address_config =
        Arc::new(av::AddressValidatorConfig { soft_deadline: Duration::from_secs(5), enable_ai_address_repair: config.enable_ai_address_repair });
    let rate_limiters = Arc::new(RateLimiters::new(&config));

    let signer: Arc<dyn bsc::signer::Signer> = Arc::new(bsc::signer::OAuth1RsaSigner::new(
        config.merchant_search.consumer_key.clone(),
        config.merchant_search.client_id.clone(),
        &config.merchant_search.private_key_pem,
    )?);
    let client = Arc::new(bsc::client::ReqwestBulkSearchClient::new(mastercard_env(config.merchant_search.env), signer));
    let search_store = Arc::new(bsc::manager::postgres::PostgresSearchStore::new(pool.clone()));
    let coordinator = Arc::new(bsc::Coordinator::new(search_store.clone(), client.clone()));
    let merchant: SharedMerchantGateway = coordinator;

    let reconciler = Arc::new(RecordReconciler::new(pool.clone()));
    let schedule = bsc::PollSchedule {
        initial_delay: config.merchant_search.poll_initial,
        base: config.merchant_search.poll_initial,
        max: config.merchant_search.poll_max,
        max_attempts: config.merchant_search.max_attempts,
        hard_deadline: config.merchant_search.hard_deadline,
    };
    let poller = Arc::new(bsc::Poller::new(search_store.clone(), client, reconciler, schedule));

    Ok(AppState {
        db: pool,
        config,
        classifier,
        address_vendor,
        address_config,
        rate_limiters,
        merchant,
        search_store,
        poller,
        upload_cache: Arc::new(UploadCache::new()),
    })
}

/// Wires every spec-level endpoint onto its `api` handler, and applies CORS
/// plus request tracing. Every caller is an internal service (no browser
/// clients are documented for this API), so CORS stays permissive rather than
/// carrying its own allow-list config.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/classify-single", post(api::classify_single))
        .route("/classify-status/{job_id}", get(api::classify_status))
        .route("/upload/preview", post(api::upload_preview))
        .route("/upload/process", post(api::upload_process))
        .route("/upload/batches", get(api::list_batches))
        .route("/upload/batches/{batch_id}", get(api::get_batch))
        .route("/classifications/{batch_id}", get(api::list_classifications))
        .route("/download/{batch_id}", get(api::download_batch))
        .route("/webhooks/mastercard", post(api::webhook_mastercard))
        .route("/health", get(api::health))
        .route("/health/live", get(api::health_live))
        .route("/health/ready", get(api::health_ready))
        .with_state(state)
        .layer(CorsLayer::permissive());

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_request(DefaultOnRequest::new().level(tracing::Level::INFO))
            .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
    )
}

/// Container for the tasks that run alongside the HTTP server: the `bsc`
/// poller (drives merchant search state transitions on a schedule) and the
/// batch-tick loop (drives classify/finexio/address/merchant for every active
/// Batch). Modeled on a JoinSet-based daemon shape: `wait_for_failure` is
/// cancel-safe for `tokio::select!`, `shutdown` cancels and drains.
pub struct BackgroundServices {
    background_tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    task_names: std::collections::HashMap<tokio::task::Id, &'static str>,
    shutdown_token: tokio_util::sync::CancellationToken,
    #[allow(dead_code)]
    drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    pub async fn wait_for_failure(&mut self) -> anyhow::Result<std::convert::Infallible> {
        match self.background_tasks.join_next_with_id().await {
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Some(Ok((task_id, Ok(())))) => {
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::warn!(task = task_name, "background task completed unexpectedly");
                anyhow::bail!("background task '{}' completed early", task_name)
            }
            Some(Ok((task_id, Err(e)))) => {
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::error!(task = task_name, error = %e, "background task failed");
                anyhow::bail!("background task '{}' failed: {}", task_name, e)
            }
            Some(Err(e)) => {
                let task_id = e.id();
                let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                tracing::error!(task = task_name, error = %e, "background task panicked");
                anyhow::bail!("background task '{}' panicked: {}", task_name, e)
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();
        while let Some(result) = self.background_tasks.join_next_with_id().await {
            match result {
                Ok((task_id, Ok(()))) => {
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::debug!(task = task_name, "background task completed");
                }
                Ok((task_id, Err(e))) => {
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::error!(task = task_name, error = %e, "background task failed during shutdown");
                }
                Err(e) => {
                    let task_id = e.id();
                    let task_name = self.task_names.get(&task_id).copied().unwrap_or("unknown");
                    tracing::error!(task = task_name, error = %e, "background task panicked during shutdown");
                }
            }
        }
    }
}

struct BackgroundTaskBuilder {
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    names: std::collections::HashMap<tokio::task::Id, &'static str>,
}

impl BackgroundTaskBuilder {
    fn new() -> Self {
        Self { tasks: tokio::task::JoinSet::new(), names: std::collections::HashMap::new() }
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(future);
        self.names.insert(handle.id(), name);
    }

    fn into_parts(self) -> (tokio::task::JoinSet<anyhow::Result<()>>, std::collections::HashMap<tokio::task::Id, &'static str>) {
        (self.tasks, self.names)
    }
}

const BATCH_TICK_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_TICK_RECORD_LIMIT: i64 = 200;
const BATCH_TICK_ACTIVE_LIMIT: i64 = 50;

/// Runs one `run_batch_tick` per active batch, then sleeps. An active batch
/// with nothing left to do falls out of `list_active` once its overall_status
/// flips to `completed`/`cancelled`/`failed` (§4.8), so this never busy-waits
/// on finished work.
async fn batch_tick_loop(pool: PgPool, state: AppState, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    tracing::info!("batch tick loop starting");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("batch tick loop shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(BATCH_TICK_INTERVAL) => {
                let deps = Deps {
                    pool: &state.db,
                    classifier: state.classifier.as_ref(),
                    address_vendor: state.address_vendor.as_ref(),
                    rate_limiters: state.rate_limiters.as_ref(),
                    address_config: state.address_config.as_ref(),
                    ai_enhance_threshold: state.config.ai_enhance_threshold,
                    merchant_confidence_threshold: eo::DEFAULT_MERCHANT_CONFIDENCE_THRESHOLD,
                };
                let batch_repo = BatchRepository::new(&pool);
                match batch_repo.list_active(BATCH_TICK_ACTIVE_LIMIT).await {
                    Ok(active) => {
                        for batch in active {
                            if let Err(e) = eo::run_batch_tick(&deps, state.merchant.as_ref(), batch.id, BATCH_TICK_RECORD_LIMIT).await {
                                tracing::warn!(batch_id = %batch.id, error = %e, "batch tick failed");
                            }
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to list active batches"),
                }
            }
        }
    }
}

async fn setup_background_services(state: AppState, shutdown_token: tokio_util::sync::CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut builder = BackgroundTaskBuilder::new();

    let poller = state.poller.clone();
    let poller_cancel = shutdown_token.clone();
    builder.spawn("bsc-poller", async move { poller.run(poller_cancel).await.map_err(|e| anyhow::anyhow!(e.to_string())) });

    let tick_pool = state.db.clone();
    let tick_state = state.clone();
    let tick_cancel = shutdown_token.clone();
    builder.spawn("batch-tick-loop", async move { batch_tick_loop(tick_pool, tick_state, tick_cancel).await });

    let (background_tasks, task_names) = builder.into_parts();
    BackgroundServices { background_tasks, task_names, shutdown_token, drop_guard: Some(drop_guard) }
}

/// Top-level container owning the router, state, and background services for
/// the process lifetime.
pub struct Application {
    router: Router,
    config: Arc<Config>,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Primarily for tests, where `sqlx::test` already provides a pool.
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("starting enrichd with configuration: {:#?}", config);

        let pool = match pool {
            Some(pool) => pool,
            None => setup_database(&config).await?,
        };

        let state = build_app_state(config, pool.clone()).await?;
        let config = state.config.clone();

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(state.clone(), shutdown_token).await;

        let router = build_router(state);

        Ok(Self { router, config, pool, bg_services })
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("failed to create test server");
        (server, self.bg_services)
    }

    /// Binds the HTTP server and races it against background-task failure
    /// (fail-fast), then runs cleanup in a fixed order regardless of which
    /// side won: background shutdown, pool close, telemetry shutdown.
    pub async fn serve<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("enrichd listening on http://{}", bind_addr);

        let server_error: Option<anyhow::Error> = tokio::select! {
            result = axum::serve(listener, self.router.into_make_service()).with_graceful_shutdown(shutdown) => {
                result.err().map(Into::into)
            }
            result = self.bg_services.wait_for_failure() => {
                match result {
                    Ok(_infallible) => unreachable!("wait_for_failure never returns Ok"),
                    Err(e) => Some(e),
                }
            }
        };

        info!("shutting down background services...");
        self.bg_services.shutdown().await;

        info!("closing database connections...");
        self.pool.close().await;

        info!("shutting down telemetry...");
        telemetry::shutdown_telemetry();

        if let Some(e) = server_error {
            return Err(e);
        }
        Ok(())
    }
}
