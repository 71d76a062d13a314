//! Application bootstrap.
//!
//! Brings the components up in dependency order and tears them down in
//! reverse: the prefetch executor stops before the cache flushes.

use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::AppConfig;
use super::error::AppError;
use crate::cache::{AccessPredictor, CacheHierarchy, CacheStats, DisabledPredictor, NeighborhoodPredictor};
use crate::loader::{LoaderStats, ProgressiveLoader, ViewportLoad, ViewportRequest};
use crate::store::{open_source, RasterHandle};
use crate::transform::{BuiltinCrsDictionary, TransformEngine};

/// One open dataset with its cache hierarchy, loader and prefetch executor.
///
/// # Example
///
/// ```ignore
/// use geolayer::app::{AppConfig, GeoLayerApp};
///
/// let app = GeoLayerApp::start(AppConfig::new("https://example.org/ortho.tif")).await?;
/// let load = app.load(ViewportRequest::new(bounds, 0.5)).await?;
/// app.shutdown().await;
/// ```
pub struct GeoLayerApp {
    engine: Arc<TransformEngine>,
    cache: Arc<CacheHierarchy>,
    loader: Arc<ProgressiveLoader>,
    shutdown: CancellationToken,
    prefetch_task: Option<JoinHandle<()>>,

    #[allow(dead_code)]
    config: AppConfig,

    /// Owned runtime when created through `start_sync()`.
    #[allow(dead_code)]
    runtime: Option<Runtime>,
}

impl GeoLayerApp {
    /// Opens the dataset and starts every service on the current runtime.
    pub async fn start(config: AppConfig) -> Result<Self, AppError> {
        Self::start_with_engine(
            config,
            Arc::new(TransformEngine::new(Arc::new(BuiltinCrsDictionary::new()))),
        )
        .await
    }

    /// Like [`start`](Self::start) with a caller-supplied engine, e.g. one
    /// with datum grids registered.
    pub async fn start_with_engine(
        config: AppConfig,
        engine: Arc<TransformEngine>,
    ) -> Result<Self, AppError> {
        let settings = &config.settings;
        info!(source = %config.source, "Starting GeoLayerApp");

        // 1. Dataset: fatal format/index errors surface here.
        let source = open_source(&config.source, &settings.http_config()).await?;
        let handle = RasterHandle::open(source, settings.store_options()).await?;
        let dataset_id = config
            .dataset_id
            .clone()
            .unwrap_or_else(|| handle.dataset_id().to_string());
        info!(
            dataset = %dataset_id,
            levels = handle.level_count(),
            "Dataset opened"
        );

        // 2. Cache hierarchy and its tier worker.
        let predictor: Arc<dyn AccessPredictor> = if settings.cache.prefetch_enabled {
            Arc::new(NeighborhoodPredictor::new())
        } else {
            Arc::new(DisabledPredictor)
        };
        let (cache, prefetch_rx) =
            CacheHierarchy::start(settings.cache_config(), dataset_id, predictor).await?;
        let cache = Arc::new(cache);

        // 3. Loader and the prefetch executor draining the cache's requests.
        let loader = Arc::new(ProgressiveLoader::new(
            handle,
            Arc::clone(&cache),
            Arc::clone(&engine),
            settings.loader_options(),
        ));
        let shutdown = CancellationToken::new();
        let prefetch_task = settings.cache.prefetch_enabled.then(|| {
            tokio::spawn(Arc::clone(&loader).run_prefetch(prefetch_rx, shutdown.clone()))
        });

        info!(prefetch = prefetch_task.is_some(), "GeoLayerApp started");
        Ok(Self {
            engine,
            cache,
            loader,
            shutdown,
            prefetch_task,
            config,
            runtime: None,
        })
    }

    /// Starts the application on a dedicated runtime it owns.
    pub fn start_sync(config: AppConfig) -> Result<Self, AppError> {
        let runtime = Runtime::new().map_err(|e| AppError::RuntimeCreation(e.to_string()))?;
        let mut app = runtime.block_on(Self::start(config))?;
        app.runtime = Some(runtime);
        Ok(app)
    }

    /// Loads a viewport, superseding any load still in flight.
    pub async fn load(&self, request: ViewportRequest) -> Result<ViewportLoad, AppError> {
        Ok(self.loader.load(request).await?)
    }

    pub fn loader(&self) -> &Arc<ProgressiveLoader> {
        &self.loader
    }

    pub fn cache(&self) -> &Arc<CacheHierarchy> {
        &self.cache
    }

    pub fn handle(&self) -> &RasterHandle {
        self.loader.handle()
    }

    pub fn engine(&self) -> &Arc<TransformEngine> {
        &self.engine
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn loader_stats(&self) -> LoaderStats {
        self.loader.stats()
    }

    /// Stops prefetching, cancels outstanding loads and flushes the cache.
    pub async fn shutdown(mut self) {
        info!("Shutting down GeoLayerApp");
        self.shutdown.cancel();
        self.loader.cancel_outstanding();
        if let Some(task) = self.prefetch_task.take() {
            let _ = task.await;
        }
        self.cache.shutdown().await;
        info!(
            loader = ?self.loader.stats(),
            "GeoLayerApp stopped"
        );
    }
}

impl Drop for GeoLayerApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
