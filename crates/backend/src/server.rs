//! The assembled backend process.

use crate::{
    kraken, AppState, Config, DynProber, HttpProber, Metrics, TestPool,
    TestPoolConfig,
};
use rdsys_api::{RdError, RdResult};
use rdsys_core::{BackendResources, Collection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// How long in-flight requests get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running rdsys backend: collection, test pool, kraken, and web api.
pub struct Backend {
    state: AppState,
    addr: SocketAddr,
    handle: axum_server::Handle,
    server_task: tokio::task::JoinHandle<std::io::Result<()>>,
    kraken_task: tokio::task::JoinHandle<()>,
    // Held for its dispatcher task; dropped on shutdown.
    _test_pool: TestPool,
}

impl Backend {
    /// Spawn a backend with probers built from the configuration.
    pub async fn spawn(config: Config) -> RdResult<Backend> {
        let bridgestrap = HttpProber::new(
            config.backend.bridgestrap_endpoint.clone(),
            config.backend.bridgestrap_token.clone(),
        );
        let onbasca = HttpProber::new(
            config.backend.onbasca_endpoint.clone(),
            config.backend.onbasca_token.clone(),
        );
        Self::spawn_with_probers(config, bridgestrap, onbasca).await
    }

    /// Spawn a backend with the given probers. Tests inject in-process
    /// dummies here.
    pub async fn spawn_with_probers(
        config: Config,
        bridgestrap: DynProber,
        onbasca: DynProber,
    ) -> RdResult<Backend> {
        tracing::info!("Initialising backend.");
        let config = Arc::new(config.backend);
        let registry = Arc::new(rdsys_resources::default_registry());
        let metrics = Arc::new(Metrics::new());

        let collection = Collection::new(
            &config.collection_config(&registry),
            &registry,
        );
        let resources = Arc::new(BackendResources::new(collection));

        let test_pool = TestPool::new(
            TestPoolConfig {
                bandwidth_ratio_threshold: config.bandwidth_ratio_threshold,
                ..Default::default()
            },
            bridgestrap,
            onbasca,
        );
        let test_func = test_pool.test_func();

        // Parse the bridge descriptors before answering any requests.
        {
            let config = config.clone();
            let resources = resources.clone();
            let registry = registry.clone();
            let test_func = test_func.clone();
            let metrics = metrics.clone();
            tokio::task::spawn_blocking(move || {
                kraken::startup(
                    &config, &resources, &registry, &test_func, &metrics,
                );
            })
            .await
            .map_err(RdError::other)?;
        }
        tracing::info!("Kraken finished parsing bridge descriptors.");

        let kraken_task = tokio::spawn(kraken::run(
            config.clone(),
            resources.clone(),
            registry.clone(),
            test_func,
            metrics.clone(),
        ));

        let state = AppState {
            config: config.clone(),
            resources,
            registry,
            metrics,
        };
        let app = crate::router(state.clone());

        tracing::info!("Starting Web API at {}.", config.api_address);
        let listener = std::net::TcpListener::bind(&config.api_address)
            .map_err(RdError::other)?;
        let addr = listener.local_addr().map_err(RdError::other)?;

        let handle = axum_server::Handle::new();
        let server = axum_server::Server::from_tcp(listener)
            .handle(handle.clone());
        let server_task = match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let tls =
                    axum_server::tls_rustls::RustlsConfig::from_pem_file(
                        cert_file, key_file,
                    )
                    .await
                    .map_err(RdError::other)?;
                let acceptor =
                    axum_server::tls_rustls::RustlsAcceptor::new(tls);
                tokio::spawn(
                    server
                        .acceptor(acceptor)
                        .serve(app.into_make_service()),
                )
            }
            _ => tokio::spawn(server.serve(app.into_make_service())),
        };

        Ok(Backend {
            state,
            addr,
            handle,
            server_task,
            kraken_task,
            _test_pool: test_pool,
        })
    }

    /// The address the web api is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The backend's resource collection, mainly for tests.
    pub fn resources(&self) -> &Arc<BackendResources> {
        &self.state.resources
    }

    /// Shut the backend down, giving in-flight requests a grace
    /// period.
    pub async fn shutdown(self) {
        self.kraken_task.abort();
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        match self.server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Web API shut down: {err}"),
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::warn!("Web API task panicked: {err}"),
        }
        tracing::info!("All tasks have finished. Exiting.");
    }
}
