//! Server-wide listener registry (§9 design notes).
//!
//! The source this specification was distilled from uses process-wide
//! factories indexed by protocol tag. Here that becomes a capability
//! set — `{Protocol, Listen, Accept, Close, Addr, ConnectionCount}` —
//! built once at start-up from [`ServerConfig`] and held by the `serve`
//! CLI command; there is no global mutable state anywhere in this
//! module.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::catalog::CatalogProvider;
use crate::compile::{DisabledTranspiler, Manager};
use crate::config::{ListenerConfig, ListenerProtocol, ServerConfig, StorageBackendType};
use crate::error::{ServerError, ServerResult};
use crate::protocol::tds::Connection;
use crate::registry::{Loader, Registry, SchemaValidationMode};
use crate::runtime::Runtime;
use crate::storage::{MemoryStorage, SqlServerStorage, Storage};
use crate::tenancy::TenantResolver;

/// One accepting socket, with its own connection counter. Implements
/// the `{Listen, Accept, Close, Addr, ConnectionCount}` part of the §9
/// capability set for a single protocol tag.
pub struct Listener {
    config: ListenerConfig,
    tcp: TcpListener,
    active_connections: AtomicU32,
}

impl Listener {
    async fn bind(config: ListenerConfig) -> ServerResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Connection(format!("failed to bind {addr}: {e}")))?;
        Ok(Self {
            config,
            tcp,
            active_connections: AtomicU32::new(0),
        })
    }

    pub fn protocol(&self) -> ListenerProtocol {
        self.config.protocol
    }

    pub fn addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn connection_count(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    async fn accept(&self) -> ServerResult<(TcpStream, std::net::SocketAddr)> {
        self.tcp
            .accept()
            .await
            .map_err(|e| ServerError::Connection(e.to_string()))
    }
}

/// Everything a `serve` invocation constructs exactly once: the
/// registry, runtime, tenancy resolver, catalog provider, and one
/// [`Listener`] per configured entry. Held behind `Arc`s and passed
/// into per-connection tasks — never behind a `static`.
pub struct Server {
    registry: Arc<Registry>,
    runtime: Arc<Runtime>,
    catalog: Arc<CatalogProvider>,
    tenant_resolver: Arc<TenantResolver>,
    default_database: String,
    listeners: Vec<Arc<Listener>>,
}

impl Server {
    /// Build every collaborator the listeners need and bind each
    /// configured socket. Returns before any connection is accepted;
    /// call [`Server::run`] to start serving.
    pub async fn build(config: &ServerConfig) -> ServerResult<Self> {
        let registry = Arc::new(Registry::new());
        let loader = Loader::new(SchemaValidationMode::WarnOnly);
        let loaded = loader.load_tree(&config.registry_root)?;
        let loaded_count = registry.load_all(loaded)?;
        info!(target: "server", "loaded {loaded_count} procedures from {}", config.registry_root);

        let storage: Arc<dyn Storage> = match config.storage.backend_type {
            StorageBackendType::Memory => Arc::new(MemoryStorage::new()),
            StorageBackendType::SqlServer | StorageBackendType::Postgres => {
                Arc::new(SqlServerStorage::connect(&config.storage).await?)
            }
        };

        let manager = Arc::new(Manager::spawn(Arc::new(DisabledTranspiler), num_cpus()));
        let runtime = Runtime::new(registry.clone(), storage.clone(), manager, config.runtime.clone());

        let catalog = Arc::new(CatalogProvider::new(registry.clone(), storage.clone()));
        let tenant_resolver = Arc::new(TenantResolver::new(&config.tenancy));

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let listener = Listener::bind(listener_config.clone()).await?;
            info!(
                target: "server",
                "listening on {}:{} ({:?})",
                listener_config.host, listener_config.port, listener_config.protocol
            );
            listeners.push(Arc::new(listener));
        }

        Ok(Self {
            registry,
            runtime,
            catalog,
            tenant_resolver,
            default_database: config.storage.database.clone(),
            listeners,
        })
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Accept loop for every configured listener, run concurrently.
    /// Each accepted connection is handed to its own task; a single
    /// connection failing never brings down the listener or the
    /// process.
    pub async fn run(self: Arc<Self>) -> ServerResult<()> {
        let mut tasks = Vec::new();
        for listener in self.listeners.clone() {
            let server = self.clone();
            tasks.push(tokio::spawn(async move { server.serve_listener(listener).await }));
        }
        for task in tasks {
            if let Err(join_err) = task.await {
                error!(target: "server", "listener task panicked: {join_err}");
            }
        }
        Ok(())
    }

    async fn serve_listener(&self, listener: Arc<Listener>) -> ServerResult<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target: "server", "accept error on {}: {err}", listener.config.name);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(target: "server", "failed to set TCP_NODELAY for {peer}: {e}");
            }

            match listener.protocol() {
                ListenerProtocol::Tds => self.spawn_tds_connection(listener.clone(), stream, peer),
                ListenerProtocol::Postgres => {
                    tokio::spawn(async move {
                        let _ = crate::protocol::PostgresFront::handle(stream).await;
                    });
                }
                ListenerProtocol::Http => {
                    tokio::spawn(async move {
                        let _ = crate::protocol::HttpFront::handle(stream).await;
                    });
                }
            }
        }
    }

    fn spawn_tds_connection(&self, listener: Arc<Listener>, stream: TcpStream, peer: std::net::SocketAddr) {
        let registry = self.registry.clone();
        let runtime = self.runtime.clone();
        let catalog = self.catalog.clone();
        let tenant_resolver = self.tenant_resolver.clone();
        let default_database = self.default_database.clone();
        let tls_available = listener.config.tls.as_ref().is_some_and(|tls| tls.enabled);

        listener.active_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut connection = Connection::with_collaborators(
                stream,
                registry,
                runtime,
                Some(catalog),
                Some(tenant_resolver),
                &default_database,
                tls_available,
            );
            if let Err(err) = connection.run().await {
                warn!(target: "server", "connection from {peer} ended with error: {err}");
            }
            listener.active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
