//! [`AuthNode`]: owns everything one server process needs.
//!
//! A node is created at process start and shut down at process stop. It
//! owns the registry and state machine (which outlive reloads), the
//! current [`AuthService`] and [`Gate`] (which a reload rebuilds), and,
//! depending on [`SyncRole`], a sync hub or client with its background
//! task.
//!
//! ```text
//!               ┌───────────────── AuthNode ─────────────────┐
//!  host events →│ player_join / check / command / player_quit │
//!               │        │                                    │
//!               │   Runtime (swapped on reload)               │
//!               │     ├─ AuthService ─→ StorageWorker → store │
//!               │     └─ Gate<NodeSource>                     │
//!               │   AuthMachine (stable) ←── SyncHub listener │
//!               └─────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use authgate_protocol::{AuthState, PlayerId};
use authgate_session::{AuthMachine, AuthRegistry, AuthService, SessionError, StateSource};
use authgate_store::{CredentialStore, FileStore, MemoryStore, SqliteStore, StorageWorker};
use authgate_sync::{SyncClient, SyncHub};
use authgate_totp::{MemoryReplayCache, Totp};
use authgate_transport::{WebSocketConnector, WebSocketTransport};
use tokio::task::JoinHandle;

use crate::commands::{
    Command, CommandOutcome, CommandSender, PERMISSION_RELOAD, PERMISSION_REMOVE_OTHERS,
    PERMISSION_SETUP,
};
use crate::{
    Action, AuthGateConfig, AuthGateError, CodeResult, Decision, Gate, StorageBackend, SyncRole,
};

/// Where a node's gate gets its answers.
#[derive(Clone)]
pub enum NodeSource {
    /// This process owns the state (standalone or proxy).
    Local(Arc<AuthService>),
    /// A backend mirroring its proxy.
    Remote(SyncClient),
}

impl StateSource for NodeSource {
    async fn query_state(&self, player_id: PlayerId) -> AuthState {
        match self {
            Self::Local(service) => service.get_state(player_id),
            Self::Remote(client) => client.resolve(player_id).await,
        }
    }
}

struct Runtime {
    config: AuthGateConfig,
    service: Arc<AuthService>,
    gate: Gate<NodeSource>,
}

enum NodeSync {
    Standalone,
    Proxy {
        hub: Arc<SyncHub>,
        addr: Option<SocketAddr>,
    },
    Backend(SyncClient),
}

pub struct AuthNode {
    config_path: Option<PathBuf>,
    machine: Arc<AuthMachine>,
    runtime: RwLock<Arc<Runtime>>,
    sync: NodeSync,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuthNode {
    /// Loads (or creates) the config at `path` and starts a node from it.
    /// [`reload`](Self::reload) re-reads the same file.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self, AuthGateError> {
        let path = path.into();
        let config = AuthGateConfig::load_or_create(&path)?;
        let mut node = Self::start(config).await?;
        node.config_path = Some(path);
        Ok(node)
    }

    /// Opens storage and, for proxies and backends, brings up sync.
    ///
    /// # Errors
    /// Fails if the store can't be opened, the TOTP settings are invalid,
    /// or a proxy can't bind its sync address.
    pub async fn start(config: AuthGateConfig) -> Result<Self, AuthGateError> {
        let machine = Arc::new(AuthMachine::new(Arc::new(AuthRegistry::new())));
        let mut tasks = Vec::new();

        let sync = match &config.sync.role {
            SyncRole::Standalone => NodeSync::Standalone,
            SyncRole::Proxy { bind } => {
                let transport = WebSocketTransport::bind(bind).await?;
                let addr = transport.local_addr().ok();
                let hub = Arc::new(SyncHub::new(
                    Arc::clone(&machine),
                    config.sync.hub_config(),
                ));
                let serving = Arc::clone(&hub);
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = serving.serve(transport).await {
                        tracing::error!(error = %e, "sync hub stopped");
                    }
                }));
                tracing::info!(addr = ?addr, "sync hub listening");
                NodeSync::Proxy { hub, addr }
            }
            SyncRole::Backend { proxy_url, node } => {
                let client = SyncClient::new(Arc::clone(&machine), config.sync.client_config(node));
                let running = client.clone();
                let connector = WebSocketConnector::new(proxy_url.clone());
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = running.run(connector).await {
                        tracing::error!(error = %e, "sync client stopped");
                    }
                }));
                NodeSync::Backend(client)
            }
        };

        let runtime = build_runtime(config, &machine, &sync, None).await?;
        tracing::info!(role = runtime.config.sync.role.name(), "auth node started");

        Ok(Self {
            config_path: None,
            machine,
            runtime: RwLock::new(Arc::new(runtime)),
            sync,
            tasks: Mutex::new(tasks),
        })
    }

    fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.runtime.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn machine(&self) -> &Arc<AuthMachine> {
        &self.machine
    }

    pub fn service(&self) -> Arc<AuthService> {
        Arc::clone(&self.runtime().service)
    }

    pub fn config(&self) -> AuthGateConfig {
        self.runtime().config.clone()
    }

    pub fn hub(&self) -> Option<&Arc<SyncHub>> {
        match &self.sync {
            NodeSync::Proxy { hub, .. } => Some(hub),
            _ => None,
        }
    }

    /// Where the proxy's sync hub is listening.
    pub fn sync_addr(&self) -> Option<SocketAddr> {
        match &self.sync {
            NodeSync::Proxy { addr, .. } => *addr,
            _ => None,
        }
    }

    pub fn sync_client(&self) -> Option<&SyncClient> {
        match &self.sync {
            NodeSync::Backend(client) => Some(client),
            _ => None,
        }
    }

    fn role_name(&self) -> &'static str {
        match self.sync {
            NodeSync::Standalone => "standalone",
            NodeSync::Proxy { .. } => "proxy",
            NodeSync::Backend(_) => "backend",
        }
    }

    /// The local service, unless this is a backend (whose state belongs
    /// to the proxy).
    fn local_service(&self) -> Result<Arc<AuthService>, AuthGateError> {
        match self.sync {
            NodeSync::Backend(_) => Err(AuthGateError::WrongRole("backend")),
            _ => Ok(self.service()),
        }
    }

    // -- Host events ------------------------------------------------------

    /// A player connected to this process.
    pub async fn player_join(&self, player_id: PlayerId, address: Option<String>) -> AuthState {
        match &self.sync {
            NodeSync::Backend(client) => {
                client.player_joined(player_id, address);
                client.resolve(player_id).await
            }
            _ => self.service().on_connect(player_id, address).await,
        }
    }

    pub fn player_quit(&self, player_id: PlayerId) {
        match &self.sync {
            NodeSync::Backend(client) => client.player_left(player_id),
            NodeSync::Proxy { hub, .. } => {
                hub.player_left(player_id);
                self.service().on_disconnect(player_id);
            }
            NodeSync::Standalone => self.service().on_disconnect(player_id),
        }
    }

    /// The proxy routed a player to backend `node`. Returns `true` if the
    /// backend was sent their state.
    pub fn player_switch(&self, player_id: PlayerId, node: &str) -> bool {
        match &self.sync {
            NodeSync::Proxy { hub, .. } => hub.player_switch(player_id, node),
            _ => false,
        }
    }

    pub async fn check(&self, player_id: PlayerId, action: Action<'_>) -> Decision {
        let runtime = self.runtime();
        runtime.gate.check(player_id, action).await
    }

    /// `/2fa <code...>`.
    pub async fn submit_code<A: AsRef<str>>(
        &self,
        player_id: PlayerId,
        args: &[A],
    ) -> Result<CodeResult, AuthGateError> {
        let service = self.local_service()?;
        let runtime = self.runtime();
        Ok(runtime.gate.submit_code(&service, player_id, args).await?)
    }

    // -- Commands ---------------------------------------------------------

    /// Runs `/2fa <args>` for `sender`.
    pub async fn command<A: AsRef<str>>(
        &self,
        sender: &impl CommandSender,
        args: &[A],
    ) -> Result<CommandOutcome, AuthGateError> {
        match Command::parse(args) {
            Command::Enable => {
                let Some(player_id) = sender.player_id() else {
                    return Ok(CommandOutcome::MustBePlayer);
                };
                if !sender.has_permission(PERMISSION_SETUP) {
                    return Ok(CommandOutcome::NoPermission);
                }
                match self.local_service()?.enroll(player_id).await {
                    Ok(enrollment) => Ok(CommandOutcome::Enrolled(enrollment)),
                    Err(SessionError::AlreadyEnrolled(_)) => Ok(CommandOutcome::AlreadySetUp),
                    Err(e) => Err(e.into()),
                }
            }
            Command::Disable { targets } if targets.is_empty() => {
                let Some(player_id) = sender.player_id() else {
                    return Ok(CommandOutcome::MustBePlayer);
                };
                let service = self.local_service()?;
                if !service.storage().has_secret(player_id).await? {
                    return Ok(CommandOutcome::NotSetUp);
                }
                service.reset(player_id).await?;
                Ok(CommandOutcome::Disabled)
            }
            Command::Disable { targets } => {
                if !sender.has_permission(PERMISSION_REMOVE_OTHERS) {
                    return Ok(CommandOutcome::NoPermission);
                }
                let service = self.local_service()?;
                let mut reset = Vec::new();
                let mut unknown = Vec::new();
                for target in targets {
                    match sender.resolve_player(&target) {
                        Some(player_id) => {
                            service.reset(player_id).await?;
                            reset.push(player_id);
                        }
                        None => unknown.push(target),
                    }
                }
                Ok(CommandOutcome::DisabledOthers { reset, unknown })
            }
            Command::Reload => {
                if !sender.has_permission(PERMISSION_RELOAD) {
                    return Ok(CommandOutcome::NoPermission);
                }
                let kept = self.reload().await?;
                Ok(CommandOutcome::Reloaded { kept })
            }
            Command::Submit { code } => {
                let Some(player_id) = sender.player_id() else {
                    return Ok(CommandOutcome::MustBePlayer);
                };
                Ok(CommandOutcome::Code(self.submit_code(player_id, &code).await?))
            }
        }
    }

    // -- Reload -----------------------------------------------------------

    /// Re-reads the config (if the node was started from a file) and
    /// rebuilds the service and gate. Returns how many connected players
    /// kept their state.
    ///
    /// Connected players are not reconnected: their registry entries stay
    /// live throughout, so gate checks keep answering from the state they
    /// had. Once the new store is in place each player is re-checked
    /// against it, and only a player whose credential the new store
    /// contradicts changes state.
    ///
    /// The sync role is fixed for the life of the node; a changed role
    /// is logged and ignored.
    pub async fn reload(&self) -> Result<usize, AuthGateError> {
        let current = self.runtime();
        let mut config = match &self.config_path {
            Some(path) => AuthGateConfig::load_or_create(path)?,
            None => current.config.clone(),
        };
        if config.sync.role != current.config.sync.role {
            tracing::warn!(
                from = current.config.sync.role.name(),
                to = config.sync.role.name(),
                "sync role changes need a restart, keeping the current role"
            );
            config.sync.role = current.config.sync.role.clone();
        }

        let snapshot = current.service.snapshot();
        let next = build_runtime(config, &self.machine, &self.sync, Some(current.as_ref())).await?;

        let kept = match self.sync {
            // A backend's registry mirrors the proxy; there's nothing to
            // re-derive locally.
            NodeSync::Backend(_) => snapshot.len(),
            _ => next.service.restore(&snapshot).await,
        };

        let previous = std::mem::replace(
            &mut *self.runtime.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(next),
        );
        previous.service.storage().shutdown();
        tracing::info!(players = snapshot.len(), kept, "reloaded");
        Ok(kept)
    }

    /// Stops sync tasks and the storage worker.
    pub fn shutdown(&self) {
        if let NodeSync::Backend(client) = &self.sync {
            client.shutdown();
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.runtime().service.storage().shutdown();
        tracing::info!(role = self.role_name(), "auth node stopped");
    }
}

fn open_store(config: &AuthGateConfig) -> Result<Arc<dyn CredentialStore>, AuthGateError> {
    let store: Arc<dyn CredentialStore> = match &config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite { path } => {
            Arc::new(SqliteStore::open(path, &config.storage.table_prefix)?)
        }
        StorageBackend::File { path } => Arc::new(FileStore::open(path)?),
    };
    Ok(store)
}

/// Builds a service and gate for `config`. `previous` is the runtime being
/// replaced; its store is kept if the backend settings didn't change.
async fn build_runtime(
    config: AuthGateConfig,
    machine: &Arc<AuthMachine>,
    sync: &NodeSync,
    previous: Option<&Runtime>,
) -> Result<Runtime, AuthGateError> {
    let reusable = previous.filter(|runtime| {
        runtime.config.storage.backend == config.storage.backend
            && runtime.config.storage.table_prefix == config.storage.table_prefix
    });
    let store = match reusable {
        Some(runtime) => Arc::clone(runtime.service.storage().store()),
        None => open_store(&config)?,
    };
    let storage = StorageWorker::new(store, config.storage.workers);
    // Failure is logged by the worker; the store retries on first use.
    let _ = storage.init().await;

    let totp = Totp::new(config.totp.clone())?;
    let mut service = AuthService::new(
        Arc::clone(machine),
        storage,
        totp,
        config.session.clone(),
    );
    if config.replay.enabled {
        service = service.with_replay_cache(Arc::new(MemoryReplayCache::new(config.replay_ttl())));
    }
    let service = Arc::new(service);

    let source = match sync {
        NodeSync::Backend(client) => NodeSource::Remote(client.clone()),
        _ => NodeSource::Local(Arc::clone(&service)),
    };
    let gate = Gate::new(source, config.gate.clone());

    Ok(Runtime {
        config,
        service,
        gate,
    })
}
