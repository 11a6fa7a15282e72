//! The site manager
//!
//! [`SiteManager`] is an explicit, shareable handle. It owns the control
//! server, the docid allocator, the three queues, and the two daemons, and
//! moves them through `Uninitialized → Initializing → Running → ShuttingDown →
//! Stopped`.

use crate::config::{compute_config_hash, SiteConfig, MAX_PERIOD_MS};
use crate::control::{
    advertised_address, publish, CommandDescriptor, CommandDocument, CommandHandler, ControlError, ControlServer,
    Publication,
};
use crate::daemon::{spawn_recurring, Backuper, DaemonHandle, QueueReclaimer};
use crate::manager::recovery::{recover, RecoveryOutcome};
use crate::manager::{ConfigSource, ControlStatus, InitStage, InitWarning};
use crate::output::{load_statistics, FrontierStatistics};
use crate::state::ManagerState;
use crate::storage::{Frontier, SqliteDocidAllocator, SqliteQueue};
use crate::{Result, SiteError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

/// Everything `init()` builds
struct Components {
    config: SiteConfig,
    control: Option<Arc<ControlServer>>,
    control_status: ControlStatus,
    docids: Arc<SqliteDocidAllocator>,
    frontier: Frontier,
    backuper: Arc<Backuper>,
    recovery: RecoveryOutcome,
    warnings: Vec<InitWarning>,
}

/// Resources opened so far by an `init()` that may still fail
#[derive(Default)]
struct Partial {
    control: Option<Arc<ControlServer>>,
    docids: Option<Arc<SqliteDocidAllocator>>,
    frontier: Option<Frontier>,
    daemons: Vec<DaemonHandle>,
}

impl Partial {
    /// Releases in reverse order of acquisition
    async fn release(&mut self) {
        for daemon in self.daemons.drain(..) {
            daemon.stop().await;
        }
        if let Some(frontier) = self.frontier.take() {
            if let Err(e) = frontier.close() {
                tracing::warn!(error = %e, "Failed to close queues after aborted init");
            }
        }
        if let Some(docids) = self.docids.take() {
            if let Err(e) = docids.close() {
                tracing::warn!(error = %e, "Failed to close docid allocator after aborted init");
            }
        }
        if let Some(control) = self.control.take() {
            control.shutdown().await;
        }
    }
}

/// Crawl frontier manager for one site
pub struct SiteManager {
    source: ConfigSource,
    state: Mutex<ManagerState>,
    components: OnceCell<Components>,
    daemons: Mutex<Vec<DaemonHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown_signal: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl SiteManager {
    /// Creates an uninitialized manager
    ///
    /// # Arguments
    ///
    /// * `source` - A config file path or an already built [`SiteConfig`]
    pub fn new(source: impl Into<ConfigSource>) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            state: Mutex::new(ManagerState::Uninitialized),
            components: OnceCell::new(),
            daemons: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            shutdown_signal: watch::channel(false).0,
            stopped: watch::channel(false).0,
            shutdown_lock: tokio::sync::Mutex::new(()),
        })
    }

    // ===== Lifecycle =====

    /// Initializes the manager
    ///
    /// Loads the configuration, binds and publishes the control server, opens
    /// the docid allocator and the queues, runs recovery, and schedules the
    /// daemons. Concurrent and repeated calls initialize once; every caller
    /// observes the same components.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Initialized, waiting for `start()`
    /// * `Err(SiteError::Init)` - A stage failed; everything opened was released
    ///   and the manager is `Stopped`
    pub async fn init(&self) -> Result<()> {
        self.components.get_or_try_init(|| self.initialize()).await?;
        Ok(())
    }

    /// Starts serving control commands and watching for the shutdown signal
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let components = self.components()?;
        self.transition(ManagerState::Running)?;

        if let Some(control) = &components.control {
            control.start(Arc::new(ManagerCommands {
                manager: Arc::downgrade(self),
            }))?;
        }

        let mut signal = self.shutdown_signal.subscribe();
        let manager = Arc::downgrade(self);
        let monitor = tokio::spawn(async move {
            let _ = signal.wait_for(|raised| *raised).await;
            if let Some(manager) = manager.upgrade() {
                if let Err(e) = manager.shutdown().await {
                    tracing::error!(error = %e, "Shutdown finished with errors");
                }
            }
        });
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);

        tracing::info!(
            site = %components.config.site.site_id,
            control = ?components.control_status.local_addr(),
            "Site manager running"
        );
        Ok(())
    }

    /// Asks a running manager to shut down; returns immediately
    pub fn request_shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.shutdown_signal.send_replace(true);
    }

    /// Stops the control server and the daemons, writes a final backup, and closes storage
    ///
    /// Idempotent: once stopped, further calls return `Ok(())` and do nothing.
    /// If closing storage fails the manager stays in `ShuttingDown` and the
    /// next call retries the close.
    pub async fn shutdown(&self) -> Result<()> {
        let _serialized = self.shutdown_lock.lock().await;

        match self.state() {
            ManagerState::Stopped => return Ok(()),
            ManagerState::ShuttingDown => {
                tracing::info!("Retrying storage close");
                return self.close_storage(self.components()?);
            }
            _ => {}
        }
        let components = self.components()?;
        self.transition(ManagerState::ShuttingDown)?;
        self.shutdown_signal.send_replace(true);
        tracing::info!(site = %components.config.site.site_id, "Shutting down site manager");

        if let Some(control) = &components.control {
            control.shutdown().await;
        }

        let daemons = std::mem::take(&mut *self.daemons.lock().unwrap_or_else(PoisonError::into_inner));
        for daemon in daemons {
            daemon.stop().await;
        }

        let backup = components.backuper.backup();
        match &backup {
            Ok(tasks) => tracing::info!(tasks, "Final backup written"),
            Err(e) => tracing::error!(error = %e, "Final backup failed"),
        }

        self.close_storage(components)?;
        backup?;
        Ok(())
    }

    /// Closes the queues and the allocator, then marks the manager `Stopped`
    fn close_storage(&self, components: &Components) -> Result<()> {
        let mut first_error: Option<SiteError> = None;

        match components.frontier.close() {
            Ok(closed) => tracing::debug!(closed, "Queues closed"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to close queues");
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = components.docids.close() {
            tracing::error!(error = %e, "Failed to close docid allocator");
            first_error.get_or_insert(e.into());
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.transition(ManagerState::Stopped)?;
        self.stopped.send_replace(true);
        tracing::info!("Site manager stopped");
        Ok(())
    }

    /// Waits until the manager reaches `Stopped`
    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    // ===== Accessors =====

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true once shutdown has been requested or has begun
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_signal.borrow() || self.state().is_shutdown()
    }

    pub fn config(&self) -> Result<&SiteConfig> {
        Ok(&self.components()?.config)
    }

    pub fn frontier(&self) -> Result<&Frontier> {
        Ok(&self.components()?.frontier)
    }

    pub fn todo(&self) -> Result<&Arc<SqliteQueue>> {
        Ok(self.frontier()?.todo())
    }

    pub fn working(&self) -> Result<&Arc<SqliteQueue>> {
        Ok(self.frontier()?.working())
    }

    pub fn failed(&self) -> Result<&Arc<SqliteQueue>> {
        Ok(self.frontier()?.failed())
    }

    pub fn docids(&self) -> Result<&Arc<SqliteDocidAllocator>> {
        Ok(&self.components()?.docids)
    }

    pub fn control_status(&self) -> Result<&ControlStatus> {
        Ok(&self.components()?.control_status)
    }

    /// Bound control address, if the server is available
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.components
            .get()
            .and_then(|c| c.control_status.local_addr())
    }

    /// Non-fatal problems recorded by `init()`
    pub fn warnings(&self) -> &[InitWarning] {
        self.components
            .get()
            .map(|c| c.warnings.as_slice())
            .unwrap_or(&[])
    }

    pub fn recovery(&self) -> Result<&RecoveryOutcome> {
        Ok(&self.components()?.recovery)
    }

    pub fn statistics(&self) -> Result<FrontierStatistics> {
        let components = self.components()?;
        Ok(load_statistics(&components.frontier, components.docids.as_ref())?)
    }

    /// Writes a backup now, returning the number of tasks saved
    pub fn backup_now(&self) -> Result<usize> {
        Ok(self.components()?.backuper.backup()?)
    }

    // ===== Initialization =====

    async fn initialize(&self) -> Result<Components> {
        self.transition(ManagerState::Initializing)?;

        let mut partial = Partial::default();
        match self.build(&mut partial).await {
            Ok(components) => {
                *self.daemons.lock().unwrap_or_else(PoisonError::into_inner) = std::mem::take(&mut partial.daemons);
                tracing::info!(
                    site = %components.config.site.site_id,
                    recovery = ?components.recovery,
                    warnings = components.warnings.len(),
                    "Site manager initialized"
                );
                Ok(components)
            }
            Err(e) => {
                tracing::error!(error = %e, "Site manager initialization failed");
                partial.release().await;
                self.transition(ManagerState::Stopped)?;
                self.shutdown_signal.send_replace(true);
                self.stopped.send_replace(true);
                Err(e)
            }
        }
    }

    async fn build(&self, partial: &mut Partial) -> Result<Components> {
        let config = self
            .source
            .load()
            .map_err(|e| SiteError::init(InitStage::Config, e))?;
        if let ConfigSource::File(path) = &self.source {
            if let Ok(hash) = compute_config_hash(path) {
                tracing::info!(config = %path.display(), config_hash = %hash, "Loaded configuration");
            }
        }

        let site_id = config.site.site_id.clone();
        let work_dir = config.site.work_dir.clone();
        let mut warnings = Vec::new();

        let control_status = bind_control(&config, partial, &mut warnings).await?;

        std::fs::create_dir_all(&work_dir).map_err(|e| SiteError::init(InitStage::DocidAllocator, e))?;
        let docids = Arc::new(
            SqliteDocidAllocator::open(&work_dir, &site_id)
                .map_err(|e| SiteError::init(InitStage::DocidAllocator, e))?,
        );
        partial.docids = Some(docids.clone());

        let frontier = Frontier::open(&work_dir).map_err(|e| SiteError::init(InitStage::Queues, e))?;
        partial.frontier = Some(frontier.clone());

        let reclaimer = Arc::new(QueueReclaimer::new(frontier.clone(), config.queue.lease()));
        let backuper = Arc::new(Backuper::new(frontier.clone(), docids.clone(), &site_id, &work_dir));

        let recovery = recover(&frontier, &backuper, docids.as_ref(), &config.site, &mut warnings)
            .map_err(|e| SiteError::init(InitStage::Recovery, e))?;

        partial.daemons.push(spawn_recurring(
            reclaimer,
            config.queue.job_timeout(),
            config.queue.cleaner_period(),
        ));
        partial.daemons.push(spawn_recurring(
            backuper.clone(),
            config.queue.backup_period(),
            config.queue.backup_period(),
        ));
        tracing::debug!(stage = %InitStage::Daemons, "Daemons scheduled");

        Ok(Components {
            control: partial.control.clone(),
            control_status,
            docids,
            frontier,
            backuper,
            recovery,
            warnings,
            config,
        })
    }

    fn components(&self) -> Result<&Components> {
        self.components.get().ok_or(SiteError::NotInitialized)
    }

    fn transition(&self, to: ManagerState) -> Result<ManagerState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(SiteError::InvalidTransition { from, to });
        }
        *state = to;
        tracing::debug!(%from, %to, "Manager state transition");
        Ok(from)
    }

    // ===== Control commands =====

    fn execute(&self, request: &CommandDocument) -> Result<Value> {
        let components = self.components()?;
        let frontier = &components.frontier;

        let result = match request.command.as_str() {
            "ping" => json!("pong"),
            "status" => json!({
                "site": components.config.site.site_id,
                "state": self.state().as_str(),
                "statistics": self.statistics()?,
                "warnings": components.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
            "claim" => {
                let lease = match request.args.get("lease-ms") {
                    Some(ms) => chrono::Duration::milliseconds(lease_ms(ms)?),
                    None => components.config.queue.lease(),
                };
                match frontier.claim(lease)? {
                    Some(claimed) => json!({
                        "docid": claimed.task.docid,
                        "url": claimed.task.url,
                        "depth": claimed.task.depth,
                        "attempt": claimed.attempt(),
                        "lease-deadline": claimed.lease_deadline.to_rfc3339(),
                    }),
                    None => Value::Null,
                }
            }
            "complete" => {
                let (docid, attempt) = claim_token(request)?;
                json!({ "completed": frontier.complete(docid, attempt)? })
            }
            "fail" => {
                let (docid, attempt) = claim_token(request)?;
                json!({ "failed": frontier.fail(docid, attempt)? })
            }
            "submit" => {
                let url = url::Url::parse(request.require_str("url")?)?;
                let depth = request.u64_arg("depth").unwrap_or(1);
                let depth = u16::try_from(depth)
                    .map_err(|_| ControlError::InvalidArgument(format!("depth {} is out of range", depth)))?;
                let task = frontier.submit(
                    components.docids.as_ref(),
                    &components.config.site.site_id,
                    url.as_str(),
                    depth,
                )?;
                json!({ "docid": task.docid })
            }
            "backup" => json!({ "tasks": components.backuper.backup()? }),
            "shutdown" => {
                self.request_shutdown();
                json!("shutting down")
            }
            other => return Err(ControlError::UnknownCommand(other.to_string()).into()),
        };

        Ok(result)
    }
}

/// Binds the control server and publishes its address
async fn bind_control(
    config: &SiteConfig,
    partial: &mut Partial,
    warnings: &mut Vec<InitWarning>,
) -> Result<ControlStatus> {
    let descriptor = match &config.control.descriptor_path {
        Some(path) => CommandDescriptor::load(path).map_err(|e| SiteError::init(InitStage::ControlServer, e))?,
        None => CommandDescriptor::builtin(),
    };

    let server = match ControlServer::bind(&config.control, descriptor).await {
        Ok(server) => server,
        Err(e) if config.control.required => return Err(SiteError::init(InitStage::ControlServer, e)),
        Err(e) => {
            tracing::warn!(error = %e, "Control server unavailable, continuing without it");
            let reason = e.to_string();
            warnings.push(InitWarning::ControlUnavailable {
                reason: reason.clone(),
            });
            return Ok(ControlStatus::Unavailable { reason });
        }
    };

    let addr = server.local_addr();
    partial.control = Some(Arc::new(server));

    let advertised = advertised_address(config.control.advertise_host.as_deref(), addr).await;
    if let Some(reason) = &advertised.fallback {
        tracing::warn!(addr = %advertised.addr, %reason, "Host resolution failed, advertising fallback");
        warnings.push(InitWarning::HostFallback {
            addr: advertised.addr.clone(),
            reason: reason.clone(),
        });
    }

    let publication = publish(config.discovery.registry_path.as_deref(), &advertised);
    if let Publication::Failed { addr, reason } = &publication {
        warnings.push(InitWarning::PublicationFailed {
            addr: addr.clone(),
            reason: reason.clone(),
        });
    }

    Ok(ControlStatus::Listening { addr, publication })
}

fn claim_token(request: &CommandDocument) -> std::result::Result<(u64, u32), ControlError> {
    let docid = request.require_u64("docid")?;
    let attempt = request.require_u64("attempt")?;
    let attempt = u32::try_from(attempt)
        .map_err(|_| ControlError::InvalidArgument(format!("attempt {} is out of range", attempt)))?;
    Ok((docid, attempt))
}

/// Checks a requested lease, returning it in milliseconds
fn lease_ms(value: &Value) -> std::result::Result<i64, ControlError> {
    value
        .as_u64()
        .filter(|ms| (1..=MAX_PERIOD_MS).contains(ms))
        .and_then(|ms| i64::try_from(ms).ok())
        .ok_or_else(|| {
            ControlError::InvalidArgument(format!(
                "lease-ms must be between 1 and {}, got {}",
                MAX_PERIOD_MS, value
            ))
        })
}

/// Control command handler bound to a manager
///
/// Holds a weak reference so the server does not keep the manager alive.
struct ManagerCommands {
    manager: Weak<SiteManager>,
}

impl CommandHandler for ManagerCommands {
    fn handle(&self, request: &CommandDocument) -> std::result::Result<Value, ControlError> {
        let manager = self.manager.upgrade().ok_or(ControlError::ShutDown)?;
        manager.execute(request).map_err(|e| match e {
            SiteError::Control(e) => e,
            other => ControlError::Handler(other.to_string()),
        })
    }
}
