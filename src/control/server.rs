//! TCP control server
//!
//! Binding happens during manager initialization so that the address can be
//! published before the queues open. Serving starts later, once a handler is
//! attached with [`ControlServer::start`].

use crate::config::ControlConfig;
use crate::control::command::{CommandDescriptor, CommandDocument, CommandHandler, CommandResponse};
use crate::control::ControlError;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Longest request line accepted, newline included
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Limits applied to each connection
struct Limits {
    connections: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    command_timeout: Duration,
}

/// Administrative TCP endpoint of a site manager
pub struct ControlServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    descriptor: Arc<CommandDescriptor>,
    limits: Arc<Limits>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl ControlServer {
    /// Binds `0.0.0.0:<listen-port>`
    ///
    /// # Arguments
    ///
    /// * `config` - Control section of the site configuration
    /// * `descriptor` - Commands the server will accept
    ///
    /// # Returns
    ///
    /// * `Ok(ControlServer)` - Bound, not yet serving
    /// * `Err(ControlError::Bind)` - The port could not be bound
    pub async fn bind(config: &ControlConfig, descriptor: CommandDescriptor) -> Result<Self, ControlError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(%local_addr, commands = descriptor.commands.len(), "Control server bound");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            descriptor: Arc::new(descriptor),
            limits: Arc::new(Limits {
                connections: Arc::new(Semaphore::new(config.max_connections as usize)),
                workers: Arc::new(Semaphore::new(config.worker_threads as usize)),
                command_timeout: config.command_timeout(),
            }),
            shutdown_tx,
            accept_task: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections, dispatching commands to `handler`
    pub fn start(&self, handler: Arc<dyn CommandHandler>) -> Result<(), ControlError> {
        if self.is_shutdown() {
            return Err(ControlError::ShutDown);
        }

        let listener = self
            .listener
            .lock()
            .map_err(|_| ControlError::Handler("control server lock poisoned".to_string()))?
            .take()
            .ok_or(ControlError::AlreadyStarted)?;

        let task = tokio::spawn(accept_loop(
            listener,
            self.descriptor.clone(),
            self.limits.clone(),
            handler,
            self.shutdown_tx.subscribe(),
        ));

        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(task);
        }
        tracing::info!(addr = %self.local_addr, "Control server serving");
        Ok(())
    }

    /// Returns true once shutdown has begun; never blocks
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting, waits for open connections to end, and releases the port
    ///
    /// Returns false if the server was already shut down.
    pub async fn shutdown(&self) -> bool {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.shutdown_tx.send_replace(true);

        // Never started: dropping the listener releases the port
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }

        let task = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Control accept loop ended abnormally");
            }
        }

        tracing::info!(addr = %self.local_addr, "Control server stopped");
        true
    }
}

async fn accept_loop(
    listener: TcpListener,
    descriptor: Arc<CommandDescriptor>,
    limits: Arc<Limits>,
    handler: Arc<dyn CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let Ok(permit) = limits.connections.clone().try_acquire_owned() else {
                        tracing::warn!(%peer, "Connection limit reached, rejecting");
                        connections.spawn(reject_busy(stream));
                        continue;
                    };

                    tracing::debug!(%peer, "Control connection opened");
                    let descriptor = descriptor.clone();
                    let limits = limits.clone();
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, descriptor, limits, handler, shutdown).await {
                            tracing::warn!(%peer, error = %e, "Control connection failed");
                        }
                        drop(permit);
                        tracing::debug!(%peer, "Control connection closed");
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn reject_busy(mut stream: TcpStream) {
    let line = response_line(&CommandResponse::failure("too many control connections"));
    let _ = stream.write_all(line.as_bytes()).await;
}

async fn handle_connection(
    stream: TcpStream,
    descriptor: Arc<CommandDescriptor>,
    limits: Arc<Limits>,
    handler: Arc<dyn CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControlError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    // Inside an overlong line whose rest is being discarded
    let mut oversized = false;

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES);
        let read = tokio::select! {
            read = limited.read_line(&mut line) => read?,
            _ = shutdown.changed() => break,
        };
        if read == 0 {
            break;
        }

        if !line.ends_with('\n') && read as u64 == MAX_LINE_BYTES {
            if !oversized {
                tracing::warn!(limit = MAX_LINE_BYTES, "Control request line too long");
                let response = CommandResponse::failure(format!(
                    "request line exceeds {} bytes",
                    MAX_LINE_BYTES
                ));
                writer.write_all(response_line(&response).as_bytes()).await?;
            }
            oversized = true;
            continue;
        }
        if oversized {
            oversized = false;
            continue;
        }

        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandDocument>(raw) {
            Ok(request) => dispatch(request, &descriptor, &limits, &handler).await,
            Err(e) => CommandResponse::failure(ControlError::Malformed(e)),
        };

        writer.write_all(response_line(&response).as_bytes()).await?;
    }

    Ok(())
}

/// Validates and runs one command under the worker limit and the deadline
async fn dispatch(
    request: CommandDocument,
    descriptor: &CommandDescriptor,
    limits: &Limits,
    handler: &Arc<dyn CommandHandler>,
) -> CommandResponse {
    if let Err(e) = descriptor.validate(&request) {
        tracing::debug!(command = %request.command, error = %e, "Rejected control command");
        return CommandResponse::failure(e);
    }

    let command = request.command.clone();
    let run = execute(request, limits.workers.clone(), handler.clone());

    match tokio::time::timeout(limits.command_timeout, run).await {
        Ok(Ok(result)) => {
            tracing::debug!(%command, "Control command succeeded");
            CommandResponse::success(result)
        }
        Ok(Err(e)) => {
            tracing::warn!(%command, error = %e, "Control command failed");
            CommandResponse::failure(e)
        }
        Err(_) => {
            let e = ControlError::Timeout {
                command,
                timeout: limits.command_timeout,
            };
            tracing::warn!(error = %e, "Control command timed out");
            CommandResponse::failure(e)
        }
    }
}

/// Runs the handler on the blocking pool
///
/// The worker permit moves into the blocking task, so a command abandoned by
/// its deadline keeps its slot until the handler really returns.
async fn execute(
    request: CommandDocument,
    workers: Arc<Semaphore>,
    handler: Arc<dyn CommandHandler>,
) -> Result<serde_json::Value, ControlError> {
    let worker = workers.acquire_owned().await.map_err(|_| ControlError::ShutDown)?;
    tokio::task::spawn_blocking(move || {
        let result = handler.handle(&request);
        drop(worker);
        result
    })
    .await
    .map_err(|e| ControlError::Handler(e.to_string()))?
}

fn response_line(response: &CommandResponse) -> String {
    // A response is plain data; serializing it cannot fail
    let mut line = serde_json::to_string(response)
        .unwrap_or_else(|_| r#"{"ok":false,"error":"unserializable response"}"#.to_string());
    line.push('\n');
    line
}
