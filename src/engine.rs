//! socksrotor-core/src/engine.rs
//! Top-level `ProxyEngine`: owns the listening socket, the single-threaded
//! runtime, and wires C2 (registry), C4/C7 (connection), C8 (reaper), and
//! C10 (stats) together. Grounded on the teacher's `ffi.rs`/`state.rs`
//! split between a long-lived service object and process-global state,
//! collapsed here into one struct since there is no FFI boundary requiring
//! global statics (SPEC_FULL.md §1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::connection::{handle_connection, ConnContext, ConnEntry, ConnTable};
use crate::logging;
use crate::reaper;
use crate::registry::ProxyRegistry;
use crate::types::{ConnId, LogCallback, ProxyEntry, ProxyFailedCallback, ProxyReactivatedCallback, Settings, Stats};

/// Upper bound on how long `stop()` waits for the reactor thread to notice
/// the shutdown signal and unwind before giving up (§5 "Cancellation").
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyEngine {
    runtime: Runtime,
    registry: Arc<ProxyRegistry>,
    settings: Arc<RwLock<Settings>>,
    conns: ConnTable,
    next_conn_id: AtomicU64,
    running: AtomicBool,
    listen_port: u16,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    reactor_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    log_sink_id: u64,
}

impl ProxyEngine {
    /// Builds the engine. `proxies` is the host-owned, read-locked proxy
    /// list (§1/§6); the two notification callbacks and two log callbacks
    /// are the host's external collaborators. `on_proxy_failed`/
    /// `on_proxy_reactivated` are invoked from the reactor thread as the
    /// registry decides state changes; `on_log`/`on_log_error` are wired
    /// into every `tracing` event this engine (and any other live engine)
    /// emits via `logging::HostSinkLayer` — `on_log_error` gets WARN/ERROR,
    /// `on_log` gets everything else.
    pub fn new(
        listen_port: u16,
        proxies: Arc<RwLock<Vec<ProxyEntry>>>,
        settings: Settings,
        on_proxy_failed: ProxyFailedCallback,
        on_proxy_reactivated: ProxyReactivatedCallback,
        on_log: LogCallback,
        on_log_error: LogCallback,
    ) -> std::io::Result<Self> {
        // §4.7/§5: one reactor thread owns every socket and every
        // `ConnectionState`; the current-thread runtime *is* that thread,
        // driven continuously from the dedicated thread `start()` spawns.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let registry = Arc::new(ProxyRegistry::new(proxies, on_proxy_failed, on_proxy_reactivated));
        let settings = Arc::new(RwLock::new(settings));
        let log_sink_id = logging::register_log_callbacks(on_log, on_log_error, settings.clone());

        Ok(Self {
            runtime,
            registry,
            settings,
            conns: Arc::new(DashMap::new()),
            next_conn_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            listen_port,
            rate_limiter: None,
            shutdown_tx: Mutex::new(None),
            reactor_thread: Mutex::new(None),
            log_sink_id,
        })
    }

    /// Installs a per-connection byte-rate limiter (ambient carry-over from
    /// the teacher's governor usage; off by default, not named by the
    /// distilled spec). `per_second` is the chunk-acquire rate, not a raw
    /// byte/s figure — see `connection::pump`'s per-chunk `until_ready`.
    pub fn with_rate_limit(mut self, per_second: std::num::NonZeroU32) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiter::direct(Quota::per_second(per_second))));
        self
    }

    /// Binds the listening socket and starts the reactor thread. Idempotent:
    /// a second call while already running is a no-op (§8 invariant 5).
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Bind synchronously on the caller's thread (§6: SO_REUSEADDR,
        // backlog 1000) so bind failures surface from `start()` itself,
        // before the reactor thread exists.
        let std_listener = match bind_std_listener(self.listen_port) {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!(error = %e, "bind failed");
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        *self.shutdown_tx.lock().unwrap() = Some(tx);

        let engine = self.clone();
        let handle = std::thread::Builder::new()
            .name("socksrotor-reactor".into())
            .spawn(move || engine.drive(std_listener, rx))
            .expect("failed to spawn reactor thread");
        *self.reactor_thread.lock().unwrap() = Some(handle);

        info!(port = self.listen_port, "engine started");
        Ok(())
    }

    /// Runs forever on the dedicated reactor thread: binds the async
    /// listener, spawns the accept loop / reaper / health-checker as
    /// cooperative tasks on `self.runtime`, and blocks until `stop()` fires
    /// the shutdown signal.
    fn drive(self: Arc<Self>, std_listener: std::net::TcpListener, shutdown_rx: oneshot::Receiver<()>) {
        self.runtime.block_on(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "failed to adopt listener into the runtime");
                    return;
                }
            };

            tokio::spawn(accept_loop(self.clone(), listener));
            tokio::spawn(reaper::run(self.conns.clone(), self.settings.clone()));
            tokio::spawn(self.registry.clone().health_check_loop());

            let _ = shutdown_rx.await;
        });
    }

    /// Signals the reactor thread to stop and closes every tracked
    /// connection. Idempotent (§8 invariant 5).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        for entry in self.conns.iter() {
            entry.request_close();
        }
        self.conns.clear();

        if let Some(handle) = self.reactor_thread.lock().unwrap().take() {
            // std::thread has no timed join; parking for the budget and
            // detaching on timeout approximates §5's "await up to 5s, then
            // hard-shutdown" without blocking the caller indefinitely.
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            let _ = done_rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT);
        }

        info!("engine stopped");
    }

    /// Replaces the live settings snapshot. New connections pick it up
    /// immediately; connections already past dispatch keep what they read
    /// (§6: "all fields are hot-reloadable"). Synchronous: the reactor
    /// thread permanently owns the runtime's only scheduler core via
    /// `drive`'s `block_on`, so a second `block_on` from this (the host's)
    /// thread would never return. A plain `std::sync::RwLock` write is held
    /// only long enough to swap the value and never blocks on the runtime.
    pub fn update_settings(&self, settings: Settings) {
        *self.settings.write().unwrap() = settings;
    }

    /// Renders `"Active connections: N | Using K proxies[, busiest: host:port(M)]"`.
    pub fn stats(&self) -> Stats {
        let counts = self.registry.connection_counts();
        let active_connections = self.conns.len() as u64;
        let proxies_in_use = counts.iter().filter(|(_, c)| *c > 0).count();
        let busiest = counts.into_iter().max_by_key(|(_, c)| *c);
        Stats { active_connections, proxies_in_use, busiest }
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        logging::unregister_log_callbacks(self.log_sink_id);
    }
}

fn bind_std_listener(port: u16) -> std::io::Result<std::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::LOCALHOST, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1000)?; // §6 accept backlog
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn accept_loop(engine: Arc<ProxyEngine>, listener: TcpListener) {
    loop {
        let (socket, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        // §6: per-accept TCP_NODELAY (above) and SO_KEEPALIVE.
        let _ = socket2::SockRef::from(&socket).set_keepalive(true);

        let id: ConnId = engine.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let entry_state = ConnEntry::new();
        engine.conns.insert(id, entry_state.clone());

        let ctx = ConnContext {
            id,
            registry: engine.registry.clone(),
            settings: engine.settings.clone(),
            entry_state,
            rate_limiter: engine.rate_limiter.clone(),
        };

        let conns = engine.conns.clone();
        tokio::spawn(async move {
            handle_connection(ctx, socket).await;
            conns.remove(&id);
        });
    }
}
