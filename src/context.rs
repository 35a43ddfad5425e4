//! Shared state of a running proxy
//!
//! The connection registry and the shutdown signal are process-wide: they
//! feed [`stats_snapshot`] and [`shutdown`], which the supervising binary
//! calls without a handle to the running futures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time;

use crate::config::Config;
use crate::relay::flow::{ConnRegistry, Snapshot};

/// How long [`shutdown`] waits for live relays to drain before abandoning them
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerState {
    registry: Arc<ConnRegistry>,
    shutdown_tx: Mutex<watch::Sender<bool>>,
    shutdown_rx: Mutex<watch::Receiver<bool>>,
    shutting_down: AtomicBool,
}

lazy_static! {
    static ref STATE: ServerState = {
        let (tx, rx) = watch::channel(false);
        ServerState {
            registry: Arc::new(ConnRegistry::new()),
            shutdown_tx: Mutex::new(tx),
            shutdown_rx: Mutex::new(rx),
            shutting_down: AtomicBool::new(false),
        }
    };
}

/// The process-wide connection registry
pub fn registry() -> Arc<ConnRegistry> {
    STATE.registry.clone()
}

/// Point-in-time statistics for monitoring consumers
pub fn stats_snapshot() -> Snapshot {
    STATE.registry.snapshot()
}

pub(crate) fn subscribe_shutdown() -> watch::Receiver<bool> {
    STATE.shutdown_rx.lock().unwrap().clone()
}

/// Resolves once [`shutdown`] has been signalled
pub(crate) async fn wait_shutdown() {
    let mut rx = subscribe_shutdown();
    loop {
        match rx.recv().await {
            Some(true) | None => break,
            Some(false) => continue,
        }
    }
}

/// Stops all listeners and relays.
///
/// Closes every listening socket, signals every connection task to drop its
/// sockets, then waits up to [`DRAIN_TIMEOUT`] for live relays to finish.
/// Shutdown is terminal: the second and every later call is a no-op. A
/// process that wants to host another run afterwards must call [`rearm`]
/// explicitly.
pub async fn shutdown() {
    if STATE.shutting_down.swap(true, Ordering::SeqCst) {
        return;
    }

    info!("shutting down, draining {} connections", STATE.registry.active_connections());

    {
        let tx = STATE.shutdown_tx.lock().unwrap();
        let _ = tx.broadcast(true);
    }

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while STATE.registry.active_connections() > 0 && Instant::now() < deadline {
        time::delay_for(Duration::from_millis(50)).await;
    }

    let abandoned = STATE.registry.active_connections();
    if abandoned > 0 {
        warn!("drain timed out, abandoning {} connections", abandoned);
    }
}

/// Re-arms the shutdown signal after a completed [`shutdown`], so the same
/// process can host a fresh run (the test harness does; the binaries exit
/// instead).
pub fn rearm() {
    let (tx, rx) = watch::channel(false);
    *STATE.shutdown_tx.lock().unwrap() = tx;
    *STATE.shutdown_rx.lock().unwrap() = rx;
    STATE.shutting_down.store(false, Ordering::SeqCst);
}

/// Per-run immutable context handed to every listener and connection task
pub struct Context {
    config: Config,
}

/// Shared handle to the context
pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(config: Config) -> SharedContext {
        Arc::new(Context { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnRegistry> {
        registry()
    }
}
