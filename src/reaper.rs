//! socksrotor-core/src/reaper.rs
//! C8: the idle reaper. Sweeps the connection table every 30 s and asks
//! the owning task to close itself (§9 "thread affinity": the reaper pushes
//! an intent through a notification, it never touches a connection's
//! sockets directly).

use std::time::Duration;

use tracing::debug;

use crate::connection::{now_ms, ConnTable, Stage};
use crate::types::Settings;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Idle cutoff applied only to `PROXY_CONNECTED` connections (§4.5), to
/// force rotation onto a fresh upstream rather than reuse a warm pipe.
const MODERATELY_IDLE_SECS: u64 = 10;

pub async fn run(conns: ConnTable, settings: std::sync::Arc<std::sync::RwLock<Settings>>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        sweep(&conns, &settings).await;
    }
}

async fn sweep(conns: &ConnTable, settings: &std::sync::Arc<std::sync::RwLock<Settings>>) {
    let idle_timeout_ms = settings.read().unwrap().idle_timeout_secs * 1_000;
    let now = now_ms();
    let mut closed = 0u32;

    conns.retain(|id, entry| {
        let idle = entry.idle_ms(now);
        let should_close = idle > idle_timeout_ms
            || (entry.stage() == Stage::ProxyConnected && idle > MODERATELY_IDLE_SECS * 1_000);

        if should_close {
            entry.request_close();
            closed += 1;
            debug!(conn_id = id, idle_ms = idle, "reaper closing connection");
        }
        // The entry itself is removed once the owning task drops its clone
        // of the `Arc<ConnEntry>` and notifies completion (see engine.rs);
        // here we only ever signal, the table is pruned by the accept loop.
        true
    });

    if closed > 0 {
        debug!(closed, "reaper sweep complete");
    }
}
