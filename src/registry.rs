//! socksrotor-core/src/registry.rs
//! C1 (ProxyEntry) + C2 (ProxyRegistry): the shared, read-mostly upstream
//! pool, its rotation cursor, and the health-check scheduler.
//!
//! Grounded on the teacher's `state.rs` (global counters, `DashMap`-backed
//! concurrent tables) and on the `ed46f5ff_Stranmor-Antigravity-Server`
//! `ProxyPool` (round-robin/random rotation over a shared list), adapted to
//! the spec's identity-wins tie-break (§9) and 3-strikes failure policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::types::{ProxyEntry, ProxyFailedCallback, ProxyIdentity, ProxyProtocol, ProxyReactivatedCallback, SelectionMode};

/// Consecutive failures before an entry is marked inactive (§4.1).
const FAILURE_THRESHOLD: u8 = 3;
/// Health-check cadence (§4.1).
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How long a single health-check probe is allowed to take.
const HEALTH_CHECK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RotationCursor {
    index: usize,
    last_identity: Option<ProxyIdentity>,
}

/// The shared upstream pool. The entry list itself lives behind a
/// `RwLock` "owned by the host" per §1 — the registry both reads it
/// (`select`) and writes it (`increment_failure`, `health_check`).
pub struct ProxyRegistry {
    entries: Arc<RwLock<Vec<ProxyEntry>>>,
    cursor: Mutex<RotationCursor>,
    failure_counts: DashMap<String, u8>,
    connections_per_proxy: DashMap<String, AtomicU64>,
    on_failed: ProxyFailedCallback,
    on_reactivated: ProxyReactivatedCallback,
}

impl ProxyRegistry {
    pub fn new(
        entries: Arc<RwLock<Vec<ProxyEntry>>>,
        on_failed: ProxyFailedCallback,
        on_reactivated: ProxyReactivatedCallback,
    ) -> Self {
        Self {
            entries,
            cursor: Mutex::new(RotationCursor::default()),
            failure_counts: DashMap::new(),
            connections_per_proxy: DashMap::new(),
            on_failed,
            on_reactivated,
        }
    }

    /// Selects the next upstream per the configured rotation policy. Never
    /// returns the same entry twice in a row in round-robin mode when the
    /// active set has at least 2 members.
    pub fn select(&self, mode: SelectionMode) -> Option<ProxyEntry> {
        self.select_excluding(mode, &[])
    }

    /// As `select`, but skips any entry whose identity is in `excluded` —
    /// used by the orchestrator's retry loop (§7) to avoid re-selecting an
    /// upstream that just failed within the same dispatch.
    pub fn select_excluding(&self, mode: SelectionMode, excluded: &[ProxyIdentity]) -> Option<ProxyEntry> {
        let snapshot: Vec<ProxyEntry> = {
            let guard = self.entries.read().unwrap();
            guard
                .iter()
                .filter(|e| e.active && !excluded.contains(&e.identity()))
                .cloned()
                .collect()
        };
        if snapshot.is_empty() {
            return None;
        }

        match mode {
            SelectionMode::Random => {
                let idx = rand::thread_rng().gen_range(0..snapshot.len());
                let chosen = snapshot[idx].clone();
                let mut cursor = self.cursor.lock().unwrap();
                cursor.last_identity = Some(chosen.identity());
                Some(chosen)
            }
            SelectionMode::RoundRobin => {
                let mut cursor = self.cursor.lock().unwrap();
                let start = cursor
                    .last_identity
                    .as_ref()
                    .and_then(|id| snapshot.iter().position(|e| &e.identity() == id))
                    .map(|pos| (pos + 1) % snapshot.len())
                    .unwrap_or(0);
                let chosen = snapshot[start].clone();
                cursor.index = start;
                cursor.last_identity = Some(chosen.identity());
                Some(chosen)
            }
        }
    }

    /// Records a connection/handshake failure against `entry`. On the third
    /// consecutive failure, deactivates it and notifies the host.
    pub fn increment_failure(&self, entry: &ProxyEntry) {
        let key = entry.key();
        let mut count = self.failure_counts.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count >= FAILURE_THRESHOLD {
            let reason = "Marked inactive after 3 consecutive failures".to_string();
            {
                let mut guard = self.entries.write().unwrap();
                if let Some(e) = guard.iter_mut().find(|e| e.key() == key) {
                    e.active = false;
                    e.last_error = Some(reason.clone());
                }
            }
            self.connections_per_proxy.remove(&key);
            drop(count);
            self.failure_counts.remove(&key);
            warn!(proxy = %key, "proxy marked inactive after repeated failures");
            (self.on_failed)(&entry.host, entry.port, &reason);
        }
    }

    /// Clears an entry's failure streak after a successful connect/handshake.
    pub fn record_success(&self, entry: &ProxyEntry) {
        self.failure_counts.remove(&entry.key());
    }

    /// Records a newly-opened connection against `entry`. `max_per_proxy` is
    /// the configured soft cap (§6 "max connections per proxy"); it is a
    /// reporting signal only — crossing it never blocks a connection, it
    /// just logs so the host can surface an overload warning.
    pub fn track_connection_opened(&self, entry: &ProxyEntry, max_per_proxy: u32) {
        let count = self
            .connections_per_proxy
            .entry(entry.key())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if max_per_proxy > 0 && count > max_per_proxy as u64 {
            warn!(proxy = %entry.key(), count, max = max_per_proxy, "proxy exceeded configured soft connection cap");
        }
    }

    pub fn track_connection_closed(&self, entry: &ProxyEntry) {
        if let Some(counter) = self.connections_per_proxy.get(&entry.key()) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of `"host:port" -> active connection count`, used for stats.
    pub fn connection_counts(&self) -> Vec<(String, u64)> {
        self.connections_per_proxy
            .iter()
            .map(|r| (r.key().clone(), r.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn entries_snapshot(&self) -> Vec<ProxyEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Runs the periodic health check forever; intended to be spawned as its
    /// own task on the engine's runtime.
    pub async fn health_check_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            self.health_check_once().await;
        }
    }

    pub async fn health_check_once(&self) {
        let snapshot = self.entries_snapshot();
        for entry in snapshot {
            if entry.protocol == ProxyProtocol::Direct {
                continue;
            }
            match probe(&entry).await {
                Ok(()) => {
                    self.failure_counts.remove(&entry.key());
                    let was_inactive = !entry.active;
                    if was_inactive {
                        let mut guard = self.entries.write().unwrap();
                        if let Some(e) = guard.iter_mut().find(|e| e.key() == entry.key()) {
                            e.active = true;
                            e.last_error = None;
                        }
                        drop(guard);
                        info!(proxy = %entry.key(), "proxy reactivated after successful health check");
                        (self.on_reactivated)(&entry.host, entry.port);
                    }
                }
                Err(e) => {
                    warn!(proxy = %entry.key(), error = %e, "health check failed");
                    self.increment_failure(&entry);
                }
            }
        }
    }
}

/// Opens a socket to `entry` and performs a minimal SOCKS5 no-auth greeting
/// (`05 01 00` → expect `05 00`).
async fn probe(entry: &ProxyEntry) -> std::io::Result<()> {
    let addr: SocketAddr = resolve_first(&entry.host, entry.port).await?;
    timeout(HEALTH_CHECK_PROBE_TIMEOUT, async move {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [0x05, 0x00] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected SOCKS5 greeting reply",
            ));
        }
        Ok(())
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "health check timed out"))?
}

async fn resolve_first(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, port: u16) -> ProxyEntry {
        ProxyEntry::new(ProxyProtocol::Socks5, host, port)
    }

    fn no_op_failed() -> ProxyFailedCallback {
        Arc::new(|_, _, _| {})
    }
    fn no_op_reactivated() -> ProxyReactivatedCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn round_robin_never_repeats_consecutively() {
        let entries = Arc::new(RwLock::new(vec![
            entry("a", 1),
            entry("b", 2),
            entry("c", 3),
        ]));
        let reg = ProxyRegistry::new(entries, no_op_failed(), no_op_reactivated());

        let mut last = None;
        for _ in 0..50 {
            let chosen = reg.select(SelectionMode::RoundRobin).unwrap();
            if let Some(prev) = &last {
                assert_ne!(prev, &chosen.key());
            }
            last = Some(chosen.key());
        }
    }

    #[test]
    fn round_robin_wraps_in_order() {
        let entries = Arc::new(RwLock::new(vec![entry("a", 1), entry("b", 2), entry("c", 3)]));
        let reg = ProxyRegistry::new(entries, no_op_failed(), no_op_reactivated());

        let seq: Vec<String> = (0..6)
            .map(|_| reg.select(SelectionMode::RoundRobin).unwrap().key())
            .collect();
        assert_eq!(
            seq,
            vec!["a:1", "b:2", "c:3", "a:1", "b:2", "c:3"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn select_returns_none_on_empty_active_set() {
        let entries = Arc::new(RwLock::new(Vec::<ProxyEntry>::new()));
        let reg = ProxyRegistry::new(entries, no_op_failed(), no_op_reactivated());
        assert!(reg.select(SelectionMode::RoundRobin).is_none());
        assert!(reg.select(SelectionMode::Random).is_none());
    }

    #[test]
    fn three_failures_deactivates_entry() {
        let entries = Arc::new(RwLock::new(vec![entry("a", 1)]));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        let on_failed: ProxyFailedCallback = Arc::new(move |_, _, _| {
            fired2.store(true, Ordering::SeqCst);
        });
        let reg = ProxyRegistry::new(entries.clone(), on_failed, no_op_reactivated());

        let e = entry("a", 1);
        reg.increment_failure(&e);
        reg.increment_failure(&e);
        assert!(entries.read().unwrap()[0].active);
        reg.increment_failure(&e);

        assert!(!entries.read().unwrap()[0].active);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn success_clears_failure_streak() {
        let entries = Arc::new(RwLock::new(vec![entry("a", 1)]));
        let reg = ProxyRegistry::new(entries.clone(), no_op_failed(), no_op_reactivated());
        let e = entry("a", 1);
        reg.increment_failure(&e);
        reg.increment_failure(&e);
        reg.record_success(&e);
        reg.increment_failure(&e);
        assert!(entries.read().unwrap()[0].active);
    }

    #[test]
    fn identity_wins_over_stale_cursor_index_on_list_change() {
        let entries = Arc::new(RwLock::new(vec![entry("a", 1), entry("b", 2)]));
        let reg = ProxyRegistry::new(entries.clone(), no_op_failed(), no_op_reactivated());
        let first = reg.select(SelectionMode::RoundRobin).unwrap();
        // list changes under us: first entry removed
        let removed_index = entries
            .read()
            .unwrap()
            .iter()
            .position(|e| e.key() == first.key())
            .unwrap();
        entries.write().unwrap().remove(removed_index);
        // last_identity is gone from the snapshot now; must restart at 0
        let next = reg.select(SelectionMode::RoundRobin).unwrap();
        assert_eq!(next.key(), entries.read().unwrap()[0].key());
    }
}
