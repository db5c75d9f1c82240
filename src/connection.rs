//! socksrotor-core/src/connection.rs
//! C4 (connection state) + C7 (orchestrator): drives one accepted client
//! socket from its greeting through upstream dispatch to the bidirectional
//! relay, per §4.4's state diagram. Where the spec's diagram is driven by
//! reactor readiness events, the tokio equivalent is a single async task per
//! connection that simply `.await`s each stage in turn — the runtime
//! already re-enters on partial reads, so there is no separate "dispatch on
//! readable, leave buffer unchanged on partial message" bookkeeping to
//! reimplement (see SPEC_FULL.md §4.7).
//!
//! Grounded on the teacher's `connection.rs` (per-connection async task,
//! stage progression, paired-socket relay) generalized from a single
//! Minecraft-specific upstream to the three upstream protocols this spec
//! requires.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use governor::DefaultDirectRateLimiter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::bypass;
use crate::codec::inbound::{self, InboundVersion};
use crate::codec::{http_upstream, rep, socks4_code, socks4_upstream, socks5_upstream};
use crate::error::EngineError;
use crate::registry::ProxyRegistry;
use crate::types::{ConnId, ProxyEntry, ProxyIdentity, ProxyProtocol, Settings, Target};

/// Default extra attempts after the first upstream selection fails (§7).
const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Mirrors §4.4's diagram; `ProxyConnected` and `Error` are the only two
/// terminal-adjacent states the reaper needs to distinguish (§4.5's
/// "moderately idle" rule applies only to `ProxyConnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Initial = 0,
    Socks5Connect = 1,
    Socks4Connect = 2,
    DispatchingUpstream = 3,
    ProxyConnected = 4,
}

impl From<u8> for Stage {
    fn from(v: u8) -> Self {
        match v {
            1 => Stage::Socks5Connect,
            2 => Stage::Socks4Connect,
            3 => Stage::DispatchingUpstream,
            4 => Stage::ProxyConnected,
            _ => Stage::Initial,
        }
    }
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the engine's epoch; used instead of
/// `SystemTime` so idle calculations are immune to wall-clock adjustment.
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Per-connection bookkeeping shared between the owning task and the
/// reaper. Replaces the source's socket→timestamp mirror map (§9) with one
/// entry keyed by connection id.
pub struct ConnEntry {
    stage: AtomicU8,
    last_activity_ms: AtomicU64,
    close: Notify,
}

impl ConnEntry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stage: AtomicU8::new(Stage::Initial as u8),
            last_activity_ms: AtomicU64::new(now_ms()),
            close: Notify::new(),
        })
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Relaxed);
        self.touch();
    }

    pub fn stage(&self) -> Stage {
        Stage::from(self.stage.load(Ordering::Relaxed))
    }

    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Requests that the owning connection task tear itself down. Mirrors
    /// the §9 design note: the reaper pushes an intent rather than mutating
    /// the connection's sockets directly.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once the reaper calls `request_close`. Awaited from both
    /// the handshake phase (`handle_connection`) and the relay phase
    /// (`relay`) as one branch of a `tokio::select!`, so a single notify
    /// permit reliably tears the connection down regardless of which phase
    /// it's in.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// Table of live connections, shared by the engine's accept loop and the
/// reaper (§3 "Registry tables" / `lastActivityTimestamp`).
pub type ConnTable = Arc<DashMap<ConnId, Arc<ConnEntry>>>;

/// Collaborators a connection task needs beyond its own client socket.
pub struct ConnContext {
    pub id: ConnId,
    pub registry: Arc<ProxyRegistry>,
    pub settings: Arc<RwLock<Settings>>,
    pub entry_state: Arc<ConnEntry>,
    pub rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

struct Established {
    stream: TcpStream,
    leading_bytes: Vec<u8>,
    /// `None` for the bypass/direct path, which is never registered.
    via: Option<ProxyEntry>,
}

enum DispatchFailure {
    /// No active upstream left to try (registry empty or all excluded).
    NoUpstreamAvailable,
    /// Upstream reported the target itself is unreachable / refused. Must
    /// be surfaced to the client verbatim, never retried.
    Surface(EngineError),
}

#[instrument(skip_all, fields(conn_id = ctx.id))]
pub async fn handle_connection(ctx: ConnContext, mut client: TcpStream) {
    let _ = client.set_nodelay(true);
    ctx.entry_state.touch();

    let outcome = tokio::select! {
        biased;
        _ = ctx.entry_state.closed() => {
            debug!("closed by reaper before handshake completed");
            return;
        }
        res = run(&ctx, &mut client) => res,
    };

    if let Err(e) = outcome {
        debug!(error = %e, "connection ended");
    }
}

async fn run(ctx: &ConnContext, client: &mut TcpStream) -> Result<(), EngineError> {
    let version = inbound::peek_version(client).await?;
    let target = match version {
        InboundVersion::V5 => {
            ctx.entry_state.set_stage(Stage::Socks5Connect);
            inbound::finish_socks5_greeting(client).await?;
            inbound::read_socks5_request(client).await?
        }
        InboundVersion::V4 => {
            ctx.entry_state.set_stage(Stage::Socks4Connect);
            inbound::read_socks4_request(client).await?
        }
    };
    ctx.entry_state.touch();

    ctx.entry_state.set_stage(Stage::DispatchingUpstream);
    let settings = ctx.settings.read().unwrap().clone();

    let established = dispatch(ctx, &settings, &target).await;

    let established = match established {
        Ok(e) => e,
        Err(DispatchFailure::NoUpstreamAvailable) => {
            reply_general_failure(client, version).await;
            return Err(EngineError::Resource("no active upstream available".into()));
        }
        Err(DispatchFailure::Surface(err)) => {
            reply_for_error(client, version, &err).await;
            return Err(err);
        }
    };

    reply_success(client, version).await?;
    ctx.entry_state.set_stage(Stage::ProxyConnected);
    if let Some(entry) = &established.via {
        info!(upstream = %entry.key(), target = %target.host, "tunnel established");
    } else {
        info!(target = %target.host, "tunnel established (direct)");
    }

    let result = relay(
        client,
        established.stream,
        established.leading_bytes,
        ctx.entry_state.clone(),
        ctx.rate_limiter.clone(),
        &established.via,
    )
    .await;

    if let Some(entry) = &established.via {
        ctx.registry.track_connection_closed(entry);
    }
    result
}

/// Implements §4.4's "(dispatch)" node plus the retry/fallback rules of §7.
async fn dispatch(ctx: &ConnContext, settings: &Settings, target: &Target) -> Result<Established, DispatchFailure> {
    let bypass_eligible = settings.bypass_collaborator_enabled
        && bypass::should_bypass(&target.host, &settings.bypass_domains);

    if bypass_eligible {
        match direct_connect(target).await {
            Ok(stream) => {
                return Ok(Established { stream, leading_bytes: Vec::new(), via: None });
            }
            Err(_) => {
                warn!(target = %target.host, "direct bypass connect failed, falling back to rotation once");
                // falls through to the registry path below
            }
        }
    }

    connect_via_registry(ctx, settings, target).await
}

async fn direct_connect(target: &Target) -> Result<TcpStream, EngineError> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(EngineError::DirectConnect)?;
    tune_high_throughput_socket(&stream);
    Ok(stream)
}

/// Applies the §6 "direct-path and HTTP-upstream sockets" hint: widened
/// SO_RCVBUF/SO_SNDBUF to match the larger buffer floor these paths use
/// (see buffer::HTTP_OR_DIRECT_CAPACITY). Best-effort: a platform that
/// refuses the resize still has a working, just smaller-buffered, socket.
fn tune_high_throughput_socket(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_recv_buffer_size(crate::buffer::HTTP_OR_DIRECT_CAPACITY);
    let _ = sock.set_send_buffer_size(crate::buffer::HTTP_OR_DIRECT_CAPACITY);
}

async fn connect_via_registry(ctx: &ConnContext, settings: &Settings, target: &Target) -> Result<Established, DispatchFailure> {
    let mut excluded: Vec<ProxyIdentity> = Vec::new();
    let mut attempts_left = 1 + DEFAULT_RETRY_BUDGET;

    loop {
        let Some(entry) = ctx.registry.select_excluding(settings.selection_mode, &excluded) else {
            return Err(DispatchFailure::NoUpstreamAvailable);
        };

        match connect_upstream(&entry, target).await {
            Ok((stream, leading_bytes)) => {
                ctx.registry.record_success(&entry);
                ctx.registry.track_connection_opened(&entry, settings.max_connections_per_proxy);
                return Ok(Established { stream, leading_bytes, via: Some(entry) });
            }
            Err(e) if e.penalizes_upstream() => {
                ctx.registry.increment_failure(&entry);
                excluded.push(entry.identity());
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(DispatchFailure::NoUpstreamAvailable);
                }
            }
            Err(e) => return Err(DispatchFailure::Surface(e)),
        }
    }
}

async fn connect_upstream(entry: &ProxyEntry, target: &Target) -> Result<(TcpStream, Vec<u8>), EngineError> {
    match entry.protocol {
        ProxyProtocol::Socks5 => socks5_upstream::connect(entry, target).await.map(|s| (s, Vec::new())),
        ProxyProtocol::Socks4 => socks4_upstream::connect(entry, target).await.map(|s| (s, Vec::new())),
        ProxyProtocol::Http => {
            let result = http_upstream::connect(entry, target).await?;
            Ok((result.stream, result.leading_bytes))
        }
        ProxyProtocol::Direct => unreachable!("Direct entries are synthesized, never stored in the registry"),
    }
}

async fn reply_success(client: &mut TcpStream, version: InboundVersion) -> Result<(), EngineError> {
    match version {
        InboundVersion::V5 => inbound::write_socks5_reply(client, rep::SUCCEEDED).await,
        InboundVersion::V4 => inbound::write_socks4_reply(client, socks4_code::GRANTED).await,
    }
    .map_err(EngineError::Transport)
}

async fn reply_general_failure(client: &mut TcpStream, version: InboundVersion) {
    let _ = match version {
        InboundVersion::V5 => inbound::write_socks5_reply(client, rep::GENERAL_FAILURE).await,
        InboundVersion::V4 => inbound::write_socks4_reply(client, socks4_code::REJECTED).await,
    };
}

/// Surfaces `UpstreamTarget`'s specific REP code on SOCKS5; SOCKS4 has no
/// equivalent granularity so it always gets the generic reject code.
async fn reply_for_error(client: &mut TcpStream, version: InboundVersion, err: &EngineError) {
    let _ = match (version, err) {
        (InboundVersion::V5, EngineError::UpstreamTarget(code)) => inbound::write_socks5_reply(client, *code).await,
        (InboundVersion::V5, _) => inbound::write_socks5_reply(client, rep::GENERAL_FAILURE).await,
        (InboundVersion::V4, _) => inbound::write_socks4_reply(client, socks4_code::REJECTED).await,
    };
}

/// Relays bytes bidirectionally until either side closes or errors, then
/// tears both down (§8 invariant 1). `leading_bytes` (non-empty only for
/// the HTTP upstream, whose response has no length prefix) is flushed to
/// the client before the generic loop starts.
async fn relay(
    client: &mut TcpStream,
    mut upstream: TcpStream,
    leading_bytes: Vec<u8>,
    tracker: Arc<ConnEntry>,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    via: &Option<ProxyEntry>,
) -> Result<(), EngineError> {
    if !leading_bytes.is_empty() {
        client.write_all(&leading_bytes).await.map_err(EngineError::Transport)?;
    }

    // C3: relay chunk size follows the buffer-pair minimums (§4.2) — wider
    // for the HTTP-upstream/direct paths, baseline for plain SOCKS upstreams.
    let chunk_size = match via {
        None => crate::buffer::HTTP_OR_DIRECT_CAPACITY,
        Some(entry) if entry.protocol == ProxyProtocol::Http => crate::buffer::HTTP_OR_DIRECT_CAPACITY,
        Some(_) => crate::buffer::BASELINE_CAPACITY,
    };

    let (mut client_rd, mut client_wr) = client.split();
    let (mut up_rd, mut up_wr) = upstream.split();

    let c2u = pump(&mut client_rd, &mut up_wr, tracker.clone(), rate_limiter.clone(), chunk_size);
    let u2c = pump(&mut up_rd, &mut client_wr, tracker.clone(), rate_limiter.clone(), chunk_size);

    tokio::select! {
        biased;
        _ = tracker.closed() => {
            info!("idle reaper closed connection");
            Ok(())
        }
        r = c2u => r,
        r = u2c => r,
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    tracker: Arc<ConnEntry>,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    chunk_size: usize,
) -> Result<(), EngineError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await.map_err(EngineError::Transport)?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        if let Some(limiter) = &rate_limiter {
            limiter.until_ready().await;
        }
        writer.write_all(&buf[..n]).await.map_err(EngineError::Transport)?;
        tracker.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_u8() {
        for s in [Stage::Initial, Stage::Socks5Connect, Stage::Socks4Connect, Stage::DispatchingUpstream, Stage::ProxyConnected] {
            assert_eq!(Stage::from(s as u8), s);
        }
    }

    #[test]
    fn conn_entry_tracks_idle_time() {
        let entry = ConnEntry::new();
        let t0 = now_ms();
        assert!(entry.idle_ms(t0) <= 1);
        entry.touch();
        assert_eq!(entry.idle_ms(now_ms()), 0);
    }

    #[test]
    fn request_close_does_not_panic_without_a_waiter() {
        let entry = ConnEntry::new();
        entry.request_close();
    }
}
