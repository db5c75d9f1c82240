//! socksrotor-core/src/logging.rs
//! Process-global `tracing` subscriber init, mirroring the teacher's
//! `logging.rs`: a `fmt` layer plus an `EnvFilter` wrapped in a `reload::Handle`
//! so the host can change verbosity at runtime without restarting the
//! process. Guarded by `Once` since a subscriber can only be installed once
//! per process, regardless of how many `ProxyEngine`s exist.
//!
//! Also carries `HostSinkLayer`, which forwards every `tracing` event to
//! whichever `ProxyEngine`s have registered their two host log callbacks
//! (§1/§6). A process has exactly one global subscriber, so the callbacks
//! can't be appended per-engine the way a fresh `Layer` stack normally
//! would be; instead `HostSinkLayer` is always part of the one subscriber
//! `init` installs, and engines register into (and unregister out of) its
//! shared sink table as they start and stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use dashmap::DashMap;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer};

use crate::types::{LogCallback, Settings};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

struct LogSink {
    on_log: LogCallback,
    on_log_error: LogCallback,
    settings: Arc<RwLock<Settings>>,
}

static RELOAD_HANDLE: OnceLock<FilterHandle> = OnceLock::new();
static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);
static LOG_SINKS: OnceLock<DashMap<u64, LogSink>> = OnceLock::new();

fn sinks() -> &'static DashMap<u64, LogSink> {
    LOG_SINKS.get_or_init(DashMap::new)
}

/// Registers a `(on_log, on_log_error)` pair; `on_log_error` receives
/// WARN/ERROR events, `on_log` receives everything else. `settings` is
/// consulted on every event so the owning engine's `logging_enabled` (§6)
/// silences both callbacks without re-registering. Returns a token to pass
/// to `unregister_log_callbacks` once the owning engine stops.
pub fn register_log_callbacks(
    on_log: LogCallback,
    on_log_error: LogCallback,
    settings: Arc<RwLock<Settings>>,
) -> u64 {
    let id = NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed);
    sinks().insert(id, LogSink { on_log, on_log_error, settings });
    id
}

pub fn unregister_log_callbacks(id: u64) {
    sinks().remove(&id);
}

/// Installs the global subscriber on first call; subsequent calls are a
/// no-op. `default_directive` is used only if `RUST_LOG` is unset.
pub fn init(default_directive: &str) {
    if RELOAD_HANDLE.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (filter, handle) = reload::Layer::new(filter);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(HostSinkLayer);
    // First caller in a process wins; a racing second init silently keeps
    // the handle from whichever completed `set` first.
    if subscriber.try_init().is_ok() {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Updates the active log filter, e.g. from a host settings change.
/// No-op if `init` was never called.
pub fn set_filter(directive: &str) {
    if let Some(handle) = RELOAD_HANDLE.get() {
        let _ = handle.reload(EnvFilter::new(directive));
    }
}

struct HostSinkLayer;

impl<S: Subscriber> Layer<S> for HostSinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let sinks = sinks();
        if sinks.is_empty() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = *event.metadata().level();
        for entry in sinks.iter() {
            let sink = entry.value();
            if !sink.settings.read().unwrap().logging_enabled {
                continue;
            }
            let cb = if level <= Level::WARN { &sink.on_log_error } else { &sink.on_log };
            cb(level, &visitor.message);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_filter_before_init_is_a_harmless_no_op() {
        set_filter("debug");
    }

    #[test]
    fn register_and_unregister_round_trips() {
        let on_log: LogCallback = std::sync::Arc::new(|_, _| {});
        let on_log_error: LogCallback = std::sync::Arc::new(|_, _| {});
        let settings = Arc::new(RwLock::new(Settings::default()));
        let id = register_log_callbacks(on_log, on_log_error, settings);
        assert!(sinks().contains_key(&id));
        unregister_log_callbacks(id);
        assert!(!sinks().contains_key(&id));
    }
}
