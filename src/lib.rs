//! socksrotor-core
//! Connection engine for a rotating-upstream local SOCKS4/4A/5 proxy: see
//! `ProxyEngine` for the public entry point. Designed to be embedded as the
//! traffic-routing core of an interactive HTTP-inspection tool — the host
//! tool's UI, persistence, and extension ABI are not part of this crate.

pub mod bypass;
pub mod buffer;
pub mod codec;
pub mod connection;
pub mod engine;
pub mod error;
pub mod logging;
pub mod reaper;
pub mod registry;
pub mod types;

pub use engine::ProxyEngine;
pub use error::EngineError;
pub use registry::ProxyRegistry;
pub use types::{
    LogCallback, ProxyEntry, ProxyFailedCallback, ProxyIdentity, ProxyProtocol, ProxyReactivatedCallback,
    SelectionMode, Settings, Stats,
};
