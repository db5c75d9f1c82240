//! socksrotor-core/src/error.rs
//! Error kinds from §7, each carrying enough context to drive the policy
//! table without string-matching downstream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed SOCKS from the client. Reply with the appropriate code, then close.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// TCP connect to the chosen upstream proxy failed.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[source] std::io::Error),

    /// The upstream proxy rejected us, or authentication failed.
    #[error("upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    /// The upstream proxy reported the target itself is unreachable
    /// (SOCKS5 REP 04/05/06, or a SOCKS4 request-rejected CD). Not penalized
    /// against the upstream.
    #[error("upstream reports target unreachable (code {0:#04x})")]
    UpstreamTarget(u8),

    /// HTTP CONNECT upstream demanded authentication we didn't (or
    /// incorrectly) supplied. A credentials mismatch is a configuration
    /// problem, not upstream liveness, so this is not penalized either.
    #[error("upstream requires proxy authentication")]
    UpstreamAuthRequired,

    /// Direct TCP to the target failed (bypass path).
    #[error("direct connect failed: {0}")]
    DirectConnect(#[source] std::io::Error),

    /// I/O error once the tunnel is established.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Buffer overflow or selector-layer fault.
    #[error("resource error: {0}")]
    Resource(String),
}

impl EngineError {
    /// Whether this error should count against the upstream's failure streak.
    pub fn penalizes_upstream(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamConnect(_) | EngineError::UpstreamHandshake(_)
        )
    }
}
