//! socksrotor-core/src/bypass.rs
//! C9: resolves whether a target should skip the proxy pool entirely and
//! connect direct, per the configurable domain-suffix list (§4.6). The
//! default list (`burpcollaborator.net`, `oastify.com`) exists so
//! interaction traffic bound for the host tool's own collaborator server
//! never loops back through a rotating upstream.

/// True if `host` equals, or is a subdomain of, any entry in `suffixes`.
/// Comparison is case-insensitive; entries may be given with or without a
/// leading dot.
pub fn should_bypass(host: &str, suffixes: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    suffixes.iter().any(|suffix| {
        let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
        host == suffix || host.ends_with(&format!(".{suffix}"))
    })
}
