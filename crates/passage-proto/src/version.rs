//! Protocol version negotiation.

/// Server version string sent in every `LoginResp`.
pub fn full() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Check whether a client version can talk to this server.
///
/// Clients are compatible when they share the server's major version.
pub fn check_compat(client_version: &str) -> Result<(), String> {
    let server_major = major(full());
    match major(client_version) {
        Some(m) if Some(m) == server_major => Ok(()),
        _ => Err(format!(
            "client version {} is not compatible with server version {}",
            client_version,
            full()
        )),
    }
}

fn major(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}
