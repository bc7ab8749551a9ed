//! Backend address list parsing.
//!
//! The backend list is a comma-separated set of `host[:port]` entries,
//! supplied via `--backend` or `$REALSERVERS`. Entries without a port get
//! the standard NNTP port 119. Bare IPv6 addresses are bracketed.

use anyhow::{Result, bail};

/// Default NNTP port appended to backend addresses without one.
pub const DEFAULT_PORT: &str = "119";

/// Parse the comma-separated backend list into dialable addresses.
pub fn parse_backend_list(spec: &str) -> Result<Vec<String>> {
    let mut backends = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            bail!("empty backend entry in {:?}", spec);
        }
        backends.push(add_port(entry, DEFAULT_PORT));
    }
    if backends.is_empty() {
        bail!("no backends configured");
    }
    Ok(backends)
}

/// Append `port` to `addr` unless it already carries one.
///
/// A single colon means `host:port`; more than one means a bare IPv6
/// address, which gets bracketed. An address already starting with `[` is
/// taken as `[v6]:port` and left alone.
pub fn add_port(addr: &str, port: &str) -> String {
    let colons = addr.matches(':').count();
    if addr.starts_with('[') || colons == 1 {
        return addr.to_string();
    }
    if colons > 1 {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}
