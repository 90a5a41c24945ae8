//! Page-server endpoint identity and hosts-string parsing.
//!
//! The page-server pool is configured as a comma-separated list of
//! `host:port` entries.  Parsing is per-token: a malformed entry is logged
//! at warning severity and skipped, and the remaining entries are still
//! processed.  The boot path decides what to do with the accumulated
//! outcome (see `TranServer::boot`).

use {
    crate::error::{Result, TranServerError},
    log::{debug, warn},
    std::fmt,
};

/// A page-server endpoint.  Identity is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PsNode {
    host: String,
    port: u16,
}

impl PsNode {
    /// Create an endpoint from a host name and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a single `host:port` token.
///
/// The host is everything before the first colon and must be non-empty; the
/// port is the leading decimal integer of the rest and must fall in
/// `[1, 65535]`.  Characters after the integer are ignored.
pub fn parse_host(token: &str) -> Result<PsNode> {
    let reject = || TranServerError::HostPortParameter(token.to_string());

    let colon = match token.find(':') {
        Some(pos) if pos >= 1 && pos + 1 < token.len() => pos,
        _ => return Err(reject()),
    };

    let port = leading_int(&token[colon + 1..]).ok_or_else(reject)?;
    if !(1..=i64::from(u16::MAX)).contains(&port) {
        return Err(reject());
    }

    Ok(PsNode::new(&token[..colon], port as u16))
}

/// The leading integer of `text`, skipping leading whitespace and taking an
/// optional sign.  `None` when no digit follows or the value overflows.
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, text.strip_prefix('+').unwrap_or(text)),
    };
    let digit_count = digits.chars().take_while(|c| c.is_ascii_digit()).count();
    if digit_count == 0 {
        return None;
    }
    let magnitude: i64 = digits[..digit_count].parse().ok()?;
    Some(sign * magnitude)
}

/// Parse a comma-separated hosts list.
///
/// Malformed tokens are logged and skipped without aborting the rest of the
/// list.  Returns the valid endpoints in configuration order together with
/// the last per-token error, if any, so the caller can distinguish "all
/// good", "partially good", and "nothing valid".
pub fn parse_host_list(hosts: &str) -> (Vec<PsNode>, Option<TranServerError>) {
    let mut nodes = Vec::new();
    let mut last_error = None;

    for token in hosts.split(',') {
        match parse_host(token) {
            Ok(node) => {
                debug!("page server host: {} port: {}", node.host(), node.port());
                nodes.push(node);
            }
            Err(err) => {
                warn!("rejecting malformed page server host entry {token:?}");
                last_error = Some(err);
            }
        }
    }

    (nodes, last_error)
}

// ── Tests ───────────────────────────────────────────────────────────────────
