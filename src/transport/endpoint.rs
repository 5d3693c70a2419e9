//! Connection URLs.
//!
//! Clients connect to `tcp://host:port[/path]`. The bare `host:port` form is also
//! accepted; IPv6 hosts use brackets (`tcp://[::1]:9000`).

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{ProtocolError, Result};

const SCHEME: &str = "tcp://";

/// Parsed connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ProtocolError::InvalidUrl("empty URL".into()));
        }

        let rest = match url.split_once("://") {
            Some(_) if url.starts_with(SCHEME) => &url[SCHEME.len()..],
            Some((scheme, _)) => {
                return Err(ProtocolError::InvalidUrl(format!(
                    "unsupported scheme '{scheme}' in {url}"
                )))
            }
            None => url,
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| ProtocolError::InvalidUrl(format!("unterminated IPv6 host in {url}")))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| ProtocolError::InvalidUrl(format!("missing port in {url}")))?;
            (host, port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| ProtocolError::InvalidUrl(format!("missing port in {url}")))?
        };

        if host.is_empty() {
            return Err(ProtocolError::InvalidUrl(format!("missing host in {url}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::InvalidUrl(format!("invalid port '{port}' in {url}")))?;
        if port == 0 {
            return Err(ProtocolError::InvalidUrl(format!("port 0 in {url}")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve to socket addresses (blocking DNS lookup)
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ProtocolError::ConnectFailure(format!("cannot resolve {}: {e}", self.host)))?
            .collect();
        if addrs.is_empty() {
            return Err(ProtocolError::ConnectFailure(format!(
                "no addresses for {}",
                self.host
            )));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}{}", self.authority(), self.path)
    }
}
