//! Network contact points
//!
//! A contact point tells a transport provider where it can attempt an
//! outbound connection. The string form is `<transport_id>:<host>:<port>`;
//! IPv6 hosts are written in brackets (`direct:[::1]:9000`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};

/// Port value used by [`NetworkContactPoint::any_port`]
const ANY_PORT: u16 = 0;

/// A `(transport_id, host, port)` tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkContactPoint {
    transport_id: String,
    host: String,
    port: u16,
}

impl NetworkContactPoint {
    /// Create a contact point; the port must be in 1..=65535
    pub fn new(
        transport_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> IdentityResult<Self> {
        if port == ANY_PORT {
            return Err(IdentityError::MalformedContactPoint(
                "port must be between 1 and 65535".into(),
            ));
        }
        Self::build(transport_id.into(), host.into(), port)
    }

    /// A contact point for binding a server endpoint on an ephemeral port
    ///
    /// Only valid for `create_channel_endpoint`; connecting to it fails.
    pub fn any_port(
        transport_id: impl Into<String>,
        host: impl Into<String>,
    ) -> IdentityResult<Self> {
        Self::build(transport_id.into(), host.into(), ANY_PORT)
    }

    fn build(transport_id: String, host: String, port: u16) -> IdentityResult<Self> {
        if transport_id.is_empty() || transport_id.contains(':') {
            return Err(IdentityError::MalformedContactPoint(format!(
                "invalid transport id {transport_id:?}"
            )));
        }
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        if host.is_empty() {
            return Err(IdentityError::MalformedContactPoint("empty host".into()));
        }
        Ok(Self {
            transport_id,
            host,
            port,
        })
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_any_port(&self) -> bool {
        self.port == ANY_PORT
    }

    /// `host:port` in a form accepted by socket address resolution
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same transport and host with a concrete port
    pub fn with_port(&self, port: u16) -> IdentityResult<Self> {
        Self::new(self.transport_id.clone(), self.host.clone(), port)
    }
}

impl fmt::Display for NetworkContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.socket_address())
    }
}

impl FromStr for NetworkContactPoint {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdentityError::MalformedContactPoint(s.to_string());
        let (transport_id, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(malformed)?;
        let port: u32 = port.parse().map_err(|_| malformed())?;
        let port = u16::try_from(port).map_err(|_| malformed())?;
        Self::new(transport_id, host, port).map_err(|_| malformed())
    }
}
