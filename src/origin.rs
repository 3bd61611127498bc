use std::{fmt, str::FromStr};

use thiserror::Error;

/// The URI used to identify a pool is invalid.
///
/// Usually, this means that the URI is missing a scheme or host,
/// but it can also mean that the connection string could not be parsed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OriginError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The URI is missing a scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(http::Uri),

    /// The URI carries a scheme other than `http` or `https`.
    #[error("unsupported scheme in uri: {0}")]
    UnsupportedScheme(http::Uri),

    /// The URI is missing a host.
    #[error("missing host in uri: {0}")]
    MissingHost(http::Uri),
}

/// URI scheme served by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain-text HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// Identity of what a pool serves: a `(scheme, host, port)` triple.
///
/// Origins are immutable; two pools with the same origin serve the same
/// upstream and may be registered as replicas of each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    /// Create an origin from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// The origin's scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The origin's host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin's port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&http::Uri> for Origin {
    type Error = OriginError;

    fn try_from(uri: &http::Uri) -> Result<Self, Self::Error> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(_) => return Err(OriginError::UnsupportedScheme(uri.clone())),
            None => return Err(OriginError::MissingScheme(uri.clone())),
        };

        let host = uri
            .host()
            .ok_or_else(|| OriginError::MissingHost(uri.clone()))?;

        Ok(Self {
            scheme,
            host: host.to_owned(),
            port: uri.port_u16().unwrap_or_else(|| scheme.default_port()),
        })
    }
}

impl FromStr for Origin {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s)?;
        (&uri).try_into()
    }
}
