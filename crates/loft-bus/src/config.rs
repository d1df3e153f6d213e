//! Connection configuration for the default message bus.
//!
//! Defaults are compiled in and every field can be overridden through
//! `LOFT_WS_*` environment variables, so deployments point the dashboard at
//! a different API host without rebuilding.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::BusError;

/// Where the default message bus connects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// API scheme, `http` or `https`. Mapped to `ws`/`wss` for the socket.
    pub scheme: String,
    /// API host.
    pub host: String,
    /// API port; scheme default when absent.
    pub port: Option<u16>,
    /// WebSocket endpoint path.
    pub path: String,
    /// Machine token appended as a `token` query parameter.
    pub token: Option<String>,
    /// Full base URL of a local dev proxy; overrides scheme/host/port.
    pub dev_proxy: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_owned(),
            host: "localhost".to_owned(),
            port: None,
            path: "/api/ws".to_owned(),
            token: None,
            dev_proxy: None,
        }
    }
}

impl BusConfig {
    /// Compiled defaults overridden by `LOFT_WS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(scheme) = std::env::var("LOFT_WS_SCHEME") {
            config.scheme = scheme;
        }
        if let Ok(host) = std::env::var("LOFT_WS_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("LOFT_WS_PORT") {
            config.port = port.parse().ok();
        }
        if let Ok(path) = std::env::var("LOFT_WS_PATH") {
            config.path = path;
        }
        if let Ok(token) = std::env::var("LOFT_WS_TOKEN") {
            config.token = Some(token);
        }
        if let Ok(proxy) = std::env::var("LOFT_WS_DEV_PROXY") {
            config.dev_proxy = Some(proxy);
        }
        config
    }

    /// WebSocket scheme for the configured API scheme.
    #[must_use]
    pub fn ws_scheme(&self) -> &'static str {
        if self.scheme == "http" { "ws" } else { "wss" }
    }

    /// Build the WebSocket URL for the default bus.
    ///
    /// A configured dev proxy wins over scheme/host/port; the endpoint path
    /// and token query parameter apply either way.
    pub fn url(&self) -> Result<Url, BusError> {
        let mut url = match &self.dev_proxy {
            Some(proxy) => {
                let mut url = Url::parse(proxy)?;
                let ws = match url.scheme() {
                    "http" => "ws",
                    "https" => "wss",
                    other => {
                        return Err(BusError::Config(format!(
                            "dev proxy scheme {other:?} is not http(s)"
                        )));
                    }
                };
                url.set_scheme(ws)
                    .map_err(|()| BusError::Config("dev proxy url cannot carry a ws scheme".into()))?;
                url
            }
            None => {
                let mut url = Url::parse(&format!("{}://{}", self.ws_scheme(), self.host))?;
                url.set_port(self.port)
                    .map_err(|()| BusError::Config(format!("host {:?} cannot carry a port", self.host)))?;
                url
            }
        };
        url.set_path(&self.path);
        if let Some(token) = &self.token {
            let _ = url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}
