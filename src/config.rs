//! Environment driven configuration and the service-wide globals.
//!
//! | Variable | Default | Used for |
//! |---|---|---|
//! | `HTTPPORT` | `8080` | public port `P`; readiness `P+1`, internal `P+2` |
//! | `CORS_ORIGINS` | `*` | comma separated allowed origins |
//! | `LOG_MINFILTER` | `Warning` | `debug`, `info`, `warning`, `error` |
//! | `APP_NAME` | service name | metrics label, log meta |
//! | `APP_GROUP` | empty | log meta |
//! | `SERVER_NAME` | `HOSTNAME`, then `localhost` | metrics label, log meta |
//! | `DEPLOY_ENVIRONMENT` | empty | metrics label, log meta |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::warn;

use crate::logging::Meta;

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_LOG_MIN_FILTER: &str = "Warning";

const READINESS_PORT_OFFSET: u16 = 1;
const INTERNAL_PORT_OFFSET: u16 = 2;

/// How long in-flight requests get to finish once shutdown starts.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_secs(10);

/// Transport-level limit for a client to send its request headers.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable identity of the running service.
///
/// Attached to every metrics label set and every request log line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceGlobals {
    pub app_name: String,
    pub group_name: String,
    pub server_name: String,
    pub deploy_environment: String,
    pub version_number: String,
}

impl ServiceGlobals {
    /// The globals as `entry.*` log metadata.
    pub fn meta(&self) -> Meta {
        let mut meta = Meta::new();
        meta.insert_entry("app", self.app_name.as_str());
        meta.insert_entry("group", self.group_name.as_str());
        meta.insert_entry("server", self.server_name.as_str());
        meta.insert_entry("env", self.deploy_environment.as_str());
        meta.insert_entry("version", self.version_number.as_str());
        meta
    }
}

/// Addresses of the three listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ports {
    pub public: SocketAddr,
    pub readiness: SocketAddr,
    pub internal: SocketAddr,
}

impl Ports {
    /// `port`, `port + 1` and `port + 2` on all interfaces.
    ///
    /// `None` for port `0` or when `port + 2` does not fit in a `u16`; the
    /// three listeners would not get three distinct ports.
    pub fn from_base(port: u16) -> Option<Self> {
        Self::from_base_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn from_base_on(ip: IpAddr, port: u16) -> Option<Self> {
        if port == 0 {
            return None;
        }
        Some(Self {
            public: SocketAddr::new(ip, port),
            readiness: SocketAddr::new(ip, port.checked_add(READINESS_PORT_OFFSET)?),
            internal: SocketAddr::new(ip, port.checked_add(INTERNAL_PORT_OFFSET)?),
        })
    }

    /// Port `0` for every listener, so each binds its own free port.
    pub fn ephemeral(ip: IpAddr) -> Self {
        let addr = SocketAddr::new(ip, 0);
        Self { public: addr, readiness: addr, internal: addr }
    }
}

impl Default for Ports {
    fn default() -> Self {
        let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            public: SocketAddr::new(ip, DEFAULT_HTTP_PORT),
            readiness: SocketAddr::new(ip, DEFAULT_HTTP_PORT + READINESS_PORT_OFFSET),
            internal: SocketAddr::new(ip, DEFAULT_HTTP_PORT + INTERNAL_PORT_OFFSET),
        }
    }
}

/// Everything the default service wiring reads from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub cors_origins: Vec<String>,
    pub log_min_filter: String,
    pub globals: ServiceGlobals,
}

impl ServiceConfig {
    /// Reads the process environment. `name` is the fallback application name.
    pub fn from_env(name: &str) -> Self {
        Self::from_lookup(name, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let http_port = match get("HTTPPORT") {
            None => DEFAULT_HTTP_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if Ports::from_base(port).is_some() => port,
                Ok(port) => {
                    warn!(port, default = DEFAULT_HTTP_PORT, "HTTPPORT leaves no room for the readiness and internal ports, using default");
                    DEFAULT_HTTP_PORT
                }
                Err(e) => {
                    warn!(value = %raw, error = %e, default = DEFAULT_HTTP_PORT, "invalid HTTPPORT, using default");
                    DEFAULT_HTTP_PORT
                }
            },
        };

        let cors_origins = get("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec!["*".to_owned()]);

        let globals = ServiceGlobals {
            app_name: get("APP_NAME").unwrap_or_else(|| name.to_owned()),
            group_name: get("APP_GROUP").unwrap_or_default(),
            server_name: get("SERVER_NAME")
                .or_else(|| get("HOSTNAME"))
                .unwrap_or_else(|| "localhost".to_owned()),
            deploy_environment: get("DEPLOY_ENVIRONMENT").unwrap_or_default(),
            version_number: String::new(),
        };

        Self {
            http_port,
            cors_origins,
            log_min_filter: get("LOG_MINFILTER").unwrap_or_else(|| DEFAULT_LOG_MIN_FILTER.to_owned()),
            globals,
        }
    }

    /// Listener addresses derived from `http_port`, or the defaults when
    /// `http_port` was set to a value that cannot hold three ports.
    pub fn ports(&self) -> Ports {
        Ports::from_base(self.http_port).unwrap_or_else(|| {
            warn!(port = self.http_port, "no room for three listener ports, using defaults");
            Ports::default()
        })
    }
}
