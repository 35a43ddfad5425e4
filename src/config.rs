//! Configuration loading and validation
//!
//! The on-disk format is JSON (parsed with json5, so comments and trailing
//! commas are accepted):
//!
//! ```ignore
//! {
//!     "server_host": "example.org",
//!     "server_port": 8388,
//!     "local_host": "127.0.0.1",
//!     "local_port": 1080,
//!     "http_port": 8118,
//!     "password": "the-shared-password",
//!     "method": "aes-256-cfb",
//!     "timeout_sec": 300,
//!     "connect_timeout_sec": 10,
//!     "retry_times": 3,
//!     "retry_interval_sec": 5,
//!     "auto_reconnect": true,
//!     "max_connections": 1024,
//! }
//! ```
//!
//! Binaries may also build a `Config` from command line flags alone and call
//! [`Config::check_valid`] before running.

use std::collections::HashSet;
use std::error;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::cipher::CipherType;

/// Default idle timeout for established relays
pub const DEFAULT_TIMEOUT_SEC: u32 = 300;
/// Default timeout for dials and negotiations
pub const DEFAULT_CONNECT_TIMEOUT_SEC: u32 = 10;
/// Default dial retry count on the local side
pub const DEFAULT_RETRY_TIMES: u8 = 3;
/// Default pause between dial retries
pub const DEFAULT_RETRY_INTERVAL_SEC: u8 = 5;
/// Default cap on concurrently relayed connections
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1024;

/// Which side of the tunnel this configuration is for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigType {
    /// Local end, the one applications talk to
    Local,
    /// Remote end, the one that dials origins
    Server,
}

impl ConfigType {
    pub fn is_local(self) -> bool {
        self == ConfigType::Local
    }
}

/// Raw on-disk record, before validation
#[derive(Deserialize, Debug, Default)]
struct RawConfig {
    server_host: Option<String>,
    server_port: Option<u16>,
    local_host: Option<String>,
    local_port: Option<u16>,
    http_port: Option<u16>,
    monitor_port: Option<u16>,
    password: Option<String>,
    method: Option<String>,
    timeout_sec: Option<u32>,
    connect_timeout_sec: Option<u32>,
    retry_times: Option<u8>,
    retry_interval_sec: Option<u8>,
    auto_reconnect: Option<bool>,
    max_connections: Option<u32>,
    forbidden_ip: Option<Vec<String>>,
    enable_table_cipher: Option<bool>,
}

/// Validated, immutable per-run configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Remote endpoint. The local side dials it, the remote side listens on it.
    pub server_host: String,
    pub server_port: u16,
    /// SOCKS5 listen address (local side)
    pub local_host: String,
    pub local_port: u16,
    /// Optional HTTP proxy listen port (local side)
    pub http_port: Option<u16>,
    /// Optional stats HTTP endpoint listen port
    pub monitor_port: Option<u16>,
    pub password: String,
    pub method: CipherType,
    /// Relay idle timeout
    pub timeout: Duration,
    /// Dial and negotiation timeout
    pub connect_timeout: Duration,
    pub retry_times: u8,
    pub retry_interval: Duration,
    pub auto_reconnect: bool,
    pub max_connections: u32,
    /// Origins whose resolved addresses must not be dialled (remote side)
    pub forbidden_ip: HashSet<IpAddr>,
    /// The legacy table cipher is refused unless explicitly enabled
    pub enable_table_cipher: bool,
    pub config_type: ConfigType,
}

#[derive(Clone, Copy, Debug)]
pub enum ErrorKind {
    MissingField,
    Malformed,
    Invalid,
    IoError,
    JsonParsingError,
}

/// Configuration error with a description and an optional detail string
pub struct Error {
    pub kind: ErrorKind,
    pub desc: &'static str,
    pub detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: &'static str, detail: Option<String>) -> Error {
        Error { kind, desc, detail }
    }
}

macro_rules! impl_from {
    ($error:ty, $kind:expr, $desc:expr) => {
        impl From<$error> for Error {
            fn from(err: $error) -> Self {
                Error::new($kind, $desc, Some(format!("{:?}", err)))
            }
        }
    };
}

impl_from!(::std::io::Error, ErrorKind::IoError, "error while reading file");
impl_from!(json5::Error, ErrorKind::JsonParsingError, "json parse error");

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.detail {
            None => write!(f, "{}", self.desc),
            Some(ref det) => write!(f, "{} {}", self.desc, det),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.detail {
            None => f.write_str(self.desc),
            Some(ref det) => write!(f, "{}, {}", self.desc, det),
        }
    }
}

impl error::Error for Error {}

impl Config {
    /// Creates a config filled with defaults; callers set the endpoint
    /// fields and then run [`Config::check_valid`]
    pub fn new(config_type: ConfigType) -> Config {
        Config {
            server_host: String::new(),
            server_port: 0,
            local_host: "127.0.0.1".to_owned(),
            local_port: 0,
            http_port: None,
            monitor_port: None,
            password: String::new(),
            method: CipherType::Aes256Cfb,
            timeout: Duration::from_secs(u64::from(DEFAULT_TIMEOUT_SEC)),
            connect_timeout: Duration::from_secs(u64::from(DEFAULT_CONNECT_TIMEOUT_SEC)),
            retry_times: DEFAULT_RETRY_TIMES,
            retry_interval: Duration::from_secs(u64::from(DEFAULT_RETRY_INTERVAL_SEC)),
            auto_reconnect: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            forbidden_ip: HashSet::new(),
            enable_table_cipher: false,
            config_type,
        }
    }

    fn load_from_raw(raw: RawConfig, config_type: ConfigType) -> Result<Config, Error> {
        let mut config = Config::new(config_type);

        match raw.server_host {
            Some(host) => config.server_host = host,
            None => {
                return Err(Error::new(
                    ErrorKind::MissingField,
                    "`server_host` is required",
                    None,
                ));
            }
        }

        match raw.server_port {
            Some(port) if port != 0 => config.server_port = port,
            _ => {
                return Err(Error::new(
                    ErrorKind::MissingField,
                    "`server_port` is required and must not be 0",
                    None,
                ));
            }
        }

        match raw.password {
            Some(ref pwd) if !pwd.is_empty() => config.password = pwd.clone(),
            _ => {
                return Err(Error::new(
                    ErrorKind::MissingField,
                    "`password` is required and must not be empty",
                    None,
                ));
            }
        }

        if let Some(ref m) = raw.method {
            config.method = m.parse::<CipherType>().map_err(|_| {
                Error::new(
                    ErrorKind::Invalid,
                    "unsupported method",
                    Some(format!("`{}` is not a supported method", m)),
                )
            })?;
        }

        if config_type.is_local() {
            if let Some(host) = raw.local_host {
                config.local_host = host;
            }
            match raw.local_port {
                Some(port) if port != 0 => config.local_port = port,
                _ => {
                    return Err(Error::new(
                        ErrorKind::MissingField,
                        "`local_port` is required and must not be 0",
                        None,
                    ));
                }
            }
            config.http_port = raw.http_port;
        }

        config.monitor_port = raw.monitor_port;

        if let Some(t) = raw.timeout_sec {
            config.timeout = Duration::from_secs(u64::from(t));
        }
        if let Some(t) = raw.connect_timeout_sec {
            config.connect_timeout = Duration::from_secs(u64::from(t));
        }
        if let Some(n) = raw.retry_times {
            config.retry_times = n;
        }
        if let Some(t) = raw.retry_interval_sec {
            config.retry_interval = Duration::from_secs(u64::from(t));
        }
        if let Some(b) = raw.auto_reconnect {
            config.auto_reconnect = b;
        }
        if let Some(n) = raw.max_connections {
            config.max_connections = n;
        }
        if let Some(b) = raw.enable_table_cipher {
            config.enable_table_cipher = b;
        }

        if let Some(ips) = raw.forbidden_ip {
            for ip in &ips {
                let parsed = ip.parse::<IpAddr>().map_err(|err| {
                    Error::new(
                        ErrorKind::Malformed,
                        "invalid `forbidden_ip` entry",
                        Some(format!("`{}`: {}", ip, err)),
                    )
                })?;
                config.forbidden_ip.insert(parsed);
            }
        }

        config.check_valid()?;

        Ok(config)
    }

    /// Parses a config from an in-memory JSON string
    pub fn load_from_str(s: &str, config_type: ConfigType) -> Result<Config, Error> {
        let raw = json5::from_str::<RawConfig>(s)?;
        Config::load_from_raw(raw, config_type)
    }

    /// Loads a config from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P, config_type: ConfigType) -> Result<Config, Error> {
        let mut reader = File::open(path)?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        Config::load_from_str(&content, config_type)
    }

    /// Cross-field validation, also run after command line overrides
    pub fn check_valid(&self) -> Result<(), Error> {
        if self.server_host.is_empty() || self.server_port == 0 {
            return Err(Error::new(
                ErrorKind::MissingField,
                "`server_host` and `server_port` are required",
                None,
            ));
        }

        if self.password.is_empty() {
            return Err(Error::new(
                ErrorKind::MissingField,
                "`password` is required and must not be empty",
                None,
            ));
        }

        if self.config_type.is_local() && self.local_port == 0 {
            return Err(Error::new(
                ErrorKind::MissingField,
                "`local_port` is required and must not be 0",
                None,
            ));
        }

        if self.method == CipherType::Table && !self.enable_table_cipher {
            return Err(Error::new(
                ErrorKind::Invalid,
                "the `table` method is insecure and disabled",
                Some("set `enable_table_cipher: true` to opt in".to_owned()),
            ));
        }

        Ok(())
    }

    /// `host:port` of the remote endpoint
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// `host:port` of the SOCKS5 listener
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}
