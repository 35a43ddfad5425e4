//! jumptiger is an encrypting TCP tunnel.
//!
//! Local applications speak SOCKS5 or HTTP (CONNECT and plain requests) to a
//! local proxy, which relays their streams over a cipher-framed link to a
//! remote proxy. The remote proxy decrypts, dials the requested origin and
//! proxies bytes in both directions.
//!
//! ```no_run
//! use jumptiger::{run_local, Config, ConfigType};
//!
//! let config = Config::load_from_str(
//!     r#"{
//!         "server_host": "example.org",
//!         "server_port": 8388,
//!         "local_host": "127.0.0.1",
//!         "local_port": 1080,
//!         "password": "the-shared-password",
//!         "method": "aes-256-cfb"
//!     }"#,
//!     ConfigType::Local,
//! ).unwrap();
//!
//! let mut rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(run_local(config)).unwrap();
//! ```

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod context;
pub mod crypto;
pub mod monitor;
pub mod relay;

pub use self::config::{Config, ConfigType};
pub use self::context::{shutdown, stats_snapshot};
pub use self::crypto::cipher::CipherType;
pub use self::relay::{local::run_local, server::run_remote};

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
