//! This binary runs the remote end of the tunnel, the one that dials the
//! origins clients asked for.
//!
//! All configuration attributes can be given on the command line, or a
//! configuration file can be passed with `-c`. The file format is defined in
//! mod `config`.

#[macro_use]
extern crate log;

use std::env;
use std::io::{self, Write};

use clap::{App, Arg, ArgMatches};
use futures::future::{self, Either};
use futures::pin_mut;
use log::LevelFilter;

use jumptiger::{run_remote, shutdown, Config, ConfigType};

fn init_logging(matches: &ArgMatches<'_>) {
    let mut builder = env_logger::Builder::new();
    builder.filter(None, LevelFilter::Info);

    let without_time = matches.is_present("LOG_WITHOUT_TIME");
    let debug_level = matches.occurrences_of("VERBOSE");
    let with_module = debug_level > 0;

    builder.format(move |buf, record| {
        let module = if with_module {
            format!(" [{}]", record.module_path().unwrap_or("?"))
        } else {
            String::new()
        };
        if without_time {
            writeln!(buf, "[{}]{} {}", record.level(), module, record.args())
        } else {
            writeln!(
                buf,
                "[{}][{}]{} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                module,
                record.args()
            )
        }
    });

    match debug_level {
        0 => {}
        1 => {
            builder.filter(Some("jtserver"), LevelFilter::Debug);
        }
        2 => {
            builder
                .filter(Some("jtserver"), LevelFilter::Debug)
                .filter(Some("jumptiger"), LevelFilter::Debug);
        }
        3 => {
            builder
                .filter(Some("jtserver"), LevelFilter::Trace)
                .filter(Some("jumptiger"), LevelFilter::Trace);
        }
        _ => {
            builder.filter(None, LevelFilter::Trace);
        }
    }

    if let Ok(env_conf) = env::var("RUST_LOG") {
        builder.parse_filters(&env_conf);
    }

    builder.init();
}

fn exit_code_for(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput => 2,
        _ => 3,
    }
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let matches = App::new("jumptiger-server")
        .version(jumptiger::VERSION)
        .about("The remote end of an encrypting tunnel proxy.")
        .arg(
            Arg::with_name("VERBOSE")
                .short("v")
                .multiple(true)
                .help("Set the level of debug"),
        )
        .arg(
            Arg::with_name("CONFIG")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Specify config file"),
        )
        .arg(
            Arg::with_name("SERVER_HOST")
                .short("s")
                .long("server-host")
                .takes_value(true)
                .help("Listen address"),
        )
        .arg(
            Arg::with_name("SERVER_PORT")
                .short("p")
                .long("server-port")
                .takes_value(true)
                .help("Listen port"),
        )
        .arg(
            Arg::with_name("MONITOR_PORT")
                .long("monitor-port")
                .takes_value(true)
                .help("Loopback stats endpoint port"),
        )
        .arg(
            Arg::with_name("PASSWORD")
                .short("k")
                .long("password")
                .takes_value(true)
                .help("Password"),
        )
        .arg(
            Arg::with_name("ENCRYPT_METHOD")
                .short("m")
                .long("encrypt-method")
                .takes_value(true)
                .help("Encryption method"),
        )
        .arg(
            Arg::with_name("ENABLE_TABLE")
                .long("enable-table-cipher")
                .help("Allow the insecure legacy `table` method"),
        )
        .arg(
            Arg::with_name("LOG_WITHOUT_TIME")
                .long("log-without-time")
                .help("Disable time in log"),
        )
        .get_matches();

    init_logging(&matches);

    let mut config = match matches.value_of("CONFIG") {
        Some(path) => match Config::load_from_file(path, ConfigType::Server) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load config {}: {:?}", path, err);
                return 1;
            }
        },
        None => Config::new(ConfigType::Server),
    };

    if let Some(host) = matches.value_of("SERVER_HOST") {
        config.server_host = host.to_owned();
    }

    macro_rules! parse_port {
        ($name:expr) => {
            match matches.value_of($name) {
                Some(value) => match value.parse::<u16>() {
                    Ok(port) => Some(port),
                    Err(..) => {
                        error!("invalid port `{}` for {}", value, $name);
                        return 1;
                    }
                },
                None => None,
            }
        };
    }

    if let Some(port) = parse_port!("SERVER_PORT") {
        config.server_port = port;
    }
    if let Some(port) = parse_port!("MONITOR_PORT") {
        config.monitor_port = Some(port);
    }

    if let Some(pwd) = matches.value_of("PASSWORD") {
        config.password = pwd.to_owned();
    }
    if let Some(method) = matches.value_of("ENCRYPT_METHOD") {
        match method.parse() {
            Ok(m) => config.method = m,
            Err(err) => {
                error!("{}", err);
                return 1;
            }
        }
    }
    if matches.is_present("ENABLE_TABLE") {
        config.enable_table_cipher = true;
    }

    if let Err(err) = config.check_valid() {
        error!("invalid configuration: {}", err);
        return 1;
    }

    info!("jumptiger server {}", jumptiger::VERSION);
    debug!("config: {:?}", config);

    let mut runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start runtime: {}", err);
            return 3;
        }
    };

    runtime.block_on(async move {
        let server = run_remote(config);
        pin_mut!(server);
        let ctrl_c = tokio::signal::ctrl_c();
        pin_mut!(ctrl_c);

        match future::select(server, ctrl_c).await {
            Either::Left((Ok(()), ..)) => 0,
            Either::Left((Err(err), ..)) => {
                error!("server aborted: {}", err);
                exit_code_for(&err)
            }
            Either::Right(..) => {
                info!("interrupt received, shutting down");
                shutdown().await;
                0
            }
        }
    })
}
