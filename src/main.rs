#![cfg_attr(test, allow(clippy::unwrap_used, clippy::too_many_lines))]

mod access;
mod api;
mod bufslots;
mod cluster;
mod config;
mod dashboard;
mod error;
mod handler;
mod hashutil;
mod http_range;
mod humanfmt;
mod log_once;
mod logstore;
mod randutil;
mod sign;
mod stats;
mod storage;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser;
use futures_util::FutureExt as _;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, SERVER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{LevelFilter, debug, error, info, trace, warn};
use simplelog::CombinedLogger;
use simplelog::ConfigBuilder;
use simplelog::WriteLogger;
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::bufslots::BufSlots;
use crate::cluster::Cluster;
use crate::config::{Config, StorageKind};
use crate::error::NodeError;
use crate::humanfmt::HumanFmt;
use crate::logstore::LogStore;
use crate::stats::run_aggregator;
use crate::storage::{LocalStorage, MountStorage, Storage, init_cache_layout};

pub(crate) type NodeBody = BoxBody<bytes::Bytes, NodeError>;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[must_use]
pub(crate) fn empty() -> NodeBody {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn full<T: Into<bytes::Bytes>>(chunk: T) -> NodeBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn quick_response<T: Into<bytes::Bytes>>(
    status: StatusCode,
    message: T,
) -> Response<NodeBody> {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(message))
        .expect("Response is valid")
}

/// Outermost request wrapper: panic recovery, host redirect, then the
/// recording middleware and the router.
async fn handle_request(
    cluster: Arc<Cluster>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<NodeBody>, std::convert::Infallible> {
    let inner = std::panic::AssertUnwindSafe(handle_request_inner(&cluster, peer, req));
    let response = match inner.catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic");
            error!("Panic while serving request from {}: {msg}", peer.ip().to_canonical());
            quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    };
    Ok(response)
}

async fn handle_request_inner(
    cluster: &Arc<Cluster>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<NodeBody> {
    if let Some(response) = handler::check_host_redirect(cluster.config(), &req) {
        return response;
    }
    access::record_middleware(cluster, peer, req).await
}

#[must_use]
fn is_iokind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    std::error::Error::source(&err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|ioerr| ioerr.kind() == kind)
}

#[must_use]
fn is_benign_disconnect(err: &hyper::Error) -> bool {
    err.is_incomplete_message()
        || is_iokind(err, std::io::ErrorKind::ConnectionReset)
        || is_iokind(err, std::io::ErrorKind::BrokenPipe)
        || is_iokind(err, std::io::ErrorKind::NotConnected)
}

fn build_storages(
    config: &'static Config,
    slots: &Arc<BufSlots>,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<Storage>> {
    let mut storages = Vec::with_capacity(config.storages.len());
    for sc in &config.storages {
        match sc.kind {
            StorageKind::Local => {
                init_cache_layout(&sc.path).with_context(|| {
                    format!("Failed to prepare storage directory `{}`", sc.path.display())
                })?;
                storages.push(Storage::Local(LocalStorage::new(
                    sc.name.clone(),
                    sc.path.clone(),
                    Arc::clone(slots),
                    shutdown.clone(),
                )));
            }
            StorageKind::Mount => {
                storages.push(Storage::Mount(MountStorage::new(
                    sc.name.clone(),
                    sc.path.clone(),
                    sc.public_url
                        .clone()
                        .expect("mount storages were validated to carry public_url"),
                )));
            }
        }
    }
    Ok(storages)
}

async fn main_loop() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = global_config();

    let mut addr = SocketAddr::from((config.bind_addr, config.bind_port.get()));

    let listener = match TcpListener::bind(addr).await {
        Ok(x) => x,
        Err(err) => {
            if config.bind_addr != Ipv6Addr::UNSPECIFIED {
                error!("Error binding on {addr}:  {err}");
                Err(err)?;
            }

            // Fallback to IPv4 to avoid errors when IPv6 is not available and the default configuration is used.
            addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.bind_port.get()));
            TcpListener::bind(addr).await.map_err(|err| {
                error!("Error binding fallback on {addr}:  {err}");
                err
            })?
        }
    };
    info!("Listening on http://{addr}");

    let shutdown = CancellationToken::new();
    let slots = Arc::new(BufSlots::new(config.buffer_slots));
    let storages = build_storages(config, &slots, &shutdown)?;
    let weights = config.storage_weights();

    /* The authority-protocol collaborator owns enable/disable in a deployed
     * node; without one the node serves from boot. */
    let (cluster, record_rx) = Cluster::new(config, storages, weights, slots, None);
    tokio::task::spawn(run_aggregator(Arc::clone(&cluster), record_rx));
    cluster.enable();

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                break;
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                break;
            },
            n = listener.accept() => n
        };

        let (stream, client) = next.map_err(|err| {
            error!("Error accepting connection:  {err}");
            err
        })?;

        debug!("New client connection from {}", client.ip().to_canonical());
        let client_start = Instant::now();

        let cluster = Arc::clone(&cluster);
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| {
                        handle_request(Arc::clone(&cluster), client, req)
                    }),
                )
                .await
            {
                if is_benign_disconnect(&err) {
                    debug!(
                        "Connection to client {} dropped:  {err}",
                        client.ip().to_canonical()
                    );
                } else {
                    error!(
                        "Error serving connection for client {}:  {err}",
                        client.ip().to_canonical()
                    );
                }
            }

            trace!(
                "Closed connection to {} after {}",
                client.ip().to_canonical(),
                HumanFmt::Time(client_start.elapsed())
            );
        });
    }

    cluster.disable();
    shutdown.cancel();
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Permit daemon running as root user (potentially dangerous)
    #[arg(long, default_value = "false")]
    permit_running_daemon_as_root: bool,
}

#[derive(Debug)]
struct RuntimeDetails {
    start_time: time::OffsetDateTime,
    config: Config,
}

static RUNTIMEDETAILS: OnceLock<RuntimeDetails> = OnceLock::new();
static LOGSTORE: OnceLock<LogStore> = OnceLock::new();

#[must_use]
fn global_config() -> &'static Config {
    &RUNTIMEDETAILS
        .get()
        .expect("Global was initialized in main()")
        .config
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    let (config, cfg_fallback) = Config::new(&args.config_path)?;

    let config_log_level = config.log_level;
    let config_logstore_capacity = config.logstore_capacity;

    RUNTIMEDETAILS
        .set(RuntimeDetails {
            start_time: time::OffsetDateTime::now_utc(),
            config,
        })
        .expect("Initial set should succeed");

    let output_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    let internal_log_config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Error)
        .set_level_padding(simplelog::LevelPadding::Right)
        .set_target_level(LevelFilter::Warn)
        .set_time_format_rfc2822()
        .build();

    LOGSTORE
        .set(LogStore::new(config_logstore_capacity))
        .expect("Initial set should succeed");

    CombinedLogger::init(vec![
        TermLogger::new(
            args.log_level.unwrap_or(config_log_level),
            output_log_config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            LevelFilter::Warn,
            internal_log_config,
            LOGSTORE.get().expect("Should be set").clone(),
        ),
    ])?;

    debug!("Logger initialized");
    trace!("Tracing enabled");

    if cfg_fallback {
        info!(
            "Default configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {:?}", global_config());

    if nix::unistd::getuid().is_root() {
        if args.permit_running_daemon_as_root {
            warn!("!! Running as root is not recommended !!");
        } else {
            error!("Running as root is not recommended and not permitted by default");
            std::process::exit(1);
        }
    }

    if global_config().cluster_secret.is_empty() {
        warn!("cluster_secret is empty, all signed requests will be rejected");
    }

    std::panic::set_hook(Box::new(move |info| {
        error!("{info}");
        eprintln!("{info}");
    }));

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("bmclapi-node-w")
        .build()
        .expect("Should succeed");

    runtime.block_on(async { main_loop().await })
}
