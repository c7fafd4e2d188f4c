use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing::level_filters::LevelFilter;

use naumachia::container::Gateway as ContainerGateway;
use naumachia::netlink::Gateway as NetlinkGateway;
use naumachia::xmlrpc::{self, MethodCall, MethodResponse, Value};
use naumachia::Manager;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(
        long = "listen",
        short = 'l',
        help = "listen address for the RPC server.",
        default_value = "0.0.0.0:8000"
    )]
    listen: SocketAddr,

    #[clap(
        long = "challenges-root",
        short = 'r',
        help = "root directory compose file paths are resolved against.",
        default_value = "."
    )]
    challenges_root: PathBuf,

    #[clap(
        long = "compose-bin",
        help = "compose binary and leading arguments, e.g. 'docker compose'.",
        default_value = "docker-compose"
    )]
    compose_bin: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    ) {
        Cli::command()
            .error(
                ErrorKind::Io,
                format!("failed to set global default subscriber: {:?}", e),
            )
            .exit();
    }

    let cli = Cli::parse();
    let manager = match build_manager(&cli) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            tracing::error!(error = ?e, "fatal init failure");
            std::process::exit(1);
        }
    };

    let app = axum::Router::new()
        .route("/RPC2", post(handle_rpc))
        .with_state(manager.clone());

    let listener = match tokio::net::TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = ?e, "failed to bind listen address");
            std::process::exit(1);
        }
    };
    tracing::info!("listening on: {}", cli.listen);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = ?e, "server exited with error");
        std::process::exit(1);
    }

    manager.stop();
    tracing::info!("server stopped");
}

fn build_manager(cli: &Cli) -> anyhow::Result<Manager> {
    let netlink = Arc::new(NetlinkGateway::open()?);
    let containers = Arc::new(ContainerGateway::new(
        cli.challenges_root.clone(),
        cli.compose_bin.split_whitespace().map(str::to_string).collect(),
    ));
    Ok(Manager::new(netlink, containers))
}

/// Races SIGINT/SIGTERM. `axum::serve`'s graceful shutdown only awaits this
/// future once, so there's no second signal to guard against here.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("received shutdown signal");
}

async fn handle_rpc(
    State(manager): State<Arc<Manager>>,
    body: Bytes,
) -> Result<Bytes, StatusCode> {
    let call = xmlrpc::decode_call(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    // compose subprocess spawn/wait and netlink commits block the calling
    // thread (SPEC_FULL.md's concurrency section), so they run off the
    // async executor rather than stalling one of its worker threads.
    let response = tokio::task::spawn_blocking(move || dispatch(&manager, call))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Bytes::from(xmlrpc::encode_response(&response)))
}

fn dispatch(manager: &Manager, call: MethodCall) -> MethodResponse {
    match call.name.as_str() {
        "register_challenge" => register_challenge(manager, &call.params),
        "connect_user" => connect_user(manager, &call.params),
        "disconnect_user" => disconnect_user(manager, &call.params),
        other => MethodResponse::Fault {
            code: 1,
            message: format!("unknown method {other:?}"),
        },
    }
}

fn register_challenge(manager: &Manager, params: &[Value]) -> MethodResponse {
    let (name, host_veth, compose_files) = match (params.get(0), params.get(1), params.get(2)) {
        (Some(name), Some(host_veth), Some(files)) => (name, host_veth, files),
        _ => return fault_bad_params(),
    };
    let (name, host_veth) = match (name.as_str(), host_veth.as_str()) {
        (Some(name), Some(host_veth)) => (name, host_veth),
        _ => return fault_bad_params(),
    };
    let files = match compose_files.as_array() {
        Some(items) => items,
        None => return fault_bad_params(),
    };
    let files = match files
        .iter()
        .map(|v| v.as_str().map(PathBuf::from))
        .collect::<Option<Vec<_>>>()
    {
        Some(files) => files,
        None => return fault_bad_params(),
    };

    match manager.register_challenge(name, host_veth, files) {
        Ok(()) => MethodResponse::Success(Value::Nil),
        Err(err) => fault_from_error(&err),
    }
}

fn connect_user(manager: &Manager, params: &[Value]) -> MethodResponse {
    let (challenge, cn, ip, port) = match parse_connection_params(params) {
        Some(parsed) => parsed,
        None => return fault_bad_params(),
    };
    match manager.connect_user(challenge, cn, ip, port) {
        Ok(vlan) => MethodResponse::Success(Value::Int(vlan as i32)),
        Err(err) => fault_from_error(&err),
    }
}

fn disconnect_user(manager: &Manager, params: &[Value]) -> MethodResponse {
    let (challenge, cn, ip, port) = match parse_connection_params(params) {
        Some(parsed) => parsed,
        None => return fault_bad_params(),
    };
    match manager.disconnect_user(challenge, cn, ip, port) {
        Ok(()) => MethodResponse::Success(Value::Nil),
        Err(err) => fault_from_error(&err),
    }
}

fn parse_connection_params(params: &[Value]) -> Option<(&str, &str, &str, u16)> {
    let challenge = params.get(0)?.as_str()?;
    let cn = params.get(1)?.as_str()?;
    let ip = params.get(2)?.as_str()?;
    let port = params.get(3)?.as_int()?;
    Some((challenge, cn, ip, u16::try_from(port).ok()?))
}

fn fault_bad_params() -> MethodResponse {
    MethodResponse::Fault {
        code: 2,
        message: "malformed parameters".to_string(),
    }
}

fn fault_from_error(err: &naumachia::Error) -> MethodResponse {
    tracing::warn!(error = %err, "rpc call failed");
    MethodResponse::Fault {
        code: 3,
        message: err.to_string(),
    }
}
