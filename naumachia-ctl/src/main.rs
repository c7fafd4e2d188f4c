use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing::level_filters::LevelFilter;

use naumachia::xmlrpc::{self, MethodCall, MethodResponse, Value};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(
        long = "manager",
        short = 'm',
        help = "address of the naumachia-manager RPC endpoint",
        default_value = "127.0.0.1:8000"
    )]
    manager: SocketAddr,

    #[command(subcommand)]
    command: Cmds,
}

#[derive(Debug, clap::Subcommand)]
enum Cmds {
    /// Register a challenge's host VETH and compose files.
    RegisterChallenge {
        name: String,
        host_veth: String,
        #[clap(required = true)]
        compose_files: Vec<PathBuf>,
    },
    /// Connect a user's tunnel endpoint; prints the assigned VLAN.
    ConnectUser {
        challenge: String,
        cn: String,
        ip: String,
        port: u16,
    },
    /// Disconnect a user's tunnel endpoint.
    DisconnectUser {
        challenge: String,
        cn: String,
        ip: String,
        port: u16,
    },
}

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::WARN.into())
                    .from_env_lossy(),
            )
            .finish(),
    )
    .ok();

    let cli = Cli::parse();
    if let Err(e) = dispatch(&cli) {
        Cli::command()
            .error(ErrorKind::Io, format!("failed to dispatch: {:?}", e))
            .exit();
    }
}

fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let call = match &cli.command {
        Cmds::RegisterChallenge {
            name,
            host_veth,
            compose_files,
        } => MethodCall {
            name: "register_challenge".to_string(),
            params: vec![
                Value::String(name.clone()),
                Value::String(host_veth.clone()),
                Value::Array(
                    compose_files
                        .iter()
                        .map(|p| Value::String(p.display().to_string()))
                        .collect(),
                ),
            ],
        },
        Cmds::ConnectUser {
            challenge,
            cn,
            ip,
            port,
        } => MethodCall {
            name: "connect_user".to_string(),
            params: vec![
                Value::String(challenge.clone()),
                Value::String(cn.clone()),
                Value::String(ip.clone()),
                Value::Int(i32::from(*port)),
            ],
        },
        Cmds::DisconnectUser {
            challenge,
            cn,
            ip,
            port,
        } => MethodCall {
            name: "disconnect_user".to_string(),
            params: vec![
                Value::String(challenge.clone()),
                Value::String(cn.clone()),
                Value::String(ip.clone()),
                Value::Int(i32::from(*port)),
            ],
        },
    };

    match call_rpc(cli.manager, &call)? {
        MethodResponse::Success(Value::Nil) => {
            println!("ok");
        }
        MethodResponse::Success(value) => {
            println!("{value:?}");
        }
        MethodResponse::Fault { code, message } => {
            bail!("rpc fault {code}: {message}");
        }
    }
    Ok(())
}

fn call_rpc(manager: SocketAddr, call: &MethodCall) -> anyhow::Result<MethodResponse> {
    let body = xmlrpc::encode_call(call);
    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("http://{manager}/RPC2"))
        .body(body)
        .send()
        .context("failed to reach naumachia-manager")?;
    if !response.status().is_success() {
        bail!("manager returned HTTP {}", response.status());
    }
    let bytes = response.bytes().context("failed to read response body")?;
    xmlrpc::decode_response(&bytes).context("failed to decode xml-rpc response")
}
