mod config;
mod connections;
mod demo;
mod ws_client;
mod ws_server;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rpc_core::{Acceptor, Channel, Client, Server};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_ws_url, Config, Overrides};
use crate::ws_client::WsChannel;
use crate::ws_server::WsAcceptor;

#[derive(Parser)]
#[command(name = "rpc-relay")]
#[command(about = "Serve or talk to a JSON-RPC endpoint over WebSocket")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short = 'c', long, global = true, env = "RPC_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Write every sent and received message to stderr
    #[arg(long, global = true)]
    log_console: bool,

    /// Re-emit every sent and received message as an event
    #[arg(long, global = true)]
    log_events: bool,

    /// Format tracing output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the Game domain over WebSocket
    Serve(ServeArgs),
    /// Call a method and print its result
    Call(CallArgs),
    /// Send a notification
    Notify(NotifyArgs),
    /// Print notifications as they arrive
    Listen(ListenArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "RPC_RELAY_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "RPC_RELAY_PORT")]
    port: Option<u16>,

    /// Route of the WebSocket endpoint
    #[arg(long, env = "RPC_RELAY_PATH")]
    path: Option<String>,
}

#[derive(Args)]
struct Target {
    /// Server URL (defaults to the configured host, port and path)
    #[arg(short, long, env = "RPC_RELAY_URL")]
    url: Option<String>,

    /// Give up after this many seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,
}

#[derive(Args)]
struct CallArgs {
    /// Dotted method name, e.g. Game.help
    method: String,

    /// Params as JSON
    params: Option<String>,

    #[command(flatten)]
    target: Target,
}

#[derive(Args)]
struct NotifyArgs {
    method: String,

    params: Option<String>,

    #[command(flatten)]
    target: Target,
}

#[derive(Args)]
struct ListenArgs {
    /// Notification names to print, e.g. Game.levelUp
    #[arg(required = true)]
    events: Vec<String>,

    #[arg(short, long, env = "RPC_RELAY_URL")]
    url: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn parse_params(params: Option<&str>) -> Result<Option<Value>> {
    params
        .map(|text| serde_json::from_str(text).with_context(|| format!("Invalid params JSON: {}", text)))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    let (host, port, path) = match &cli.command {
        Commands::Serve(args) => (args.host.clone(), args.port, args.path.clone()),
        _ => (None, None, None),
    };
    config.apply(Overrides {
        host,
        port,
        path,
        log_to_events: cli.log_events,
        log_to_console: cli.log_console,
        json: cli.json,
    })?;

    init_tracing(config.logging.json);

    match cli.command {
        Commands::Serve(_) => serve(&config).await,
        Commands::Call(args) => call(&config, args).await,
        Commands::Notify(args) => notify(&config, args).await,
        Commands::Listen(args) => listen(&config, args).await,
    }
}

async fn serve(config: &Config) -> Result<()> {
    let token = CancellationToken::new();
    let acceptor = WsAcceptor::new(token.clone());
    let server = Server::new(
        Some(acceptor.clone() as Arc<dyn Acceptor>),
        config.log_options(),
    )?;
    if config.logging.log_to_events {
        server.on_traffic(|direction, message| {
            tracing::info!(direction = direction.as_str(), frame = message, "Server traffic")
        });
    }
    demo::install(&server)?;

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        path = %config.server.path,
        methods = ?server.methods(),
        "Listening"
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            token.cancel();
        }
    });

    acceptor.serve(listener, &config.server.path).await
}

fn connect(config: &Config, url: Option<&str>) -> Result<(Client, Arc<WsChannel>)> {
    let url = match url {
        Some(url) => parse_ws_url(url)?,
        None => config.ws_url()?,
    };
    let channel = WsChannel::connect(url);
    let client = Client::new(
        Some(channel.clone() as Arc<dyn Channel>),
        config.log_options(),
    )?;
    client.on_error(|error| tracing::warn!(%error, "Protocol error"));
    if config.logging.log_to_events {
        client.on_traffic(|direction, message| {
            tracing::info!(direction = direction.as_str(), frame = message, "Client traffic")
        });
    }
    Ok((client, channel))
}

async fn call(config: &Config, args: CallArgs) -> Result<()> {
    let params = parse_params(args.params.as_deref())?;
    let (client, channel) = connect(config, args.target.url.as_deref())?;
    let closed = channel.closed_token();

    let response = client.call(args.method.as_str(), params);
    let result = tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(args.target.timeout), response) => {
            result.map_err(|_| anyhow!("No response from {} within {}s", channel.url(), args.target.timeout))??
        }
        _ = closed.cancelled() => {
            return Err(anyhow!("Connection to {} closed before a response arrived", channel.url()));
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn notify(config: &Config, args: NotifyArgs) -> Result<()> {
    let params = parse_params(args.params.as_deref())?;
    let (client, channel) = connect(config, args.target.url.as_deref())?;
    let closed = channel.closed_token();
    let url = channel.url().clone();

    client.notify(args.method.as_str(), params);

    let deadline = Duration::from_secs(args.target.timeout);
    let flushed = tokio::time::timeout(deadline, async {
        while !(client.is_connected() && client.queued() == 0) {
            if closed.is_cancelled() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    })
    .await
    .unwrap_or(false);
    if !flushed {
        return Err(anyhow!("Could not deliver notification to {}", url));
    }

    // Dropping the last handle drains the socket and closes it.
    drop(client);
    drop(channel);
    let _ = tokio::time::timeout(deadline, closed.cancelled()).await;
    Ok(())
}

async fn listen(config: &Config, args: ListenArgs) -> Result<()> {
    let (client, channel) = connect(config, args.url.as_deref())?;
    let closed = channel.closed_token();

    for event in &args.events {
        let name = event.clone();
        client.on(event, move |params| {
            let params = params.map(|p| p.to_string()).unwrap_or_default();
            println!("{} {}", name, params);
        });
    }
    tracing::info!(url = %channel.url(), events = ?args.events, "Listening for notifications");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = closed.cancelled() => Err(anyhow!("Connection to {} closed", channel.url())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_with_params() {
        let cli = Cli::try_parse_from([
            "rpc-relay",
            "call",
            "Game.help",
            r#"{"lives":1}"#,
            "--url",
            "ws://localhost:9000/rpc",
        ])
        .unwrap();
        let Commands::Call(args) = cli.command else {
            panic!("expected call");
        };
        assert_eq!(args.method, "Game.help");
        assert_eq!(args.target.timeout, 10);
        assert_eq!(
            parse_params(args.params.as_deref()).unwrap(),
            Some(json!({"lives": 1}))
        );
    }

    #[test]
    fn listen_requires_an_event() {
        assert!(Cli::try_parse_from(["rpc-relay", "listen"]).is_err());
    }

    #[test]
    fn invalid_params_are_rejected() {
        let err = parse_params(Some("{lives:1}")).unwrap_err();
        assert!(err.to_string().contains("Invalid params JSON"));
        assert_eq!(parse_params(None).unwrap(), None);
    }
}
