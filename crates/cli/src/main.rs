mod calc;
mod config;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use perm::{CallContext, bind};
use rpc::{Authenticator, Client, Headers, Server};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use calc::Calc;
use config::Config;
use error::Result;

const CONFIG_FILE: &str = "permgate.toml";

#[derive(Parser)]
#[command(name = "permgate")]
#[command(about = "Permission-gated RPC service", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo calculator behind the authenticator
    Serve,
    /// List the methods the configured template exposes
    Methods,
    /// Call a method on a running server
    Call {
        /// Method name without namespace, e.g. Add
        method: String,
        /// Positional params as a JSON array
        #[arg(default_value = "[]")]
        params: String,
        /// Bearer token to authenticate with
        #[arg(short, long, env = "PERMGATE_TOKEN")]
        token: Option<String>,
        /// Server address, overriding the config
        #[arg(short, long)]
        addr: Option<String>,
        /// Treat the method as a stream and print every item
        #[arg(short, long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Methods => cmd_methods(config),
        Commands::Call {
            method,
            params,
            token,
            addr,
            stream,
        } => cmd_call(config, &method, &params, token, addr, stream).await,
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        tracing::info!(path = %path.display(), "config not found, using defaults");
        Ok(Config::default_config())
    }
}

fn build_server(config: &Config) -> Result<Server> {
    let proxy = bind(
        &config.perms.valid,
        &config.perms.default,
        &Calc::new(),
        &config.template,
    )?;
    let mut server = Server::new();
    server.register(config.template.name.clone(), proxy);
    Ok(server)
}

async fn cmd_serve(config: Config) -> Result<()> {
    let server = build_server(&config)?;
    let methods = server.methods();
    if config.tokens.is_empty() && !config.allow_anonymous {
        tracing::warn!("no tokens configured and anonymous access is off; every connection will be rejected");
    }

    let gate = Arc::new(
        Authenticator::new(config.tokens, server).allow_anonymous(config.allow_anonymous),
    );
    let listener = TcpListener::bind(&config.listen).await?;
    tracing::info!(addr = %config.listen, methods = methods.len(), "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted connection");
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            match gate.accept(CallContext::new(), stream).await {
                Ok(()) => tracing::debug!(%peer, "connection closed"),
                Err(e) => tracing::info!(%peer, error = %e, "connection ended"),
            }
        });
    }
}

fn cmd_methods(config: Config) -> Result<()> {
    let server = build_server(&config)?;
    for method in server.methods() {
        println!("{method}");
    }
    Ok(())
}

async fn cmd_call(
    config: Config,
    method: &str,
    params: &str,
    token: Option<String>,
    addr: Option<String>,
    stream: bool,
) -> Result<()> {
    let params: Value = serde_json::from_str(params)?;
    let addr = addr.unwrap_or(config.listen);
    let connector = move || TcpStream::connect(addr.clone());

    let mut headers = Headers::new();
    if let Some(token) = token {
        headers.insert("Authorization", format!("Bearer {token}"));
    }
    let client_config = config.client.with_no_reconnect();
    let client = Client::connect(connector, config.template.name, headers, client_config).await?;

    if stream {
        let mut items = client.subscribe::<Value>(method, params).await?;
        while let Some(item) = items.next().await {
            println!("{}", item?);
        }
    } else {
        let result: Value = client.call(method, params).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
