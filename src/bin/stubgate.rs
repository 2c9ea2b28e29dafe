//! stubgate - interceptor server and token management.
//!
//! ```text
//! stubgate server start --port 7070 --token-file .stubgate/tokens
//! stubgate token create ci-runner
//! stubgate token list
//! stubgate token revoke <id>
//! ```

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use http::StatusCode;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::Duration;
use stubgate::config::{DEFAULT_CONNECT_PATH, DEFAULT_PORT, FallbackPolicy, ServerConfig, default_token_path};
use stubgate::logging::{self, LogFormat};
use stubgate::remote::{InterceptorServer, TokenStore};
use tracing::{info, warn};
use url::Url;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// stubgate - declarative HTTP interception for tests
#[derive(Parser, Debug)]
#[command(name = "stubgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty, env = "STUBGATE_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the interceptor server
    #[command(subcommand)]
    Server(ServerCommand),
    /// Manage client tokens
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Start serving until interrupted
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1", env = "STUBGATE_HOSTNAME")]
    hostname: String,

    /// Port to bind (0 picks a free port)
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "STUBGATE_PORT")]
    port: u16,

    /// Path clients connect on
    #[arg(long, default_value = DEFAULT_CONNECT_PATH, env = "STUBGATE_CONNECT_PATH")]
    connect_path: String,

    /// Token file; without one every client is accepted
    #[arg(long, env = "STUBGATE_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Warn about requests no client handles
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "STUBGATE_LOG_UNHANDLED")]
    log_unhandled: bool,

    /// Time a client has to answer one request (e.g. "10s", "500ms")
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, env = "STUBGATE_RPC_TIMEOUT")]
    rpc_timeout: Duration,

    /// Time a client has to authenticate
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, env = "STUBGATE_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Duration,

    /// Forward unhandled requests to this origin instead of answering them
    #[arg(long, env = "STUBGATE_FALLBACK_TARGET")]
    fallback_target: Option<Url>,

    /// Status for unhandled requests when no fallback target is set
    #[arg(long, default_value_t = 404, env = "STUBGATE_FALLBACK_STATUS")]
    fallback_status: u16,

    /// Status for requests a client rejected
    #[arg(long, default_value_t = 500, env = "STUBGATE_REJECT_STATUS")]
    reject_status: u16,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Create a token and print it once
    Create(TokenCreateArgs),
    /// List token records
    List(TokenFileArgs),
    /// Revoke a token by id
    Revoke(TokenRevokeArgs),
}

#[derive(Args, Debug)]
struct TokenFileArgs {
    /// Token file (default: ./.stubgate/tokens)
    #[arg(long, env = "STUBGATE_TOKEN_FILE")]
    token_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TokenCreateArgs {
    /// Label for the token
    name: String,

    #[command(flatten)]
    file: TokenFileArgs,
}

#[derive(Args, Debug)]
struct TokenRevokeArgs {
    /// Token id
    id: String,

    #[command(flatten)]
    file: TokenFileArgs,
}

impl StartArgs {
    fn into_config(self) -> Result<ServerConfig> {
        let fallback = match self.fallback_target {
            Some(target) => FallbackPolicy::Forward { target },
            None => FallbackPolicy::NotIntercepted {
                status: StatusCode::from_u16(self.fallback_status).context("invalid --fallback-status")?,
            },
        };
        Ok(ServerConfig {
            hostname: self.hostname,
            port: self.port,
            connect_path: self.connect_path,
            token_file: self.token_file,
            log_unhandled: self.log_unhandled,
            rpc_timeout: self.rpc_timeout,
            handshake_timeout: self.handshake_timeout,
            fallback,
            reject_status: StatusCode::from_u16(self.reject_status).context("invalid --reject-status")?,
            ..Default::default()
        })
    }
}

impl TokenFileArgs {
    fn open(&self) -> Result<TokenStore> {
        let path = match &self.token_file {
            Some(path) => path.clone(),
            None => default_token_path(&std::env::current_dir().context("cannot read working directory")?),
        };
        TokenStore::open(&path).with_context(|| format!("cannot open token file {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format).context("failed to install tracing subscriber")?;

    match cli.command {
        Command::Server(ServerCommand::Start(args)) => serve(args).await,
        Command::Token(command) => tokens(command),
    }
}

async fn serve(args: StartArgs) -> Result<()> {
    let config = args.into_config()?;
    let tokens = match &config.token_file {
        Some(path) => TokenStore::open(path).with_context(|| format!("cannot open token file {}", path.display()))?,
        None => {
            warn!("No token file configured, accepting every client");
            TokenStore::disabled()
        }
    };

    let server = InterceptorServer::new(config, tokens);
    let addr = server.start().await.context("failed to start interceptor server")?;
    info!(addr = %addr, "Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    server.stop().await.context("failed to stop interceptor server")?;
    Ok(())
}

fn tokens(command: TokenCommand) -> Result<()> {
    match command {
        TokenCommand::Create(args) => {
            let store = args.file.open()?;
            let (record, plaintext) = store.create(&args.name)?;
            println!("Created token {} ({})", record.id, record.name);
            println!("{plaintext}");
            println!("This value is shown once; store it now.");
        }
        TokenCommand::List(args) => {
            let store = args.open()?;
            let records = store.list()?;
            if records.is_empty() {
                println!("No tokens");
            }
            for record in records {
                println!("{}\t{}\t{}", record.id, record.created_at.to_rfc3339(), record.name);
            }
        }
        TokenCommand::Revoke(args) => {
            let store = args.file.open()?;
            if !store.revoke(&args.id)? {
                bail!("no token with id {}", args.id);
            }
            println!("Revoked token {}", args.id);
        }
    }
    Ok(())
}
