//! azure-session command line host.
//!
//! Runs one session start per invocation. A sign-in opens the browser; the
//! URL the browser is redirected to is then handed back with `callback`.

#![deny(clippy::all)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use azure_session::graph::{EndpointInput, EndpointSpec};
use azure_session::{
    hook, CacheLocation, Config, FileStore, GraphRequest, KeyValueStore, KeyringStore,
    MemorySecretStore, MemoryStore, OAuthDelegate, ReqwestTransport, SecretStore, Session,
    SessionError, SessionHooks,
};

#[derive(Parser)]
#[command(name = "azure-session", version, about = "Azure AD session for Microsoft Graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the browser to sign in
    SignIn,
    /// Complete a sign-in with the URL the browser was redirected to
    Callback { url: String },
    /// Print the session state as JSON
    Status,
    /// Acquire a token silently and print it
    Token,
    /// Call Graph; several endpoints are sent as one batch
    Graph {
        #[arg(required = true)]
        endpoints: Vec<String>,
        #[arg(long)]
        batch_url: Option<String>,
    },
    /// Fetch the configured endpoints into the session data
    InitGraph,
    /// Store an application value (JSON)
    SetData { key: String, value: String },
    /// Sign out and open the end-session page
    SignOut,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            eprintln!("\nPlease set the following environment variables:");
            eprintln!("  AZURE_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  AZURE_TENANT_ID=<your-tenant-id>");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging.level);

    match run(config, cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<SessionError>() {
                Some(session_error) => eprintln!("{}", session_error.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config, cli: Cli) -> Result<()> {
    info!("Starting {} v{}", config.app.name, env!("CARGO_PKG_VERSION"));

    let (store, secrets): (Arc<dyn KeyValueStore>, Arc<dyn SecretStore>) =
        match config.cache.cache_location {
            CacheLocation::File => (
                Arc::new(FileStore::open_default()?),
                Arc::new(KeyringStore::with_service(
                    config.app.bundle_identifier.as_str(),
                )),
            ),
            CacheLocation::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(MemorySecretStore::new()),
            ),
        };

    let delegate = Arc::new(OAuthDelegate::new(&config, store, secrets)?);
    if let Command::Callback { url } = &cli.command {
        delegate.set_redirect_url(url.as_str());
    }

    let transport = Arc::new(ReqwestTransport::new()?);
    let session = Session::new(config, logging_hooks(), delegate, transport).await?;

    let result = execute(&session, cli.command).await;
    session.shutdown();
    result
}

async fn execute(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::SignIn => {
            if session.is_authenticated() {
                println!("Already signed in");
            }
            session.sign_in().await?;
        }
        Command::Callback { .. } | Command::Status => print_json(&session.data())?,
        Command::Token => match session.acquire_token(None, 0).await {
            Some(response) => print_json(&response)?,
            None => anyhow::bail!("No token available; run `azure-session sign-in`"),
        },
        Command::Graph {
            mut endpoints,
            batch_url,
        } => {
            let request = if endpoints.len() == 1 {
                GraphRequest::Single(EndpointInput::Url(endpoints.remove(0)))
            } else {
                GraphRequest::Batch(
                    endpoints
                        .into_iter()
                        .map(|url| {
                            EndpointSpec {
                                url: Some(url),
                                ..EndpointSpec::default()
                            }
                            .into()
                        })
                        .collect(),
                )
            };
            let result = session
                .ms_graph(request, batch_url.as_deref())
                .await
                .map_err(SessionError::from)?;
            print_json(&result)?;
        }
        Command::InitGraph => {
            session.initial_graph_call().await;
            print_json(&session.data().graph)?;
        }
        Command::SetData { key, value } => {
            let value: Value =
                serde_json::from_str(&value).context("Value must be valid JSON")?;
            session.save_custom_data(key, value)?;
        }
        Command::SignOut => session.sign_out().await?,
    }
    Ok(())
}

/// Hooks that log each event.
fn logging_hooks() -> SessionHooks {
    SessionHooks {
        on_authentication: Some(hook(|_, arguments| async move {
            let event = Value::Array(arguments);
            info!("Authentication event: {}", event);
            Ok(())
        })),
        on_token: Some(hook(|session: Session, _| async move {
            if let Some(user) = session.data().user {
                info!("Token updated for {}", user.username);
            }
            Ok(())
        })),
        on_graph_response: Some(hook(|_, arguments| async move {
            let count = arguments
                .first()
                .and_then(Value::as_object)
                .map_or(0, |results| results.len());
            info!("Graph returned {} results", count);
            Ok(())
        })),
        before_sign_out: None,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
