//! falowen-session - command line host for the Falowen session controller.
//!
//! Stands in for the app shell: it signs in, restores and refreshes the
//! stored session, and issues authorized requests against the backend.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use falowen_session_core::auth::{
    AlwaysAvailable, EncryptedFileCredentialStore, KeyringAvailability, KeyringCredentialStore,
    MemoryCredentialStore,
};
use falowen_session_core::{
    Clock, CookieBridge, CredentialStore, HttpAuthClient, SessionConfig, SessionController,
    SessionPhase, SessionState, StorageGate, StoreBackend, SystemClock, WebCookie,
};

/// Passphrase for the encrypted file store; prompted for when unset
const PASSPHRASE_ENV: &str = "FALOWEN_STORE_PASSPHRASE";

#[derive(Parser)]
#[command(name = "falowen-session", version, about = "Falowen session bootstrap and token refresh")]
struct Cli {
    /// Also write logs to a daily rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Account key to operate on (overrides config and FALOWEN_ACCOUNT)
    #[arg(long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with identifier and password
    Login {
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Sign out and remove the stored session
    Logout,
    /// Show the stored session without contacting the server
    Status,
    /// Restore the stored session, refreshing it if it is about to expire
    Bootstrap,
    /// Keep the session alive; press Enter to simulate returning to foreground
    Watch,
    /// Send an authorized GET request
    Request { url: String },
    /// Import web view cookies (JSON array) and exchange them for a session
    Adopt {
        cookies: PathBuf,
        /// Navigation URL reported by the web view (defaults to the completion page)
        #[arg(long)]
        at: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Persist it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "falowen-session.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn build_store(config: &SessionConfig) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.store_backend {
        StoreBackend::Keyring => Arc::new(
            KeyringCredentialStore::new(&config.keyring_service, &config.account)
                .context("Failed to open keychain entry")?,
        ),
        StoreBackend::EncryptedFile => {
            let passphrase = match std::env::var(PASSPHRASE_ENV) {
                Ok(passphrase) => passphrase,
                Err(_) => rpassword::prompt_password("Store passphrase: ")?,
            };
            Arc::new(EncryptedFileCredentialStore::new(config.credentials_path()?, passphrase))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory credential store; the session ends with this process");
            Arc::new(MemoryCredentialStore::new())
        }
    };
    Ok(store)
}

fn build_gate(config: &SessionConfig) -> StorageGate {
    match config.store_backend {
        StoreBackend::Keyring => StorageGate::new(
            Arc::new(KeyringAvailability::new(&config.keyring_service, &config.account)),
            config.storage_poll_interval(),
        ),
        _ => StorageGate::new(Arc::new(AlwaysAvailable), config.storage_poll_interval()),
    }
}

fn prompt_identifier() -> Result<String> {
    print!("Email or username: ");
    io::stdout().flush()?;

    let mut identifier = String::new();
    io::stdin().read_line(&mut identifier)?;
    Ok(identifier.trim().to_string())
}

fn print_state(state: &SessionState) {
    let phase = match &state.phase {
        SessionPhase::Idle => "idle".to_string(),
        SessionPhase::Bootstrapping => "bootstrapping".to_string(),
        SessionPhase::Authenticated { needs_refresh } => {
            format!("authenticated (needs refresh: {})", needs_refresh)
        }
        SessionPhase::LoggedOut => "logged out".to_string(),
    };
    println!(
        "phase: {}, authenticated: {}, needs login: {}",
        phase, state.authenticated, state.needs_login
    );
    if let Some(message) = &state.error_message {
        println!("  {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let mut config = SessionConfig::load()?;
    config.apply_env()?;
    if let Some(account) = cli.account {
        config.account = account;
    }
    info!(base_url = %config.base_url, account = %config.account, "falowen-session starting");

    if let Command::Config { save } = cli.command {
        if save {
            config.save()?;
        }
        println!("{:#?}", config);
        return Ok(());
    }

    // one clock for both the client's expiry math and the controller's checks
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let api = Arc::new(HttpAuthClient::new(&config)?.with_clock(clock.clone()));
    let store = build_store(&config)?;
    let controller = SessionController::builder(store.clone(), api.clone())
        .clock(clock.clone())
        .policy(config.refresh_policy())
        .gate(build_gate(&config))
        .http_client(api.http_client())
        .build();

    match cli.command {
        Command::Login { identifier } => {
            let identifier = match identifier {
                Some(identifier) => identifier,
                None => prompt_identifier()?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            controller.login(&identifier, &password).await?;
            println!("Login successful!");
        }
        Command::Logout => {
            controller.logout().await?;
            println!("Logged out.");
        }
        Command::Status => match store.read()? {
            Some(pair) => {
                let now = clock.now();
                println!("Stored session for account '{}'", config.account);
                println!("  access token expires: {}", pair.expiry);
                if pair.is_expired(now) {
                    println!("  access token expired (will refresh on next bootstrap)");
                } else {
                    let remaining = pair.time_until_expiry(now);
                    println!("  expires in: {} min", remaining.num_minutes());
                }
            }
            None => println!("No stored session for account '{}'", config.account),
        },
        Command::Bootstrap => {
            controller.bootstrap().await;
            controller.wait_for_pending_retry().await;
            print_state(&controller.state());
        }
        Command::Watch => watch(&controller).await?,
        Command::Request { url } => {
            controller.bootstrap().await;
            let response = controller
                .authorized_request(Method::GET, &url)?
                .send()
                .await
                .with_context(|| format!("Request to {} failed", url))?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            eprintln!("{}", status);
            println!("{}", body);
        }
        Command::Adopt { cookies, at } => {
            let contents = std::fs::read_to_string(&cookies)
                .with_context(|| format!("Failed to read {}", cookies.display()))?;
            let web_cookies: Vec<WebCookie> =
                serde_json::from_str(&contents).context("Failed to parse cookie file")?;

            let bridge = CookieBridge::from_config(&config, api.cookie_jar())?;
            let at = match at {
                Some(at) => Url::parse(&at).with_context(|| format!("Invalid URL: {}", at))?,
                None => Url::parse(&config.base_url)?.join(&config.auth_completion_path)?,
            };
            let copied = bridge.on_navigation(&at, &web_cookies);
            if copied == 0 {
                anyhow::bail!("{} is not the login completion page; no cookies copied", at);
            }
            controller.adopt_cookie_session().await?;
            println!("Adopted web session ({} cookies).", copied);
        }
        Command::Config { .. } => {}
    }

    Ok(())
}

/// Bootstrap, keep refreshing, and re-bootstrap on every line from stdin
/// until Ctrl-C.
async fn watch(controller: &SessionController) -> Result<()> {
    let mut states = controller.subscribe();
    controller.bootstrap().await;
    controller.start_periodic_refresh();
    print_state(&states.borrow_and_update());
    println!("Watching session. Press Enter to re-bootstrap, Ctrl-C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state(&states.borrow_and_update());
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    info!("Foreground trigger, bootstrapping");
                    let controller = controller.clone();
                    tokio::spawn(async move {
                        controller.bootstrap().await;
                    });
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.shutdown();
    Ok(())
}
