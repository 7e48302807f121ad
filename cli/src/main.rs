use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cutroom_session::config::ConfigError;
use cutroom_session::{IdentityError, SessionConfig, SessionManager, SessionState};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("identity service error: {0}")]
    Identity(#[from] IdentityError),
    #[error("missing password; pass --password or set CUTROOM_PASSWORD")]
    MissingPassword,
    #[error("timed out waiting for session to settle")]
    Timeout,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "cutroom-session", about = "Inspect and manage the Cutroom login session")]
struct Cli {
    #[arg(long, env = "CUTROOM_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "CUTROOM_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile with the backend and print the settled session.
    Status,
    /// Print the cached identity if the stored credential is still valid,
    /// without contacting the backend.
    Whoami,
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CUTROOM_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Logout,
    /// Print every state change until reconciliation settles.
    Watch {
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(SessionConfig::from_env()?, cli.base_url.as_deref(), cli.state_dir)?;
    let session = SessionManager::from_config(&config)?;

    match cli.command {
        Command::Status => run_status(&session).await,
        Command::Whoami => run_whoami(&session),
        Command::Login { email, password } => run_login(&session, &email, password).await,
        Command::Logout => run_logout(&session).await,
        Command::Watch { timeout_secs } => run_watch(&session, Duration::from_secs(timeout_secs)).await,
    }
}

fn resolve_config(
    config: SessionConfig,
    base_url: Option<&str>,
    state_dir: Option<PathBuf>,
) -> Result<SessionConfig, CliError> {
    let config = match base_url {
        Some(url) => config.with_api_base_url(url)?,
        None => config,
    };
    Ok(match state_dir {
        Some(dir) => config.with_state_dir(dir),
        None => config,
    })
}

async fn run_status(session: &SessionManager) -> Result<(), CliError> {
    session.initialize().await;
    print_json(&render_state(&session.snapshot()))
}

/// Offline check: the cached identity is printed only while the stored
/// credential is still valid. The backend is not asked to confirm it.
fn run_whoami(session: &SessionManager) -> Result<(), CliError> {
    if !session.has_valid_credential() {
        return Err(CliError::NotLoggedIn);
    }
    let state = session.snapshot();
    let identity = state.identity().ok_or(CliError::NotLoggedIn)?;
    println!("{}", identity.display_name());
    Ok(())
}

async fn run_login(session: &SessionManager, email: &str, password: Option<String>) -> Result<(), CliError> {
    let password = password.filter(|p| !p.is_empty()).ok_or(CliError::MissingPassword)?;
    let user = session.login(email, &password).await?;
    print_json(&json!({ "logged_in": true, "identity": user }))
}

async fn run_logout(session: &SessionManager) -> Result<(), CliError> {
    session.logout().await;
    print_json(&render_state(&session.snapshot()))
}

async fn run_watch(session: &SessionManager, timeout: Duration) -> Result<(), CliError> {
    let mut rx = session.subscribe();
    let initial = rx.borrow_and_update().clone();
    print_json(&render_state(&initial))?;

    tokio::time::timeout(timeout, print_until_settled(session, rx))
        .await
        .map_err(|_| CliError::Timeout)?
}

/// Drive `initialize` while printing each published state, including the
/// optimistic one that precedes the backend answer.
async fn print_until_settled(session: &SessionManager, mut rx: watch::Receiver<SessionState>) -> Result<(), CliError> {
    let reconcile = session.initialize();
    tokio::pin!(reconcile);
    loop {
        tokio::select! {
            () = &mut reconcile => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                print_json(&render_state(&state))?;
            }
        }
    }
    if rx.has_changed().unwrap_or(false) {
        let state = rx.borrow_and_update().clone();
        print_json(&render_state(&state))?;
    }
    Ok(())
}

fn render_state(state: &SessionState) -> Value {
    json!({
        "phase": state.phase(),
        "authenticated": state.authenticated(),
        "loading": state.loading(),
        "identity": state.identity(),
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
