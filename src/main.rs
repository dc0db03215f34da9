use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use ledgerlink::{ApiClient, ClientConfig, Error};
use serde_json::{Value, json};

/// ledgerlink - command line client for the ledgerlink API
///
/// Sends requests through the same retrying, token-refreshing layer the
/// application uses. Sessions are stored under the session directory.
///
/// Examples:
///   ledgerlink login --email me@example.com
///   ledgerlink get /budgets
///   ledgerlink post /transactions --body '{"amount": 12.5}'
#[derive(Parser, Debug)]
#[command(author, version = env!("LEDGERLINK_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API base URL
    #[arg(
        long = "base-url",
        env = "LEDGERLINK_BASE_URL",
        value_name = "URL",
        default_value = "http://localhost:3000/api",
        global = true
    )]
    pub base_url: String,

    /// Retries after the first attempt for transient failures
    #[arg(
        long = "max-retries",
        env = "LEDGERLINK_MAX_RETRIES",
        value_name = "N",
        global = true
    )]
    pub max_retries: Option<usize>,

    /// Directory holding the stored session
    #[arg(
        long = "session-dir",
        env = "LEDGERLINK_SESSION_DIR",
        value_name = "PATH",
        global = true
    )]
    pub session_dir: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// GET a resource
    Get(PathArgs),

    /// POST to a resource
    Post(BodyArgs),

    /// PUT a resource
    Put(BodyArgs),

    /// DELETE a resource
    Delete(PathArgs),

    /// Log in and store the session
    Login(LoginArgs),

    /// Forget the stored session
    Logout,

    /// Show the stored session
    Session,
}

#[derive(clap::Args, Debug)]
pub struct PathArgs {
    /// Request path relative to the base URL, e.g. /budgets
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(clap::Args, Debug)]
pub struct BodyArgs {
    #[arg(value_name = "PATH")]
    pub path: String,

    /// JSON request body
    #[arg(long, short = 'b', value_name = "JSON")]
    pub body: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct LoginArgs {
    #[arg(long)]
    pub email: String,

    #[arg(long, env = "LEDGERLINK_PASSWORD", hide_env_values = true)]
    pub password: String,
}

impl Cli {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.base_url);
        if let Some(max_retries) = self.max_retries {
            config = config.with_max_retries(max_retries);
        }
        if let Some(dir) = &self.session_dir {
            config = config.with_session_dir(dir);
        }
        config
    }
}

fn parse_body(body: Option<&str>) -> Result<Option<Value>> {
    body.map(|raw| serde_json::from_str(raw).context("--body is not valid JSON"))
        .transpose()
}

/// Turns a request error into a user-facing message with secrets redacted.
fn report(error: Error) -> anyhow::Error {
    match &error {
        Error::Api(api) => {
            let mut message = format!("{} error ({}): {}", api.kind(), api.status(), api.user_message());
            if let Some(details) = api.details() {
                for (field, msg) in details {
                    message.push_str(&format!("\n  {}: {}", field, ledgerlink::redact_secrets(msg)));
                }
            }
            anyhow!(message)
        }
        other => anyhow!(ledgerlink::redact_secrets(&other.to_string())),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let client = ApiClient::from_config(&cli.config())?;

    match cli.command {
        Commands::Get(args) => print_json(&client.get(&args.path).await.map_err(report)?)?,
        Commands::Delete(args) => print_json(&client.delete(&args.path).await.map_err(report)?)?,
        Commands::Post(args) => {
            let body = parse_body(args.body.as_deref())?;
            print_json(&client.post(&args.path, body).await.map_err(report)?)?
        }
        Commands::Put(args) => {
            let body = parse_body(args.body.as_deref())?;
            print_json(&client.put(&args.path, body).await.map_err(report)?)?
        }
        Commands::Login(args) => {
            let session = client
                .login(&json!({ "email": args.email, "password": args.password }))
                .await
                .map_err(report)?;
            println!("Logged in ({})", session.masked_token());
            if !session.onboarding_completed {
                println!("Onboarding is not completed yet.");
            }
        }
        Commands::Logout => {
            client.logout().map_err(report)?;
            println!("Logged out");
        }
        Commands::Session => match client.auth().session().map_err(report)? {
            Some(session) => {
                println!("Token: {}", session.masked_token());
                if let Some(expires_at) = session.expires_at {
                    let state = if session.is_expired() { "expired" } else { "valid" };
                    println!("Expires at: {} ({})", expires_at, state);
                }
                println!("Refresh token: {}", session.refresh_token.is_some());
                println!("Onboarding completed: {}", session.onboarding_completed);
            }
            None => println!("Not logged in"),
        },
    }
    Ok(())
}
