//! gsm - command-line administration for GSM server instances.
//!
//! Talks to one instance's HTTP surface: `/health`, `/metrics` and the
//! basic-auth `/admin` routes.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use client::Credentials;
use commands::{config, health, modules, scheduler, vhosts};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";

#[derive(Parser)]
#[command(
    name = "gsm",
    version,
    about = "Administer GSM plugin runtime instances",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Instance URL
    #[arg(long, global = true, env = "GSM_API_URL")]
    api_url: Option<String>,

    /// Admin user
    #[arg(long, global = true, env = "GSM_ADMIN_USER")]
    user: Option<String>,

    /// Admin password
    #[arg(long, global = true, env = "GSM_ADMIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Module archive administration
    #[command(subcommand)]
    Modules(modules::ModuleCommands),

    /// Virtual host administration
    #[command(subcommand)]
    Vhosts(vhosts::VhostCommands),

    /// Batch scheduler control
    #[command(subcommand)]
    Scheduler(scheduler::SchedulerCommands),

    /// Check instance health
    Health(health::HealthArgs),

    /// Show process metrics
    Metrics(health::MetricsArgs),

    /// CLI configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

fn credentials(cli: &Cli) -> Option<Credentials> {
    let password = cli.password.clone()?;
    let user = cli
        .user
        .clone()
        .or_else(|| config::load_value(config::USER_KEY))
        .unwrap_or_else(|| "admin".to_string());
    Some(Credentials { user, password })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value(config::API_URL_KEY))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let client = client::ApiClient::new(&api_url, credentials(&cli))?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Modules(cmd) => modules::execute(cmd, &client, format).await,
        Commands::Vhosts(cmd) => vhosts::execute(cmd, &client, format).await,
        Commands::Scheduler(cmd) => scheduler::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Metrics(args) => health::execute_metrics(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
