//! Health and metrics commands.
//!
//! `health` queries `/health`; `metrics` prints the `base` section of
//! `/metrics` plus the request-count windows.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include component checks
    #[arg(short, long)]
    detailed: bool,
}

#[derive(Args)]
pub struct MetricsArgs {
    /// Print the whole document instead of a summary
    #[arg(long)]
    full: bool,
}

fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("?")
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = str_field(&health, "status");

            output::print_header("Instance Health");
            println!("  {}", output::status_colored(status));
            output::print_detail("API URL", client.base_url());
            output::print_detail("Version", str_field(&health, "version"));
            if let Some(uptime) = health.get("uptime_secs").and_then(|v| v.as_u64()) {
                output::print_detail("Uptime", &format!("{}s", uptime));
            }

            if args.detailed {
                if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
                    output::print_header("Components");
                    for comp in components {
                        let mut line = output::status_colored(str_field(comp, "status")).to_string();
                        if let Some(message) = comp.get("message").and_then(|v| v.as_str()) {
                            line = format!("{} ({})", line, message);
                        }
                        if let Some(error) = comp.get("error").and_then(|v| v.as_str()) {
                            line = format!("{} error: {}", line, error);
                        }
                        output::print_detail(str_field(comp, "name"), &line);
                    }
                }
            }

            if status != "healthy" {
                anyhow::bail!("instance status: {}", status);
            }
        }
        _ => output::print_item(&health, format),
    }

    Ok(())
}

pub async fn execute_metrics(args: MetricsArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let document: serde_json::Value = client.get_raw("/metrics").await?;

    if args.full || format != OutputFormat::Table {
        output::print_item(&document, format);
        return Ok(());
    }

    let base = &document["base"];
    output::print_header("Process");
    output::print_detail("Uptime", &format!("{}s", base["uptimeSecs"]));
    output::print_detail("Resident memory", &format!("{} bytes", base["memory"]["residentBytes"]));
    output::print_detail("Available memory", &format!("{} bytes", base["memory"]["availableBytes"]));
    output::print_detail("Processors", &base["cpu"]["availableProcessors"].to_string());
    output::print_detail("Load average", &base["cpu"]["loadAverage"].to_string());
    output::print_detail(
        "Dispatches",
        &format!(
            "{} / {}",
            base["threads"]["activeDispatches"], base["threads"]["maxDispatches"]
        ),
    );
    output::print_detail(
        "Modules",
        &format!("{} installed, {} live", base["modules"]["installed"], base["modules"]["live"]),
    );

    if let Some(windows) = document["monitoring"].as_array() {
        output::print_header("Request Windows");
        for window in windows {
            output::print_detail(
                str_field(window, "key"),
                &format!(
                    "http {} ({} ms), event {} ({} ms)",
                    window["httpRequestCount"],
                    window["httpTotalTimeMs"],
                    window["eventRequestCount"],
                    window["eventTotalTimeMs"]
                ),
            );
        }
    }

    Ok(())
}
