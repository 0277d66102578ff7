//! Manual scheduler control.

use anyhow::Result;
use clap::Subcommand;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum SchedulerCommands {
    /// Run the batch trigger protocol once on the target instance
    Tick,
}

pub async fn execute(cmd: SchedulerCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        SchedulerCommands::Tick => {
            let outcome: serde_json::Value = client.post("/admin/scheduler/tick").await?;
            match format {
                OutputFormat::Table => {
                    let kind = outcome.get("outcome").and_then(|v| v.as_str()).unwrap_or("unknown");
                    match kind {
                        "dispatched" => {
                            let modules = outcome.get("modules").and_then(|v| v.as_u64()).unwrap_or(0);
                            let failures = outcome.get("failures").and_then(|v| v.as_u64()).unwrap_or(0);
                            output::print_success(&format!(
                                "Dispatched {} batch module(s), {} failure(s)",
                                modules, failures
                            ));
                        }
                        "busy" => output::print_info("A batch pass is already running"),
                        "tooEarly" => output::print_info("Instance is still inside its startup delay"),
                        "withinWindow" => output::print_info("Location batch ran recently, nothing dispatched"),
                        other => output::print_warning(&format!("Unexpected outcome: {}", other)),
                    }
                }
                _ => output::print_item(&outcome, format),
            }
        }
    }
    Ok(())
}
