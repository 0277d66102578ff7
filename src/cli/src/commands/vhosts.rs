//! Virtual host administration.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum VhostCommands {
    /// List virtual host mappings
    List,

    /// Map a host name to a module path such as `/42/v1.0/shop`
    Set { host: String, path: String },

    /// Remove a host mapping
    Remove { host: String },
}

#[derive(Debug, Serialize, Tabled)]
struct VhostRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Path")]
    path: String,
}

#[derive(Serialize)]
struct VhostBody<'a> {
    path: &'a str,
}

pub async fn execute(cmd: VhostCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        VhostCommands::List => {
            let hosts: BTreeMap<String, String> = client.get("/admin/vhosts").await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<VhostRow> = hosts
                        .into_iter()
                        .map(|(host, path)| VhostRow { host, path })
                        .collect();
                    output::print_list(&rows, format);
                }
                _ => output::print_item(&hosts, format),
            }
        }

        VhostCommands::Set { host, path } => {
            client
                .put(&format!("/admin/vhosts/{}", host), &VhostBody { path: &path })
                .await?;
            output::print_success(&format!("{} -> {}", host, path));
        }

        VhostCommands::Remove { host } => {
            client.delete_empty(&format!("/admin/vhosts/{}", host)).await?;
            output::print_success(&format!("Removed {}", host));
        }
    }

    Ok(())
}
