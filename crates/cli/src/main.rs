//! Platform Resource Manager CLI
//!
//! A command-line tool for inspecting threshold stores and querying a
//! running prm-agent.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{status, thresholds};
use std::path::PathBuf;

/// Platform Resource Manager CLI
#[derive(Parser)]
#[command(name = "prmctl")]
#[command(author, version, about = "CLI for the Platform Resource Manager", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via PRMCTL_API_URL env var)
    #[arg(long, env = "PRMCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show regulator levels and the latest contention findings
    Status,

    /// Show agent component health and readiness
    Health,

    /// Inspect and populate threshold stores
    #[command(subcommand)]
    Thresholds(ThresholdsCommands),
}

#[derive(Subcommand)]
pub enum ThresholdsCommands {
    /// Show every bucket stored for a cpu model
    Show {
        /// Threshold store directory
        #[arg(long, env = "PRM_MODEL_STORE_DIR", default_value = "/var/lib/prm/thresholds")]
        store_dir: PathBuf,

        /// CPU model name as reported by the platform
        #[arg(long)]
        cpu_model: String,
    },

    /// Show the bucket a task would be checked against
    Lookup {
        #[arg(long, env = "PRM_MODEL_STORE_DIR", default_value = "/var/lib/prm/thresholds")]
        store_dir: PathBuf,

        #[arg(long)]
        cpu_model: String,

        /// Application key (application.version)
        #[arg(long)]
        application: String,

        /// Assigned cpus of the task
        #[arg(long)]
        vcpus: f64,

        /// Task utilization in percent of one cpu
        #[arg(long)]
        util: f64,
    },

    /// Preview the utilization buckets for a workload size
    Partition {
        /// Assigned cpus of the workload
        #[arg(long)]
        cpus: f64,

        /// Bucket width in percent of one cpu
        #[arg(long, default_value_t = prm_lib::threshold::DEFAULT_BUCKET_STEP)]
        step: f64,
    },

    /// Import a full threshold document into a store
    Import {
        #[arg(long, env = "PRM_MODEL_STORE_DIR", default_value = "/var/lib/prm/thresholds")]
        store_dir: PathBuf,

        /// Document keyed by cpu model, application and vcpu count
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let client = client::ApiClient::new(&cli.api_url)?;
            status::show_status(&client, cli.format).await?;
        }
        Commands::Health => {
            let client = client::ApiClient::new(&cli.api_url)?;
            status::show_health(&client, cli.format).await?;
        }
        Commands::Thresholds(cmd) => match cmd {
            ThresholdsCommands::Show {
                store_dir,
                cpu_model,
            } => {
                thresholds::show(&store_dir, &cpu_model, cli.format).await?;
            }
            ThresholdsCommands::Lookup {
                store_dir,
                cpu_model,
                application,
                vcpus,
                util,
            } => {
                thresholds::lookup(&store_dir, &cpu_model, &application, vcpus, util, cli.format)
                    .await?;
            }
            ThresholdsCommands::Partition { cpus, step } => {
                thresholds::partition(cpus, step, cli.format)?;
            }
            ThresholdsCommands::Import { store_dir, file } => {
                thresholds::import(&store_dir, &file).await?;
            }
        },
    }

    Ok(())
}
