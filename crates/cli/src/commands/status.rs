//! Agent status commands

use anyhow::Result;
use colored::Colorize;
use prm_lib::health::{ComponentStatus, HealthResponse};
use prm_lib::models::ContentionAnomaly;
use prm_lib::regulator::RegulatorStatus;
use serde_json::json;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_level, format_util, print_info, print_json, print_table, OutputFormat,
};

/// Row for the findings table
#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Contended")]
    contended: String,
    #[tabled(rename = "Contender")]
    contender: String,
    #[tabled(rename = "Evidence")]
    evidence: String,
}

impl From<&ContentionAnomaly> for AnomalyRow {
    fn from(anomaly: &ContentionAnomaly) -> Self {
        Self {
            resource: anomaly.resource.to_string(),
            contended: anomaly.contended_task_id.clone(),
            contender: anomaly
                .contending_task_ids
                .first()
                .cloned()
                .unwrap_or_else(|| "-".to_string()),
            evidence: anomaly
                .metrics
                .iter()
                .map(|m| format!("{}={:.2}", m.name, m.value))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Row for the component health table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn status_label(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

fn component_rows(health: &HealthResponse) -> Vec<ComponentRow> {
    let mut rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            name: name.clone(),
            status: color_status(status_label(component.status)),
            message: component.message.clone().unwrap_or_default(),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

fn print_state(state: &RegulatorStatus) {
    println!("{}", "Regulator State".bold());
    println!("{}", "=".repeat(50));
    println!("CPU model:        {}", state.cpu_model.cyan());
    println!("Cycles:           {}", state.cycles);
    println!("Last snapshot:    {}", format_timestamp(state.last_timestamp));
    println!("Tasks tracked:    {}", state.tasks_tracked);
    println!("LC util max:      {}", format_util(state.lc_util_max));
    println!();
    println!("{}", "Levels".bold());
    println!("{}", "-".repeat(50));
    println!("CPU cycles:       {}", format_level(state.levels.cpu_cycles));
    println!("LLC:              {}", format_level(state.levels.llc));
    println!("Memory bandwidth: {}", format_level(state.levels.memory_bw));
    println!();

    if state.last_anomalies.is_empty() {
        print_info("No contention in the last aggregation period");
    } else {
        println!("{}", "Contention".bold());
        let rows: Vec<AnomalyRow> = state.last_anomalies.iter().map(AnomalyRow::from).collect();
        print_table(&rows);
    }
}

/// Show regulator levels and the latest findings
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let state = client.get_state().await?;
    match format {
        OutputFormat::Json => print_json(&state)?,
        OutputFormat::Table => print_state(&state),
    }
    Ok(())
}

/// Show component health and readiness
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.get_health().await?;
    let readiness = client.get_readiness().await?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "health": health,
            "readiness": readiness,
        }))?,
        OutputFormat::Table => {
            println!(
                "Overall: {}",
                color_status(status_label(health.status)).bold()
            );
            if readiness.ready {
                println!("Ready:   {}", color_status("ready"));
            } else {
                println!(
                    "Ready:   {} ({})",
                    color_status("not ready"),
                    readiness.reason.as_deref().unwrap_or("unknown")
                );
            }
            print_table(&component_rows(&health));
        }
    }
    Ok(())
}

fn format_timestamp(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    match chrono::DateTime::from_timestamp(secs, nanos) {
        Some(dt) if ts > 0.0 => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "-".to_string(),
    }
}
