//! Threshold store inspection commands

use anyhow::{Context, Result};
use colored::Colorize;
use prm_lib::threshold::{
    partition_utilization, select_bucket, vcpu_key, LocalModelStore, ModelStore, ThresholdModel,
};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    format_opt, format_util, print_info, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for the bucket table
#[derive(Debug, Tabled, Serialize)]
struct BucketRow {
    #[tabled(rename = "Application")]
    application: String,
    #[tabled(rename = "vCPUs")]
    vcpus: String,
    #[tabled(rename = "Util")]
    util: String,
    #[tabled(rename = "CPI")]
    cpi: String,
    #[tabled(rename = "MPKI")]
    mpki: String,
    #[tabled(rename = "MSPKI")]
    mspki: String,
    #[tabled(rename = "MB")]
    mb: String,
}

/// Row for the utilization partition table
#[derive(Debug, Tabled, Serialize)]
struct PartitionRow {
    #[tabled(rename = "Start")]
    start: f64,
    #[tabled(rename = "End")]
    end: f64,
}

fn bucket_rows(model: &ThresholdModel, cpu_model: &str) -> Vec<BucketRow> {
    let mut rows = Vec::new();
    let Some(workloads) = model.workloads(cpu_model) else {
        return rows;
    };
    for (application, by_vcpus) in workloads {
        for (vcpus, thresholds) in by_vcpus {
            for bucket in &thresholds.metrics_threshold {
                rows.push(BucketRow {
                    application: application.clone(),
                    vcpus: vcpus.clone(),
                    util: format!(
                        "{}-{}",
                        format_util(bucket.util_start),
                        format_util(bucket.util_end)
                    ),
                    cpi: format!("{:.2}", bucket.cpi),
                    mpki: format!("{:.2}", bucket.mpki),
                    mspki: format_opt(bucket.mspki),
                    mb: format!("{:.2}", bucket.mb),
                });
            }
        }
    }
    rows
}

fn partition_rows(cpus: f64, step: f64) -> Vec<PartitionRow> {
    partition_utilization(cpus, step)
        .into_iter()
        .map(|start| PartitionRow {
            start,
            end: start + step,
        })
        .collect()
}

async fn load_model(store_dir: &Path, cpu_model: &str) -> Result<Option<ThresholdModel>> {
    let store = LocalModelStore::new(store_dir);
    let Some(record) = store
        .get(cpu_model)
        .await
        .with_context(|| format!("Failed to read threshold store {}", store_dir.display()))?
    else {
        return Ok(None);
    };
    let model = ThresholdModel::from_cpu_model_document(cpu_model, &record)
        .context("Invalid threshold record")?;
    Ok(Some(model))
}

/// Show every bucket stored for a cpu model
pub async fn show(store_dir: &Path, cpu_model: &str, format: OutputFormat) -> Result<()> {
    let Some(model) = load_model(store_dir, cpu_model).await? else {
        print_warning(&format!("No thresholds stored for '{}'", cpu_model));
        return Ok(());
    };

    match format {
        OutputFormat::Json => print_json(&model.workloads(cpu_model))?,
        OutputFormat::Table => {
            println!("{} {}", "Thresholds for".bold(), cpu_model.cyan());
            print_table(&bucket_rows(&model, cpu_model));

            if let Some(workloads) = model.workloads(cpu_model) {
                for (application, by_vcpus) in workloads {
                    for (vcpus, thresholds) in by_vcpus {
                        if let Some(tdp) = &thresholds.tdp_threshold {
                            print_info(&format!(
                                "{} ({} vCPUs): TDP bar {:.3} above {}",
                                application,
                                vcpus,
                                tdp.bar,
                                format_util(tdp.util)
                            ));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Show the bucket a task at `util` would be checked against
pub async fn lookup(
    store_dir: &Path,
    cpu_model: &str,
    application: &str,
    vcpus: f64,
    util: f64,
    format: OutputFormat,
) -> Result<()> {
    let Some(model) = load_model(store_dir, cpu_model).await? else {
        print_warning(&format!("No thresholds stored for '{}'", cpu_model));
        return Ok(());
    };

    let bucket = model
        .metrics_thresholds(cpu_model, vcpus, application)
        .and_then(|buckets| select_bucket(buckets, util));
    let Some(bucket) = bucket else {
        print_warning(&format!(
            "No bucket for {} with {} vCPUs at {}",
            application,
            vcpu_key(vcpus),
            format_util(util)
        ));
        return Ok(());
    };

    match format {
        OutputFormat::Json => print_json(bucket)?,
        OutputFormat::Table => {
            println!(
                "{} {} ({} vCPUs) at {}",
                "Bucket for".bold(),
                application.cyan(),
                vcpu_key(vcpus),
                format_util(util)
            );
            println!("Range:   {}-{}", format_util(bucket.util_start), format_util(bucket.util_end));
            println!("CPI:     {:.3}", bucket.cpi);
            println!("MPKI:    {:.3}", bucket.mpki);
            println!("MSPKI:   {}", format_opt(bucket.mspki));
            println!("L2SPKI:  {}", format_opt(bucket.l2spki));
            println!("MB:      {:.3}", bucket.mb);
            if let Some(tdp) = model.tdp_threshold(cpu_model, vcpus, application) {
                println!("TDP bar: {:.3} above {}", tdp.bar, format_util(tdp.util));
            }
        }
    }
    Ok(())
}

/// Preview the utilization buckets used for a workload size
pub fn partition(cpus: f64, step: f64, format: OutputFormat) -> Result<()> {
    let rows = partition_rows(cpus, step);
    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => print_table(&rows),
    }
    Ok(())
}

/// Split a full threshold document into per cpu model store records
pub async fn import(store_dir: &Path, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let model = ThresholdModel::from_json(&content).context("Invalid threshold document")?;

    tokio::fs::create_dir_all(store_dir)
        .await
        .with_context(|| format!("Failed to create {}", store_dir.display()))?;
    let store = LocalModelStore::new(store_dir);

    let mut imported = 0;
    for cpu_model in model.cpu_models() {
        let Some(workloads) = model.workloads(cpu_model) else {
            continue;
        };
        let record = serde_json::to_string(workloads)?;
        store
            .set(cpu_model, &record)
            .await
            .with_context(|| format!("Failed to store thresholds for {}", cpu_model))?;
        imported += 1;
    }

    print_success(&format!(
        "Imported {} cpu model(s) into {}",
        imported,
        store_dir.display()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOCUMENT: &str = r#"{
        "Intel(R) Xeon(R) Gold 6140": {
            "redis.v1": {
                "4": {
                    "metrics_threshold": [
                        {"util_start": 200, "util_end": 250, "cpi": 1.5, "mpki": 5.0, "mb": 900.0, "mspki": 100.0},
                        {"util_start": 250, "util_end": 300, "cpi": 1.6, "mpki": 5.5, "mb": 950.0}
                    ],
                    "tdp_threshold": {"util": 380.0, "mean": 2.4, "std": 0.1, "bar": 2.1}
                }
            }
        }
    }"#;

    #[test]
    fn test_partition_rows_cover_bucket_range() {
        let rows = partition_rows(2.0, 50.0);
        let starts: Vec<f64> = rows.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![100.0, 150.0, 200.0, 250.0]);
        assert_eq!(rows[3].end, 300.0);
    }

    #[test]
    fn test_bucket_rows_flatten_workloads() {
        let model = ThresholdModel::from_json(DOCUMENT).unwrap();
        let rows = bucket_rows(&model, "Intel(R) Xeon(R) Gold 6140");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].application, "redis.v1");
        assert_eq!(rows[0].vcpus, "4");
        assert_eq!(rows[0].util, "200%-250%");
        assert_eq!(rows[0].mspki, "100.00");
        assert_eq!(rows[1].mspki, "-");
    }

    #[tokio::test]
    async fn test_import_then_load() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("thresholds.json");
        std::fs::write(&doc, DOCUMENT).unwrap();
        let store_dir = dir.path().join("store");

        import(&store_dir, &doc).await.unwrap();

        let model = load_model(&store_dir, "Intel(R) Xeon(R) Gold 6140")
            .await
            .unwrap()
            .unwrap();
        let buckets = model
            .metrics_thresholds("Intel(R) Xeon(R) Gold 6140", 4.0, "redis.v1")
            .unwrap();
        assert_eq!(select_bucket(buckets, 260.0).unwrap().cpi, 1.6);
        assert!(model
            .tdp_threshold("Intel(R) Xeon(R) Gold 6140", 4.0, "redis.v1")
            .is_some());
    }

    #[tokio::test]
    async fn test_load_missing_model() {
        let dir = TempDir::new().unwrap();
        assert!(load_model(dir.path(), "unknown cpu").await.unwrap().is_none());
    }
}
