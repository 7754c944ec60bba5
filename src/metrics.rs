use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Destination for run-level metric reports: the seam in front of whatever
/// experiment-tracking backend a deployment wires up.
pub trait MetricsSink {
    /// Ships one report. Each call is a separate record; nothing is batched
    /// or retried.
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) -> Result<()>;

    fn log_scalar(&mut self, key: &str, value: f64) -> Result<()> {
        let mut single = BTreeMap::new();
        single.insert(key.to_string(), value);
        self.log_metrics(&single)
    }
}

/// Appends one JSON object per report to a local run log.
pub struct JsonlMetricsSink {
    path: PathBuf,
}

impl JsonlMetricsSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(metrics)?)
            .with_context(|| format!("cannot append to {}", self.path.display()))?;
        tracing::debug!("logged {} metric(s) to {}", metrics.len(), self.path.display());
        Ok(())
    }
}
