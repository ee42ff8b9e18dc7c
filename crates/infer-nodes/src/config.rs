use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Deserialize;

/// Settings of one post-processing node, shared by all its workers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Confidence threshold applied during decode and rectification.
    pub threshold: f32,
    /// Upper bound on emitted ROIs per frame, zero keeps everything.
    pub max_roi: usize,
    /// Labels to keep; an empty list keeps every label.
    pub filter_labels: Vec<String>,
    /// Overlap ratio a box must reach against the filter region.
    pub filter_region_threshold: f32,
    /// Number of worker threads draining the output queue.
    pub workers: usize,
    /// Capacity of the bounded channel in front of the workers.
    pub queue_depth: usize,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

/// Optional telemetry knobs for tracing and runtime inspection.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            max_roi: 0,
            filter_labels: Vec::new(),
            filter_region_threshold: 0.5,
            workers: 1,
            queue_depth: 8,
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl NodeConfig {
    /// Parses a node configuration document and validates its values.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            bail!("threshold must lie in [0, 1], got {}", self.threshold);
        }
        if !(0.0..=1.0).contains(&self.filter_region_threshold) {
            bail!(
                "filter_region_threshold must lie in [0, 1], got {}",
                self.filter_region_threshold
            );
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.max_roi, 0);
        assert!(config.filter_labels.is_empty());
        assert_eq!(config.filter_region_threshold, 0.5);
        assert_eq!(config.workers, 1);
        assert!(config.telemetry.chrome_trace_path.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = NodeConfig::from_json(
            r#"{
                "threshold": 0.35,
                "max_roi": 12,
                "filter_labels": ["person", "car"],
                "workers": 3,
                "telemetry": { "chrome_trace_path": "/tmp/trace.json" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.threshold, 0.35);
        assert_eq!(config.max_roi, 12);
        assert_eq!(config.filter_labels, vec!["person", "car"]);
        assert_eq!(config.workers, 3);
        assert!(config.telemetry.chrome_trace_path.is_some());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        assert!(NodeConfig::from_json(r#"{ "threshold": 1.5 }"#).is_err());
        assert!(NodeConfig::from_json(r#"{ "threshold": -0.1 }"#).is_err());
    }

    #[test]
    fn zero_workers_are_rejected() {
        assert!(NodeConfig::from_json(r#"{ "workers": 0 }"#).is_err());
        assert!(NodeConfig::from_json(r#"{ "queue_depth": 0 }"#).is_err());
    }
}
