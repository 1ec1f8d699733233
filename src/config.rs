use crate::core::mosaic::MosaicParams;
use crate::core::normalize::ConvertParams;
use crate::core::rescale::RescaleParams;
use crate::pipeline::retry::RetryPolicy;
use crate::types::{RasterError, RasterResult};
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry settings in plain numbers, as they appear in the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_jitter_ms: 500,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Configuration of the pipeline and its stages.
///
/// Every field has a default, so an empty `<pipeline/>` document is valid:
///
/// ```xml
/// <pipeline>
///   <storage_root>/var/lib/rasterflow/runs</storage_root>
///   <stage_timeout_secs>300</stage_timeout_secs>
///   <retry>
///     <max_attempts>8</max_attempts>
///     <base_delay_ms>1000</base_delay_ms>
///   </retry>
///   <rescale>
///     <scale_factor>0.5</scale_factor>
///     <resampling>nearest</resampling>
///   </rescale>
/// </pipeline>
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename = "pipeline")]
pub struct PipelineConfig {
    /// Root of the durable run storage
    pub storage_root: PathBuf,
    /// Upper bound on one stage attempt
    pub stage_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Worker threads per stage
    pub concurrency: usize,
    /// Keep the outputs of intermediate stages after the next stage completes
    pub retain_intermediates: bool,
    pub convert: ConvertParams,
    pub rescale: RescaleParams,
    pub mosaic: MosaicParams,
    /// Namespace MOSDAC mosaics are published under
    pub publish_namespace: String,
    /// Namespace rescaled FAPAR rasters are published under
    pub fapar_namespace: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("runs"),
            stage_timeout_secs: 300,
            retry: RetryConfig::default(),
            concurrency: available_parallelism(),
            retain_intermediates: true,
            convert: ConvertParams::default(),
            rescale: RescaleParams::default(),
            mosaic: MosaicParams::default(),
            publish_namespace: "mosdac-par".to_string(),
            fapar_namespace: "fapar".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate an XML configuration document
    pub fn from_xml_str(xml: &str) -> RasterResult<Self> {
        let config: Self =
            from_str(xml).map_err(|e| RasterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> RasterResult<Self> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path)
            .map_err(|e| RasterError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        log::info!("Loaded pipeline configuration from {}", path.display());
        Self::from_xml_str(&xml)
    }

    pub fn validate(&self) -> RasterResult<()> {
        let s = self.rescale.scale_factor;
        if !s.is_finite() || s <= 0.0 {
            return Err(RasterError::Config(format!("scale_factor must be positive, got {}", s)));
        }
        if self.concurrency == 0 {
            return Err(RasterError::Config("concurrency must be at least 1".to_string()));
        }
        if self.stage_timeout_secs == 0 {
            return Err(RasterError::Config("stage_timeout_secs must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RasterError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(RasterError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}
