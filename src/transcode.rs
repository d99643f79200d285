//! Media compression contract
//!
//! The actual transform is opaque (an external encoder); this module decides what to do
//! with its output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressOptions {
    /// Outputs that do not shrink the input by at least this factor are discarded
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,

    /// Encoder specific settings, passed through untouched
    #[serde(default)]
    pub encoder_args: Vec<String>,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            min_ratio: default_min_ratio(),
            encoder_args: vec![],
        }
    }
}

fn default_min_ratio() -> f64 {
    1.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub success: bool,
    pub input_size: usize,
    pub output_size: usize,
    pub compression_ratio: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: &[u8],
        name: &str,
        options: &CompressOptions,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Run `transcoder` over `input` and keep the result only if it is worth it.
///
/// Returns the bytes to store (`None` if the transform failed) and a report.
pub async fn compress(
    transcoder: &dyn Transcoder,
    input: Vec<u8>,
    name: &str,
    options: &CompressOptions,
) -> (Option<Vec<u8>>, CompressionResult) {
    let input_size = input.len();

    let output = match transcoder.transcode(&input, name, options).await {
        Ok(output) => output,
        Err(e) => {
            warn!("compressing {name} failed: {e:#}");
            return (
                None,
                CompressionResult {
                    success: false,
                    input_size,
                    output_size: 0,
                    compression_ratio: 0.0,
                    error: Some(format!("{e:#}")),
                },
            );
        }
    };

    let ratio = if output.is_empty() {
        0.0
    } else {
        input_size as f64 / output.len() as f64
    };

    if output.is_empty() || ratio < options.min_ratio {
        debug!("{name}: ratio {ratio:.2} below {:.2}, keeping original", options.min_ratio);
        return (
            Some(input),
            CompressionResult {
                success: true,
                input_size,
                output_size: input_size,
                compression_ratio: 1.0,
                error: None,
            },
        );
    }

    debug!("{name}: {input_size} -> {} bytes", output.len());
    let output_size = output.len();
    (
        Some(output),
        CompressionResult {
            success: true,
            input_size,
            output_size,
            compression_ratio: ratio,
            error: None,
        },
    )
}
