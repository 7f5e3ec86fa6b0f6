// Output formatting for the engine

use anyhow::Result;
use clap::ValueEnum;
use recalc_dispatch::{BatchResult, BatchSummary};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Array of per-task results in submission order
    Json,
    /// Batch status and counts, with per-task results as details
    Summary,
}

impl OutputFormat {
    pub fn render(&self, result: &BatchResult) -> Result<String> {
        let rendered = match self {
            OutputFormat::Json => serde_json::to_string_pretty(result)?,
            OutputFormat::Summary => serde_json::to_string_pretty(&SummaryReport::new(result))?,
        };
        Ok(rendered)
    }
}

/// Summary document read by the calling service
#[derive(Debug, Serialize)]
pub struct SummaryReport<'a> {
    #[serde(flatten)]
    pub summary: BatchSummary,
    pub details: &'a BatchResult,
}

impl<'a> SummaryReport<'a> {
    pub fn new(result: &'a BatchResult) -> Self {
        Self {
            summary: result.summary(),
            details: result,
        }
    }
}
