use super::WarpConsistencyConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Input of the `triplet_demo` tool.
#[derive(Debug, Deserialize)]
pub struct TripletDemoConfig {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub training: WarpConsistencyConfig,
    pub output: TripletDemoOutput,
}

#[derive(Debug, Deserialize)]
pub struct TripletDemoOutput {
    pub source_image: PathBuf,
    pub target_image: PathBuf,
    pub target_prime_image: PathBuf,
    pub correspondence_mask: PathBuf,
    #[serde(default)]
    pub zero_border_mask: Option<PathBuf>,
    pub summary_json: PathBuf,
}
