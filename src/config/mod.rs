//! JSON configuration of training runs and of the demo tools.
mod training;
mod triplet_demo;

pub use training::{LossWeights, WarpConsistencyConfig};
pub use triplet_demo::{TripletDemoConfig, TripletDemoOutput};

use crate::error::Result;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Read and parse a JSON configuration file.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}
