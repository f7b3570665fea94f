//! Flow objectives: point-wise errors, their multi-scale weighting, the
//! warp-consistency objective and the balancing of the two training terms.
pub mod balance;
pub mod metrics;
pub mod multiscale;
pub mod pointwise;
pub mod wbipath;

use std::collections::BTreeMap;

/// Named scalar statistics of one evaluation.
pub type Stats = BTreeMap<String, f32>;

pub use balance::{Balanced, LossBalancer};
pub use metrics::{fbeta_score, real_epe, real_metrics, semantic_thresholds, RealMetrics, PCK_THRESHOLDS};
pub use multiscale::{GtResize, LevelMasks, MultiScaleLoss, MultiScaleOutput};
pub use pointwise::{LossValue, PointwiseLoss, PointwiseObjective};
pub use wbipath::{WBipathLoss, WBipathOutput};
