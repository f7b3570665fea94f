//! Evaluation-mode statistics of a step.
//!
//! Estimates are reported per resolution with the finest level first, so
//! `reso_0` is always the final output of the backbone.
use crate::error::Result;
use crate::flow::FlowField;
use crate::image::Mask;
use crate::loss::{real_epe, real_metrics, semantic_thresholds, Stats, PCK_THRESHOLDS};

/// Key holding the EPE of the final target → source estimate.
pub const TARGET_TO_SOURCE_EPE: &str = "EPE_target_to_source_reso_0/EPE";
/// Key holding the EPE of the finest composed target-prime → target flow.
pub const COMPOSITION_EPE: &str = "EPE_target_prime_to_target_reso_composition_0/EPE";

/// PCK thresholds: fixed pixel radii or, for semantic benchmarks, fractions
/// of the larger ground-truth side.
pub fn pck_thresholds(gt: &FlowField, semantic: bool) -> [f32; 3] {
    if semantic {
        let (h, w) = gt.dims();
        semantic_thresholds(h, w)
    } else {
        PCK_THRESHOLDS
    }
}

/// EPE and PCK of every level of a target → source estimate against real
/// ground truth.
pub fn record_target_to_source(
    estimates: &[FlowField],
    gt: &FlowField,
    mask: &Mask,
    thresholds: [f32; 3],
    stats: &mut Stats,
) -> Result<()> {
    for (reso, est) in estimates.iter().rev().enumerate() {
        let m = real_metrics(est, gt, mask, thresholds)?;
        stats.insert(format!("EPE_target_to_source_reso_{reso}/EPE"), m.epe);
        for (t, pck) in thresholds.iter().zip(m.pck) {
            stats.insert(format!("PCK_{t:?}_target_to_source_reso_{reso}/EPE"), pck);
        }
    }
    Ok(())
}

/// EPE of target-prime → target estimates against the synthetic flow; `how`
/// is `direct` or `composition`.
pub fn record_synthetic_epe(
    how: &str,
    estimates: &[FlowField],
    flow_map: &FlowField,
    mask: &Mask,
    stats: &mut Stats,
) -> Result<()> {
    for (reso, est) in estimates.iter().rev().enumerate() {
        let epe = real_epe(est, flow_map, mask)?;
        stats.insert(format!("EPE_target_prime_to_target_reso_{how}_{reso}/EPE"), epe);
    }
    Ok(())
}

/// `best_value` tracks real target → source accuracy when available, the
/// composed synthetic flow otherwise.
pub fn record_best_value(stats: &mut Stats) {
    let best = stats
        .get(TARGET_TO_SOURCE_EPE)
        .or_else(|| stats.get(COMPOSITION_EPE))
        .copied();
    if let Some(best) = best {
        stats.insert("best_value".into(), best);
    }
}
