//! Balancing of the warp-supervision and w-bipath losses.
use super::Stats;
use serde::{Deserialize, Serialize};

const BALANCE_EPS: f32 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum LossBalancer {
    /// Rescale the smaller loss so both reach the configured weight ratio.
    Adaptive { warp_supervision: f32, w_bipath: f32 },
    /// Fixed linear combination.
    Constant { warp_supervision: f32, w_bipath: f32 },
}

impl Default for LossBalancer {
    fn default() -> Self {
        LossBalancer::Adaptive {
            warp_supervision: 1.0,
            w_bipath: 1.0,
        }
    }
}

/// Combined loss and the factors applied to each term.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Balanced {
    pub total: f32,
    pub warp_supervision_factor: f32,
    pub w_bipath_factor: f32,
}

impl LossBalancer {
    /// Combine a warp-supervision loss and a w-bipath loss. The factors are
    /// computed from the loss values and are constants for differentiation.
    pub fn combine(&self, loss_ss: f32, loss_un: f32) -> Balanced {
        let (s, u) = match *self {
            LossBalancer::Adaptive {
                warp_supervision,
                w_bipath,
            } => {
                let ratio = warp_supervision / w_bipath;
                if loss_un > loss_ss {
                    (loss_un / (loss_ss + BALANCE_EPS) * ratio, 1.0)
                } else {
                    (1.0, loss_ss / (loss_un + BALANCE_EPS) / ratio)
                }
            }
            LossBalancer::Constant {
                warp_supervision,
                w_bipath,
            } => (warp_supervision, w_bipath),
        };
        Balanced {
            total: loss_un * u + loss_ss * s,
            warp_supervision_factor: s,
            w_bipath_factor: u,
        }
    }
}

impl Balanced {
    pub fn record(&self, loss_ss: f32, loss_un: f32, stats: &mut Stats) {
        stats.insert("Loss_w_bipath/total".into(), loss_un * self.w_bipath_factor);
        stats.insert("Loss_warp_sup/total".into(), loss_ss * self.warp_supervision_factor);
        stats.insert("Loss/total".into(), self.total);
    }
}
