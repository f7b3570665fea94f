//! The training/validation step.
//!
//! [`WarpConsistencyActor::step`] turns a source/target pair into a triplet,
//! runs only the backbone passes its [`LossKind`] needs, evaluates and
//! balances the losses and, outside training, records validation metrics.
//! Gradients come back per estimate, already scaled by the balancing
//! factors, for the caller to feed into its own backward pass.

use super::context::ExecutionContext;
use super::network::{FeaturePyramid, FlowNetwork};
use super::validation;
use crate::config::WarpConsistencyConfig;
use crate::diagnostics::{MaskStage, StageClock, StepReport, TimingBreakdown};
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::{Mask, Tensor};
use crate::loss::{LevelMasks, LossBalancer, MultiScaleLoss, Stats, WBipathLoss};
use crate::preprocess::{BatchPreprocessor, TrainingBatch};
use crate::triplet::{PairBatch, TripletSource};
use log::debug;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which objective a step optimises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Direct supervision of target-prime → target with the synthetic flow.
    WarpSupervision,
    /// Composition of target-prime → source → target only.
    WBipath,
    /// Both, balanced.
    Combined,
}

impl LossKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "warp_supervision" => Ok(LossKind::WarpSupervision),
            "w_bipath" => Ok(LossKind::WBipath),
            "warp_supervision_and_w_bipath" => Ok(LossKind::Combined),
            other => Err(Error::config(format!("unknown loss name `{other}`"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossKind::WarpSupervision => "warp_supervision",
            LossKind::WBipath => "w_bipath",
            LossKind::Combined => "warp_supervision_and_w_bipath",
        }
    }

    pub fn uses_warp_supervision(&self) -> bool {
        matches!(self, LossKind::WarpSupervision | LossKind::Combined)
    }

    pub fn uses_w_bipath(&self) -> bool {
        matches!(self, LossKind::WBipath | LossKind::Combined)
    }
}

/// Gradients of the step loss with respect to each estimate the loss used,
/// level by level (coarse to fine). Balancing factors are already applied.
#[derive(Clone, Debug, Default)]
pub struct FlowGradients {
    /// Target-prime → target, direct estimate.
    pub direct: Option<Vec<FlowField>>,
    pub target_prime_to_source: Option<Vec<FlowField>>,
    pub source_to_target: Option<Vec<FlowField>>,
}

/// Flow estimates produced during a step, coarse to fine.
#[derive(Clone, Debug, Default)]
pub struct StepEstimates {
    pub target_prime_to_target: Option<Vec<FlowField>>,
    pub target_prime_to_source: Option<Vec<FlowField>>,
    pub source_to_target: Option<Vec<FlowField>>,
    pub target_to_source: Option<Vec<FlowField>>,
    /// Target-prime → target obtained by composition.
    pub composed: Option<Vec<FlowField>>,
}

#[derive(Clone, Debug)]
pub struct StepOutput {
    pub loss: f32,
    pub stats: Stats,
    pub gradients: FlowGradients,
    pub estimates: StepEstimates,
    pub diagnostics: StepReport,
}

/// Running mean of step statistics; non-finite values are skipped.
#[derive(Clone, Debug, Default)]
struct RunningStats {
    sums: BTreeMap<String, (f64, usize)>,
}

impl RunningStats {
    fn update(&mut self, stats: &Stats) {
        for (key, &value) in stats.iter().filter(|(_, v)| v.is_finite()) {
            let entry = self.sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += f64::from(value);
            entry.1 += 1;
        }
    }

    fn means(&self) -> Stats {
        self.sums
            .iter()
            .map(|(k, &(sum, n))| (k.clone(), (sum / n as f64) as f32))
            .collect()
    }
}

struct Pyramids {
    source: FeaturePyramid,
    target: FeaturePyramid,
    target_prime: FeaturePyramid,
    target_prime_ss: Option<FeaturePyramid>,
}

/// Drives one warp-consistency training or validation step: triplet
/// construction, forward passes, composition, losses and metrics.
pub struct WarpConsistencyActor {
    rng: StdRng,
    net: Box<dyn FlowNetwork>,
    triplets: Box<dyn TripletSource>,
    preprocessor: BatchPreprocessor,
    kind: LossKind,
    objective: MultiScaleLoss,
    w_bipath: WBipathLoss,
    balancer: LossBalancer,
    semantic_evaluation: bool,
    running: RunningStats,
}

impl WarpConsistencyActor {
    /// Fails with [`Error::Config`] when the configured loss name is unknown.
    pub fn new(
        context: ExecutionContext,
        net: Box<dyn FlowNetwork>,
        triplets: Box<dyn TripletSource>,
        config: &WarpConsistencyConfig,
    ) -> Result<Self> {
        let kind = LossKind::from_name(&config.name_of_loss)?;
        let objective = config.multiscale_loss()?;
        debug!(
            "actor: loss={} device={:?} seed={}",
            kind.name(),
            context.device(),
            context.seed()
        );
        Ok(Self {
            rng: context.rng(),
            net,
            triplets,
            preprocessor: config.preprocessor(),
            kind,
            w_bipath: WBipathLoss::new(config.composer(), objective.clone()),
            objective,
            balancer: config.balancer(),
            semantic_evaluation: config.semantic_evaluation,
            running: RunningStats::default(),
        })
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Mean of every statistic over the steps since the last reset.
    pub fn accumulated(&self) -> Stats {
        self.running.means()
    }

    pub fn reset_stats(&mut self) {
        self.running = RunningStats::default();
    }

    pub fn step(&mut self, pair: &PairBatch, training: bool) -> Result<StepOutput> {
        let mut clock = StageClock::start();
        let mut timing = TimingBreakdown::default();

        let triplet = self.triplets.build(pair, &mut self.rng, training)?;
        let batch = self.preprocessor.process(&triplet)?;
        clock.lap(&mut timing, "batch");

        let pyramids = self.shared_pyramids(&batch)?;
        if pyramids.is_some() {
            clock.lap(&mut timing, "pyramids");
        } else {
            clock.skip();
        }

        let mut forward_passes = 0;
        let mut estimates = StepEstimates::default();
        let mut run = |target: &Tensor,
                       source: &Tensor,
                       pyr: Option<(&FeaturePyramid, &FeaturePyramid)>|
         -> Result<Vec<FlowField>> {
            forward_passes += 1;
            let out = self.net.forward(target, source, pyr)?;
            if out.is_empty() {
                return Err(Error::shape("flow network returned no estimate"));
            }
            Ok(out)
        };
        if !training {
            estimates.target_to_source = Some(run(
                &batch.target_image,
                &batch.source_image,
                pyramids.as_ref().map(|p| (&p.target, &p.source)),
            )?);
        }
        let supervision = batch.supervision();
        if !training || self.kind.uses_warp_supervision() {
            let prime_pyr = pyramids
                .as_ref()
                .map(|p| (p.target_prime_ss.as_ref().unwrap_or(&p.target_prime), &p.target));
            estimates.target_prime_to_target =
                Some(run(&supervision.target_image_prime, &batch.target_image, prime_pyr)?);
        }
        if self.kind.uses_w_bipath() {
            estimates.target_prime_to_source = Some(run(
                &batch.prime.target_image_prime,
                &batch.source_image,
                pyramids.as_ref().map(|p| (&p.target_prime, &p.source)),
            )?);
            estimates.source_to_target = Some(run(
                &batch.source_image,
                &batch.target_image,
                pyramids.as_ref().map(|p| (&p.source, &p.target)),
            )?);
        }
        clock.lap(&mut timing, "forward");

        let mut gradients = FlowGradients::default();
        let mut masks = None;
        let direct = estimates.target_prime_to_target.as_deref();
        let supervised = match (self.kind.uses_warp_supervision(), direct) {
            (true, Some(direct)) => Some(self.objective.evaluate(
                direct,
                &supervision.flow_map,
                LevelMasks::from(supervision.mask.as_ref()),
            )?),
            _ => None,
        };
        let unsupervised = match (&estimates.target_prime_to_source, &estimates.source_to_target) {
            (Some(tp_s), Some(s_t)) => Some(self.w_bipath.compute(
                &batch.prime.flow_map,
                batch.prime.mask.as_ref(),
                tp_s,
                s_t,
            )?),
            _ => None,
        };

        let (loss, mut stats) = match (supervised, unsupervised) {
            (Some(ss), None) => {
                let mut stats = ss.stats;
                stats.insert("Loss/total".into(), ss.value);
                gradients.direct = Some(ss.grads);
                (ss.value, stats)
            }
            (None, Some(un)) => {
                let mut stats = un.stats;
                stats.insert("Loss/total".into(), un.value);
                masks = Some(MaskStage::from_composition(&un.composition));
                estimates.composed = Some(un.composition.composed_flows());
                gradients.target_prime_to_source = Some(un.grad_target_prime_to_source);
                gradients.source_to_target = Some(un.grad_source_to_target);
                (un.value, stats)
            }
            (Some(ss), Some(un)) => {
                let mut stats = prefixed(&un.stats, "w_bipath");
                stats.extend(prefixed(&ss.stats, "warp_sup"));
                let balanced = self.balancer.combine(ss.value, un.value);
                balanced.record(ss.value, un.value, &mut stats);
                masks = Some(MaskStage::from_composition(&un.composition));
                estimates.composed = Some(un.composition.composed_flows());
                gradients.direct = Some(scaled(ss.grads, balanced.warp_supervision_factor));
                gradients.target_prime_to_source =
                    Some(scaled(un.grad_target_prime_to_source, balanced.w_bipath_factor));
                gradients.source_to_target = Some(scaled(un.grad_source_to_target, balanced.w_bipath_factor));
                (balanced.total, stats)
            }
            (None, None) => return Err(Error::config("no loss branch produced a value")),
        };
        clock.lap(&mut timing, "loss");

        if !training {
            self.validation_stats(&batch, &estimates, &mut stats)?;
            clock.lap(&mut timing, "validation");
        }

        self.running.update(&stats);
        timing.total_ms = clock.total_ms();
        debug!(
            "step epoch={} iter={} training={training} loss={loss:.5} passes={forward_passes} {:.2} ms",
            batch.epoch, batch.iteration, timing.total_ms
        );
        let diagnostics = StepReport {
            epoch: batch.epoch,
            iteration: batch.iteration,
            training,
            loss_name: self.kind.name().to_string(),
            batch_size: batch.source_image.b,
            flow_size: batch.flow_dims(),
            forward_passes,
            used_shared_pyramids: pyramids.is_some(),
            masks,
            timing,
        };
        Ok(StepOutput {
            loss,
            stats,
            gradients,
            estimates,
            diagnostics,
        })
    }

    fn shared_pyramids(&self, batch: &TrainingBatch) -> Result<Option<Pyramids>> {
        let Some(extractor) = self.net.feature_extractor() else {
            return Ok(None);
        };
        let target_prime_ss = match &batch.prime_ss {
            Some(prime) => Some(extractor.pyramid(&prime.target_image_prime)?),
            None => None,
        };
        Ok(Some(Pyramids {
            source: extractor.pyramid(&batch.source_image)?,
            target: extractor.pyramid(&batch.target_image)?,
            target_prime: extractor.pyramid(&batch.prime.target_image_prime)?,
            target_prime_ss,
        }))
    }

    fn validation_stats(&self, batch: &TrainingBatch, estimates: &StepEstimates, stats: &mut Stats) -> Result<()> {
        if let (Some(t_s), Some(gt)) = (&estimates.target_to_source, &batch.flow_map_target_to_source) {
            let (h, w) = gt.dims();
            let full;
            let mask = match &batch.correspondence_mask_target_to_source {
                Some(mask) => mask,
                None => {
                    full = Mask::full(gt.batch(), h, w, true);
                    &full
                }
            };
            let thresholds = validation::pck_thresholds(gt, self.semantic_evaluation);
            validation::record_target_to_source(t_s, gt, mask, thresholds, stats)?;
        }
        let supervision = batch.supervision();
        if let Some(direct) = &estimates.target_prime_to_target {
            validation::record_synthetic_epe(
                "direct",
                direct,
                &supervision.flow_map,
                &supervision.correspondence_mask,
                stats,
            )?;
        }
        // Without the composition branch the direct estimate stands in for it.
        match &estimates.composed {
            Some(composed) => validation::record_synthetic_epe(
                "composition",
                composed,
                &batch.prime.flow_map,
                &batch.prime.correspondence_mask,
                stats,
            )?,
            None => {
                if let Some(direct) = &estimates.target_prime_to_target {
                    validation::record_synthetic_epe(
                        "composition",
                        direct,
                        &supervision.flow_map,
                        &supervision.correspondence_mask,
                        stats,
                    )?;
                }
            }
        }
        validation::record_best_value(stats);
        Ok(())
    }
}

fn prefixed(stats: &Stats, prefix: &str) -> Stats {
    stats
        .iter()
        .map(|(k, &v)| (format!("{prefix}/{k}"), v))
        .collect()
}

fn scaled(grads: Vec<FlowField>, factor: f32) -> Vec<FlowField> {
    grads.iter().map(|g| g.scale_channels(factor, factor)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::context::Device;
    use crate::actor::network::FeatureExtractor;
    use crate::pyramid::GaussianPyramidExtractor;
    use crate::synthetic::FixedTransformFlow;
    use crate::triplet::{TripletBuilder, TripletOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Predicts a constant flow at two resolutions; with a feature extractor
    /// the resolutions follow the two coarsest pyramid levels.
    struct ConstantNet {
        dx: f32,
        calls: Arc<AtomicUsize>,
        extractor: Option<GaussianPyramidExtractor>,
    }

    impl ConstantNet {
        fn new(dx: f32) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let net = Self {
                dx,
                calls: calls.clone(),
                extractor: None,
            };
            (net, calls)
        }
    }

    impl FlowNetwork for ConstantNet {
        fn forward(
            &self,
            target: &Tensor,
            _source: &Tensor,
            pyramids: Option<(&FeaturePyramid, &FeaturePyramid)>,
        ) -> Result<Vec<FlowField>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let sizes: Vec<(usize, usize)> = match pyramids {
                Some((t, s)) => {
                    assert_eq!(t.len(), s.len());
                    t.levels.iter().rev().take(2).map(|l| (l.h, l.w)).collect()
                }
                None => vec![(target.h / 2, target.w / 2), (target.h, target.w)],
            };
            Ok(sizes
                .into_iter()
                .map(|(h, w)| FlowField::constant(target.b, h, w, self.dx, 0.0))
                .collect())
        }

        fn feature_extractor(&self) -> Option<&dyn FeatureExtractor> {
            self.extractor.as_ref().map(|e| e as &dyn FeatureExtractor)
        }
    }

    fn pair() -> PairBatch {
        let mut img = Tensor::zeros(1, 3, 40, 40);
        for (i, v) in img.data.iter_mut().enumerate() {
            *v = (20 + (i * 13) % 200) as f32;
        }
        PairBatch::new(img.clone(), img).unwrap()
    }

    fn actor(name: &str, net: ConstantNet) -> Result<WarpConsistencyActor> {
        let config = WarpConsistencyConfig {
            name_of_loss: name.to_string(),
            level_weights: vec![0.5, 1.0],
            ..WarpConsistencyConfig::default()
        };
        let options = TripletOptions::default().with_crop(32, 32);
        let triplets = TripletBuilder::new(
            options,
            Box::new(FixedTransformFlow::pixel_translation(2.0, 0.0, 40, 40)),
        )?;
        WarpConsistencyActor::new(ExecutionContext::cpu(7), Box::new(net), Box::new(triplets), &config)
    }

    #[test]
    fn unknown_loss_name_fails_at_construction() {
        let (net, _) = ConstantNet::new(0.0);
        assert!(matches!(actor("epe_only", net), Err(Error::Config(_))));
        assert!(LossKind::from_name("w_bipath").is_ok());
        assert!(ExecutionContext::new(Device::Cpu, 0).is_ok());
    }

    #[test]
    fn training_runs_only_the_needed_passes() {
        let (net, calls) = ConstantNet::new(0.0);
        let mut a = actor("w_bipath", net).unwrap();
        let out = a.step(&pair(), true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(out.gradients.direct.is_none());
        assert_eq!(out.gradients.source_to_target.as_ref().map(Vec::len), Some(2));
        assert!(out.stats.contains_key("Loss/total"));
        assert!(out.diagnostics.masks.is_some());

        let (net, calls) = ConstantNet::new(0.0);
        let mut a = actor("warp_supervision", net).unwrap();
        let out = a.step(&pair(), true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // zero estimate against a 2 px translation
        assert!(out.loss > 0.0);
        assert!(out.gradients.target_prime_to_source.is_none());
    }

    #[test]
    fn exact_direct_estimate_has_zero_supervised_loss() {
        let (net, _) = ConstantNet::new(2.0);
        let mut a = actor("warp_supervision", net).unwrap();
        let out = a.step(&pair(), true).unwrap();
        assert!(out.loss.abs() < 1e-4, "loss {}", out.loss);
    }

    #[test]
    fn validation_reports_metrics() {
        let (net, calls) = ConstantNet::new(0.0);
        let mut a = actor("warp_supervision_and_w_bipath", net).unwrap();
        let p = pair()
            .with_ground_truth(FlowField::zeros(1, 40, 40), None)
            .unwrap();
        let out = a.step(&p, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(out.stats["EPE_target_to_source_reso_0/EPE"].abs() < 1e-6);
        assert_eq!(out.stats["best_value"], out.stats["EPE_target_to_source_reso_0/EPE"]);
        assert!(out.stats.contains_key("EPE_target_prime_to_target_reso_direct_1/EPE"));
        assert!(out.stats.contains_key("EPE_target_prime_to_target_reso_composition_0/EPE"));
        assert!(out.stats.contains_key("w_bipath/EPE/total"));
        assert!(out.stats.contains_key("Loss_warp_sup/total"));
    }

    #[test]
    fn shared_pyramids_are_passed_to_every_direction() {
        let (mut net, calls) = ConstantNet::new(1.0);
        net.extractor = Some(GaussianPyramidExtractor::new(3));
        let mut a = actor("warp_supervision_and_w_bipath", net).unwrap();
        let out = a.step(&pair(), true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(out.diagnostics.used_shared_pyramids);
        let direct = out.estimates.target_prime_to_target.unwrap();
        assert_eq!(direct[0].dims(), (8, 8));
        assert_eq!(direct[1].dims(), (16, 16));
        assert!(out.loss.is_finite());
    }

    #[test]
    fn running_stats_average_steps() {
        let (net, _) = ConstantNet::new(0.0);
        let mut a = actor("warp_supervision", net).unwrap();
        let l1 = a.step(&pair(), true).unwrap().loss;
        let l2 = a.step(&pair(), true).unwrap().loss;
        let mean = a.accumulated()["Loss/total"];
        assert!((mean - 0.5 * (l1 + l2)).abs() < 1e-4);
        a.reset_stats();
        assert!(a.accumulated().is_empty());
    }
}
