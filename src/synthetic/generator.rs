use super::homography::homography_from_corners;
use super::tps::{control_grid, ThinPlateSpline};
use super::transform::{stack_flows, AffineParams, Transform, TransformFamily};
use crate::error::{Error, Result};
use crate::flow::FlowField;
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const UNIT_SQUARE: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

/// Bounds of the random transform parameters, in normalised units
/// (translations, corner and control-point offsets) or radians (angles).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSampler {
    pub families: Vec<TransformFamily>,
    pub random_t: f32,
    pub random_s: f32,
    pub random_alpha: f32,
    pub random_t_hom: f32,
    pub random_t_tps: f32,
    /// Spline perturbation used by the affine + spline family; falls back to `random_t_tps`.
    pub random_t_tps_for_afftps: Option<f32>,
    pub tps_grid_size: usize,
    /// Draw parameters from `N(0, bound)` instead of `U(-bound, bound)`.
    pub parametrize_with_gaussian: bool,
}

impl Default for TransformSampler {
    fn default() -> Self {
        Self {
            families: vec![
                TransformFamily::Affine,
                TransformFamily::Homography,
                TransformFamily::Tps,
                TransformFamily::AffineTps,
            ],
            random_t: 0.25,
            random_s: 0.5,
            random_alpha: std::f32::consts::PI / 12.0,
            random_t_hom: 0.4,
            random_t_tps: 0.4,
            random_t_tps_for_afftps: None,
            tps_grid_size: 3,
            parametrize_with_gaussian: false,
        }
    }
}

impl TransformSampler {
    pub fn validate(&self) -> Result<()> {
        if self.families.is_empty() {
            return Err(Error::config("transform sampler needs at least one family"));
        }
        let bounds = [
            ("random_t", self.random_t),
            ("random_s", self.random_s),
            ("random_alpha", self.random_alpha),
            ("random_t_hom", self.random_t_hom),
            ("random_t_tps", self.random_t_tps),
            ("random_t_tps_for_afftps", self.random_t_tps_for_afftps.unwrap_or(0.0)),
        ];
        for (name, v) in bounds {
            if !v.is_finite() || v < 0.0 {
                return Err(Error::config(format!("{name} must be a finite non-negative bound, got {v}")));
            }
        }
        if self.tps_grid_size < 2 {
            return Err(Error::config("tps_grid_size must be at least 2"));
        }
        Ok(())
    }

    fn draw(&self, rng: &mut StdRng, bound: f32) -> f32 {
        if bound <= 0.0 {
            0.0
        } else if self.parametrize_with_gaussian {
            let z: f32 = rng.sample(StandardNormal);
            z * bound
        } else {
            rng.gen_range(-bound..=bound)
        }
    }

    fn sample_affine(&self, rng: &mut StdRng) -> AffineParams {
        AffineParams {
            rotation: self.draw(rng, self.random_alpha),
            shear: self.draw(rng, self.random_alpha),
            scale_x: 1.0 + self.draw(rng, self.random_s),
            scale_y: 1.0 + self.draw(rng, self.random_s),
            tx: self.draw(rng, self.random_t),
            ty: self.draw(rng, self.random_t),
        }
    }

    fn sample_tps(&self, rng: &mut StdRng, bound: f32) -> Option<ThinPlateSpline> {
        let controls = control_grid(self.tps_grid_size);
        let targets: Vec<[f32; 2]> = controls
            .iter()
            .map(|c| [c[0] + self.draw(rng, bound), c[1] + self.draw(rng, bound)])
            .collect();
        ThinPlateSpline::fit(&controls, &targets)
    }

    /// Draw one random transform from a uniformly chosen family.
    pub fn sample(&self, rng: &mut StdRng) -> Transform {
        let Some(&family) = self.families.get(rng.gen_range(0..self.families.len().max(1))) else {
            return Transform::identity();
        };
        let sampled = match family {
            TransformFamily::Affine => Some(Transform::Affine(self.sample_affine(rng).matrix())),
            TransformFamily::Homography => {
                let mut dst = UNIT_SQUARE;
                for p in dst.iter_mut() {
                    p[0] += self.draw(rng, self.random_t_hom);
                    p[1] += self.draw(rng, self.random_t_hom);
                }
                homography_from_corners(&UNIT_SQUARE, &dst).map(Transform::Homography)
            }
            TransformFamily::Tps => self.sample_tps(rng, self.random_t_tps).map(Transform::Tps),
            TransformFamily::AffineTps => {
                let affine = self.sample_affine(rng).matrix();
                let bound = self.random_t_tps_for_afftps.unwrap_or(self.random_t_tps);
                self.sample_tps(rng, bound)
                    .map(|tps| Transform::AffineTps { affine, tps })
            }
        };
        sampled.unwrap_or_else(|| {
            debug!("degenerate {family:?} sample, using identity");
            Transform::identity()
        })
    }
}

/// Source of the known target-prime → target flow of a triplet.
pub trait SyntheticFlowGenerator: Send + Sync {
    /// `(batch, 2, h, w)` flow in pixel units of the requested size.
    fn generate(&self, rng: &mut StdRng, batch: usize, size: (usize, usize)) -> Result<FlowField>;
}

fn render_at(t: &Transform, canonical: Option<(usize, usize)>, size: (usize, usize)) -> FlowField {
    let (h, w) = canonical.unwrap_or(size);
    let flow = t.render(h, w);
    if (h, w) != size {
        flow.resize(size.0, size.1)
    } else {
        flow
    }
}

fn batch_of(flows: Vec<FlowField>, size: (usize, usize)) -> Result<FlowField> {
    stack_flows(&flows).ok_or_else(|| Error::shape(format!("cannot render a flow batch at {size:?}")))
}

/// Independent random transform per sample, rendered at `canonical_size`
/// and resized with channel rescaling when another size is requested.
#[derive(Clone, Debug, Default)]
pub struct RandomTransformFlow {
    pub sampler: TransformSampler,
    pub canonical_size: Option<(usize, usize)>,
}

impl RandomTransformFlow {
    pub fn new(sampler: TransformSampler) -> Result<Self> {
        sampler.validate()?;
        Ok(Self {
            sampler,
            canonical_size: None,
        })
    }

    pub fn with_canonical_size(mut self, h: usize, w: usize) -> Self {
        self.canonical_size = Some((h, w));
        self
    }
}

impl SyntheticFlowGenerator for RandomTransformFlow {
    fn generate(&self, rng: &mut StdRng, batch: usize, size: (usize, usize)) -> Result<FlowField> {
        let flows = (0..batch)
            .map(|_| render_at(&self.sampler.sample(rng), self.canonical_size, size))
            .collect();
        let flow = batch_of(flows, size)?;
        debug!("synthetic flow batch={batch} size={size:?}");
        Ok(flow)
    }
}

/// The same known transform for every sample.
#[derive(Clone, Debug)]
pub struct FixedTransformFlow {
    pub transform: Transform,
    pub canonical_size: Option<(usize, usize)>,
}

impl FixedTransformFlow {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            canonical_size: None,
        }
    }

    /// Pure translation by `(dx, dy)` pixels at resolution `h × w`.
    pub fn pixel_translation(dx: f32, dy: f32, h: usize, w: usize) -> Self {
        let tx = 2.0 * dx / w.saturating_sub(1).max(1) as f32;
        let ty = 2.0 * dy / h.saturating_sub(1).max(1) as f32;
        Self {
            transform: Transform::Affine(AffineParams::translation(tx, ty).matrix()),
            canonical_size: Some((h, w)),
        }
    }
}

impl SyntheticFlowGenerator for FixedTransformFlow {
    fn generate(&self, _rng: &mut StdRng, batch: usize, size: (usize, usize)) -> Result<FlowField> {
        let one = render_at(&self.transform, self.canonical_size, size);
        batch_of(vec![one; batch], size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn same_seed_same_flow() {
        let gen = RandomTransformFlow::new(TransformSampler::default()).unwrap();
        let a = gen.generate(&mut StdRng::seed_from_u64(7), 2, (16, 20)).unwrap();
        let b = gen.generate(&mut StdRng::seed_from_u64(7), 2, (16, 20)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tensor().shape(), [2, 2, 16, 20]);
    }

    #[test]
    fn zero_bounds_give_identity_affine() {
        let sampler = TransformSampler {
            families: vec![TransformFamily::Affine],
            random_t: 0.0,
            random_s: 0.0,
            random_alpha: 0.0,
            ..TransformSampler::default()
        };
        let t = sampler.sample(&mut StdRng::seed_from_u64(1));
        let flow = t.render(8, 8);
        assert!(flow.tensor().data.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn canonical_rendering_is_rescaled() {
        let gen = FixedTransformFlow::pixel_translation(4.0, -2.0, 33, 33);
        let flow = gen.generate(&mut StdRng::seed_from_u64(0), 1, (33, 66)).unwrap();
        assert!((flow.dx(0, 10, 30) - 8.0).abs() < 1e-3, "dx={}", flow.dx(0, 10, 30));
        assert!((flow.dy(0, 10, 30) + 2.0).abs() < 1e-3, "dy={}", flow.dy(0, 10, 30));
    }

    #[test]
    fn every_family_renders_finite_flow() {
        let mut rng = StdRng::seed_from_u64(3);
        for family in [
            TransformFamily::Affine,
            TransformFamily::Homography,
            TransformFamily::Tps,
            TransformFamily::AffineTps,
        ] {
            let sampler = TransformSampler {
                families: vec![family],
                random_t_hom: 0.2,
                ..TransformSampler::default()
            };
            let t = sampler.sample(&mut rng);
            assert_eq!(t.family(), family);
            let flow = t.render(12, 12);
            assert!(flow.tensor().data.iter().all(|v| v.is_finite()), "{family:?}");
        }
    }

    #[test]
    fn invalid_bounds_rejected() {
        let sampler = TransformSampler {
            random_t: -1.0,
            ..TransformSampler::default()
        };
        assert!(matches!(sampler.validate(), Err(Error::Config(_))));
        let empty = TransformSampler {
            families: vec![],
            ..TransformSampler::default()
        };
        assert!(RandomTransformFlow::new(empty).is_err());
    }
}
