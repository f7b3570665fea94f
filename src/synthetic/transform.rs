//! Geometric transforms of the normalised image domain and their rendering
//! as dense flow.
//!
//! Transforms act on coordinates in `[-1, 1]²` where `(-1, -1)` is the
//! centre of the top-left pixel and `(1, 1)` the centre of the bottom-right
//! one. A transform maps a target-prime position onto the target position it
//! samples from, so the rendered flow is `T(p) − p` converted back to pixels.
use super::homography::apply_homography_point;
use super::tps::ThinPlateSpline;
use crate::flow::FlowField;
use crate::image::Tensor;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformFamily {
    Affine,
    Homography,
    Tps,
    AffineTps,
}

/// Parameters of an affine map, composed as `translate · rotate · shear · scale`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AffineParams {
    pub rotation: f32,
    pub shear: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub tx: f32,
    pub ty: f32,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            ..Self::default()
        }
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Self {
            tx,
            ty,
            ..Self::identity()
        }
    }

    pub fn matrix(&self) -> Matrix3<f32> {
        let (s, c) = self.rotation.sin_cos();
        let rotate = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
        let shear = Matrix3::new(1.0, self.shear.tan(), 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let scale = Matrix3::new(self.scale_x, 0.0, 0.0, 0.0, self.scale_y, 0.0, 0.0, 0.0, 1.0);
        let translate = Matrix3::new(1.0, 0.0, self.tx, 0.0, 1.0, self.ty, 0.0, 0.0, 1.0);
        translate * rotate * shear * scale
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transform {
    Affine(Matrix3<f32>),
    Homography(Matrix3<f32>),
    Tps(ThinPlateSpline),
    /// Affine map followed by a spline deformation.
    AffineTps { affine: Matrix3<f32>, tps: ThinPlateSpline },
}

impl Transform {
    pub fn identity() -> Self {
        Transform::Affine(Matrix3::identity())
    }

    pub fn family(&self) -> TransformFamily {
        match self {
            Transform::Affine(_) => TransformFamily::Affine,
            Transform::Homography(_) => TransformFamily::Homography,
            Transform::Tps(_) => TransformFamily::Tps,
            Transform::AffineTps { .. } => TransformFamily::AffineTps,
        }
    }

    /// Image of the normalised point `(x, y)`; non-finite at singularities.
    pub fn map(&self, x: f32, y: f32) -> [f32; 2] {
        match self {
            Transform::Affine(m) => [
                m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)],
                m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)],
            ],
            Transform::Homography(h) => {
                apply_homography_point(h, [x, y]).unwrap_or([f32::NAN, f32::NAN])
            }
            Transform::Tps(tps) => tps.map(x, y),
            Transform::AffineTps { affine, tps } => {
                let [ax, ay] = Transform::Affine(*affine).map(x, y);
                tps.map(ax, ay)
            }
        }
    }

    /// Dense `(1, 2, h, w)` flow in pixel units.
    pub fn render(&self, h: usize, w: usize) -> FlowField {
        let (sx, sy) = (pixel_span(w), pixel_span(h));
        FlowField::from_fn(1, h, w, |_, x, y| {
            let nx = 2.0 * x as f32 / sx - 1.0;
            let ny = 2.0 * y as f32 / sy - 1.0;
            let [mx, my] = self.map(nx, ny);
            ((mx + 1.0) * 0.5 * sx - x as f32, (my + 1.0) * 0.5 * sy - y as f32)
        })
    }
}

#[inline]
fn pixel_span(n: usize) -> f32 {
    n.saturating_sub(1).max(1) as f32
}

/// Stack single-sample flows into one batch.
pub fn stack_flows(flows: &[FlowField]) -> Option<FlowField> {
    let first = flows.first()?;
    let (h, w) = first.dims();
    let mut data = Vec::with_capacity(flows.len() * 2 * h * w);
    for f in flows {
        if f.dims() != (h, w) {
            return None;
        }
        data.extend_from_slice(&f.tensor().data);
    }
    let b = data.len() / (2 * h * w).max(1);
    Tensor::from_vec(b, 2, h, w, data)
        .ok()
        .and_then(|t| FlowField::new(t).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::tps::control_grid;

    #[test]
    fn translation_renders_constant_flow() {
        // 0.2 normalised units over a 11-pixel span is one pixel
        let t = Transform::Affine(AffineParams::translation(0.2, -0.4).matrix());
        let flow = t.render(11, 11);
        for y in 0..11 {
            for x in 0..11 {
                assert!((flow.dx(0, y, x) - 1.0).abs() < 1e-4);
                assert!((flow.dy(0, y, x) + 2.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn identity_renders_zero_flow() {
        let flow = Transform::identity().render(7, 9);
        assert!(flow.tensor().data.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn rotation_about_centre_keeps_centre_fixed() {
        let params = AffineParams {
            rotation: 0.3,
            ..AffineParams::identity()
        };
        let flow = Transform::Affine(params.matrix()).render(9, 9);
        assert!(flow.dx(0, 4, 4).abs() < 1e-5 && flow.dy(0, 4, 4).abs() < 1e-5);
        assert!(flow.dx(0, 0, 0).abs() > 0.5);
    }

    #[test]
    fn affine_tps_with_rest_spline_equals_affine() {
        let grid = control_grid(3);
        let tps = ThinPlateSpline::fit(&grid, &grid).unwrap();
        let affine = AffineParams {
            rotation: 0.1,
            scale_x: 1.1,
            ..AffineParams::identity()
        }
        .matrix();
        let a = Transform::Affine(affine).map(0.3, 0.7);
        let b = Transform::AffineTps { affine, tps }.map(0.3, 0.7);
        assert!((a[0] - b[0]).abs() < 1e-4 && (a[1] - b[1]).abs() < 1e-4);
    }

    #[test]
    fn stacking_preserves_order() {
        let a = FlowField::constant(1, 2, 3, 1.0, 0.0);
        let b = FlowField::constant(1, 2, 3, 2.0, 0.0);
        let s = stack_flows(&[a, b]).unwrap();
        assert_eq!(s.batch(), 2);
        assert_eq!(s.dx(1, 1, 2), 2.0);
        assert!(stack_flows(&[]).is_none());
    }
}
