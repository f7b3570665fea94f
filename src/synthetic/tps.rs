//! Thin-plate spline warps of the normalised `[-1, 1]²` domain.
//!
//! A spline is fitted so that every control point `c_i` maps exactly onto
//! its displaced position `d_i`:
//!
//! `f(p) = a0 + a1·x + a2·y + Σ w_i · U(|p − c_i|)`, with `U(r) = r² ln r²`.
//!
//! Both output coordinates share the same kernel matrix, so the system is
//! factorised once and solved for two right-hand sides.
use nalgebra::{DMatrix, DVector};

#[derive(Clone, Debug, PartialEq)]
pub struct ThinPlateSpline {
    controls: Vec<[f32; 2]>,
    weights_x: Vec<f32>,
    weights_y: Vec<f32>,
    affine_x: [f32; 3],
    affine_y: [f32; 3],
}

#[inline]
fn radial(dx: f32, dy: f32) -> f32 {
    let r2 = dx * dx + dy * dy;
    if r2 <= f32::EPSILON {
        0.0
    } else {
        r2 * r2.ln()
    }
}

/// Regular `n × n` grid of control points spanning `[-1, 1]²`.
pub fn control_grid(n: usize) -> Vec<[f32; 2]> {
    let n = n.max(2);
    let step = 2.0 / (n - 1) as f32;
    let mut pts = Vec::with_capacity(n * n);
    for j in 0..n {
        for i in 0..n {
            pts.push([-1.0 + i as f32 * step, -1.0 + j as f32 * step]);
        }
    }
    pts
}

impl ThinPlateSpline {
    /// Fit a spline through `controls → targets`. `None` if the system is singular.
    pub fn fit(controls: &[[f32; 2]], targets: &[[f32; 2]]) -> Option<Self> {
        let n = controls.len();
        if n < 3 || targets.len() != n {
            return None;
        }
        let m = n + 3;
        let mut a = DMatrix::<f64>::zeros(m, m);
        for i in 0..n {
            for j in 0..n {
                let dx = controls[i][0] - controls[j][0];
                let dy = controls[i][1] - controls[j][1];
                a[(i, j)] = radial(dx, dy) as f64;
            }
            let row = [1.0, controls[i][0] as f64, controls[i][1] as f64];
            for (k, v) in row.into_iter().enumerate() {
                a[(i, n + k)] = v;
                a[(n + k, i)] = v;
            }
        }
        let lu = a.lu();
        let solve = |axis: usize| -> Option<DVector<f64>> {
            let mut rhs = DVector::<f64>::zeros(m);
            for (i, t) in targets.iter().enumerate() {
                rhs[i] = t[axis] as f64;
            }
            lu.solve(&rhs).filter(|s| s.iter().all(|v| v.is_finite()))
        };
        let sx = solve(0)?;
        let sy = solve(1)?;
        let split = |s: &DVector<f64>| -> (Vec<f32>, [f32; 3]) {
            let w = s.iter().take(n).map(|&v| v as f32).collect();
            (w, [s[n] as f32, s[n + 1] as f32, s[n + 2] as f32])
        };
        let (weights_x, affine_x) = split(&sx);
        let (weights_y, affine_y) = split(&sy);
        Some(Self {
            controls: controls.to_vec(),
            weights_x,
            weights_y,
            affine_x,
            affine_y,
        })
    }

    pub fn map(&self, x: f32, y: f32) -> [f32; 2] {
        let mut ox = self.affine_x[0] + self.affine_x[1] * x + self.affine_x[2] * y;
        let mut oy = self.affine_y[0] + self.affine_y[1] * x + self.affine_y[2] * y;
        for ((c, wx), wy) in self.controls.iter().zip(&self.weights_x).zip(&self.weights_y) {
            let u = radial(x - c[0], y - c[1]);
            ox += wx * u;
            oy += wy * u;
        }
        [ox, oy]
    }
}
