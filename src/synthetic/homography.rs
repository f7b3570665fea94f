use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

const EPS: f32 = 1e-9;

/// Map one point through `h`, `None` when it lands at infinity.
#[inline]
pub fn apply_homography_point(h: &Matrix3<f32>, p: [f32; 2]) -> Option<[f32; 2]> {
    let v = h * Vector3::new(p[0], p[1], 1.0);
    let w = v[2];
    if !w.is_finite() || w.abs() <= EPS || !v[0].is_finite() || !v[1].is_finite() {
        return None;
    }
    Some([v[0] / w, v[1] / w])
}

pub fn apply_homography_points(h: &Matrix3<f32>, pts: &[[f32; 2]]) -> Option<Vec<[f32; 2]>> {
    pts.iter().map(|&p| apply_homography_point(h, p)).collect()
}

/// Homography taking the four `src` points onto `dst` (DLT with `h33 = 1`).
///
/// Returns `None` for degenerate configurations (three collinear points).
pub fn homography_from_corners(src: &[[f32; 2]; 4], dst: &[[f32; 2]; 4]) -> Option<Matrix3<f32>> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let (x, y) = (s[0] as f64, s[1] as f64);
        let (u, v) = (d[0] as f64, d[1] as f64);
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        b[r] = u;
        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        b[r + 1] = v;
    }
    let sol = a.lu().solve(&b)?;
    if sol.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(Matrix3::new(
        sol[0] as f32,
        sol[1] as f32,
        sol[2] as f32,
        sol[3] as f32,
        sol[4] as f32,
        sol[5] as f32,
        sol[6] as f32,
        sol[7] as f32,
        1.0,
    ))
}
