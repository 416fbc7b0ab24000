//! Homogeneous 4x4 affine transforms
//!
//! Matrices are row-major `[f64; 16]`, the same layout as the NIfTI sform
//! rows read by `nifti_io`. The last row is assumed to be `0 0 0 1`.

pub type Affine = [f64; 16];

pub fn identity() -> Affine {
    [
        1.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Pure translation by `t` (world millimetres)
pub fn translation(t: [f64; 3]) -> Affine {
    let mut a = identity();
    a[3] = t[0];
    a[7] = t[1];
    a[11] = t[2];
    a
}

/// Matrix product `a * b` (apply `b` first, then `a`)
pub fn multiply(a: &Affine, b: &Affine) -> Affine {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            let mut s = 0.0;
            for k in 0..4 {
                s += a[r * 4 + k] * b[k * 4 + c];
            }
            out[r * 4 + c] = s;
        }
    }
    out
}

/// Transform a point
#[inline]
pub fn apply(a: &Affine, p: [f64; 3]) -> [f64; 3] {
    [
        a[0] * p[0] + a[1] * p[1] + a[2] * p[2] + a[3],
        a[4] * p[0] + a[5] * p[1] + a[6] * p[2] + a[7],
        a[8] * p[0] + a[9] * p[1] + a[10] * p[2] + a[11],
    ]
}

/// Inverse of an affine matrix, `None` when the linear part is singular
pub fn invert(a: &Affine) -> Option<Affine> {
    let (m00, m01, m02) = (a[0], a[1], a[2]);
    let (m10, m11, m12) = (a[4], a[5], a[6]);
    let (m20, m21, m22) = (a[8], a[9], a[10]);

    // Cofactors of the 3x3 linear part
    let c00 = m11 * m22 - m12 * m21;
    let c01 = m12 * m20 - m10 * m22;
    let c02 = m10 * m21 - m11 * m20;

    let det = m00 * c00 + m01 * c01 + m02 * c02;
    if !det.is_finite() || det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;

    let i00 = c00 * inv_det;
    let i01 = (m02 * m21 - m01 * m22) * inv_det;
    let i02 = (m01 * m12 - m02 * m11) * inv_det;
    let i10 = c01 * inv_det;
    let i11 = (m00 * m22 - m02 * m20) * inv_det;
    let i12 = (m02 * m10 - m00 * m12) * inv_det;
    let i20 = c02 * inv_det;
    let i21 = (m01 * m20 - m00 * m21) * inv_det;
    let i22 = (m00 * m11 - m01 * m10) * inv_det;

    let (tx, ty, tz) = (a[3], a[7], a[11]);

    Some([
        i00, i01, i02, -(i00 * tx + i01 * ty + i02 * tz),
        i10, i11, i12, -(i10 * tx + i11 * ty + i12 * tz),
        i20, i21, i22, -(i20 * tx + i21 * ty + i22 * tz),
        0.0, 0.0, 0.0, 1.0,
    ])
}

/// Largest absolute element-wise difference
pub fn max_abs_difference(a: &Affine, b: &Affine) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// Four whitespace-separated rows, the layout of FSL `.mat` files
pub fn format_matrix(a: &Affine) -> String {
    let mut out = String::new();
    for r in 0..4 {
        let row: Vec<String> = (0..4).map(|c| format!("{:.10}", a[r * 4 + c])).collect();
        out.push_str(&row.join("  "));
        out.push('\n');
    }
    out
}
