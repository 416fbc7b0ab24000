//! Symmetric eigendecomposition
//!
//! Householder reduction to tridiagonal form followed by implicit QL
//! iteration (EISPACK tred2/tql2). Used for the 3x3 diffusion tensors and
//! for the 7x7 normal matrix of the tensor design.
//!
//! Reference:
//! Bowdler, Martin, Reinsch, Wilkinson (1968). Handbook for Automatic
//! Computation, Vol. II - Linear Algebra.

/// Eigenvalues in ascending order with matching unit eigenvectors.
///
/// `vectors[k][i]` is component `k` of the eigenvector for `values[i]`.
#[derive(Clone, Debug)]
pub struct SymmetricEigen<const N: usize> {
    pub values: [f64; N],
    pub vectors: [[f64; N]; N],
}

impl<const N: usize> SymmetricEigen<N> {
    /// Eigenvector `i` as an array
    pub fn vector(&self, i: usize) -> [f64; N] {
        let mut out = [0.0; N];
        for k in 0..N {
            out[k] = self.vectors[k][i];
        }
        out
    }
}

/// Decompose a symmetric matrix
///
/// Only the matrix is read; symmetry is assumed, not checked. Returns `None`
/// when the matrix contains non-finite entries.
pub fn symmetric_eigen<const N: usize>(matrix: &[[f64; N]; N]) -> Option<SymmetricEigen<N>> {
    if matrix.iter().flatten().any(|v| !v.is_finite()) {
        return None;
    }

    let mut v = *matrix;
    let mut d = [0.0f64; N];
    let mut e = [0.0f64; N];

    tred2(&mut v, &mut d, &mut e);
    tql2(&mut v, &mut d, &mut e);

    Some(SymmetricEigen { values: d, vectors: v })
}

/// Decompose a diffusion tensor stored as (xx, yy, zz, xy, xz, yz)
///
/// Matrix is:
/// | xx  xy  xz |
/// | xy  yy  yz |
/// | xz  yz  zz |
pub fn tensor_eigen(t: &[f64; 6]) -> Option<SymmetricEigen<3>> {
    let [xx, yy, zz, xy, xz, yz] = *t;
    symmetric_eigen(&[[xx, xy, xz], [xy, yy, yz], [xz, yz, zz]])
}

/// Symmetric Householder reduction to tridiagonal form
fn tred2<const N: usize>(v: &mut [[f64; N]; N], d: &mut [f64; N], e: &mut [f64; N]) {
    if N == 0 {
        return;
    }

    for j in 0..N {
        d[j] = v[N - 1][j];
    }

    for i in (1..N).rev() {
        // Scale to avoid under/overflow
        let mut scale = 0.0;
        let mut h = 0.0;

        for k in 0..i {
            scale += d[k].abs();
        }

        if scale == 0.0 {
            e[i] = d[i - 1];
            for j in 0..i {
                d[j] = v[i - 1][j];
                v[i][j] = 0.0;
                v[j][i] = 0.0;
            }
        } else {
            for k in 0..i {
                d[k] /= scale;
                h += d[k] * d[k];
            }

            let f = d[i - 1];
            let mut g = h.sqrt();
            if f > 0.0 {
                g = -g;
            }
            e[i] = scale * g;
            h -= f * g;
            d[i - 1] = f - g;

            for j in 0..i {
                e[j] = 0.0;
            }

            for j in 0..i {
                let f = d[j];
                v[j][i] = f;
                let mut g = e[j] + v[j][j] * f;
                for k in (j + 1)..i {
                    g += v[k][j] * d[k];
                    e[k] += v[k][j] * f;
                }
                e[j] = g;
            }

            let mut f = 0.0;
            for j in 0..i {
                e[j] /= h;
                f += e[j] * d[j];
            }

            let hh = f / (h + h);
            for j in 0..i {
                e[j] -= hh * d[j];
            }

            for j in 0..i {
                let f = d[j];
                let g = e[j];
                for k in j..i {
                    v[k][j] -= f * e[k] + g * d[k];
                }
                d[j] = v[i - 1][j];
                v[i][j] = 0.0;
            }
        }
        d[i] = h;
    }

    // Accumulate transformations
    for i in 0..(N - 1) {
        v[N - 1][i] = v[i][i];
        v[i][i] = 1.0;
        let h = d[i + 1];
        if h != 0.0 {
            for k in 0..=i {
                d[k] = v[k][i + 1] / h;
            }
            for j in 0..=i {
                let mut g = 0.0;
                for k in 0..=i {
                    g += v[k][i + 1] * v[k][j];
                }
                for k in 0..=i {
                    v[k][j] -= g * d[k];
                }
            }
        }
        for k in 0..=i {
            v[k][i + 1] = 0.0;
        }
    }

    for j in 0..N {
        d[j] = v[N - 1][j];
        v[N - 1][j] = 0.0;
    }
    v[N - 1][N - 1] = 1.0;
    e[0] = 0.0;
}

/// Symmetric tridiagonal QL algorithm, eigenpairs sorted ascending
fn tql2<const N: usize>(v: &mut [[f64; N]; N], d: &mut [f64; N], e: &mut [f64; N]) {
    if N == 0 {
        return;
    }

    for i in 1..N {
        e[i - 1] = e[i];
    }
    e[N - 1] = 0.0;

    let mut f: f64 = 0.0;
    let mut tst1: f64 = 0.0;
    let eps: f64 = 2.0f64.powi(-52);

    for l in 0..N {
        // Find small subdiagonal element
        tst1 = tst1.max(d[l].abs() + e[l].abs());
        let mut m = l;
        while m < N {
            if e[m].abs() <= eps * tst1 {
                break;
            }
            m += 1;
        }

        if m > l {
            // QL converges in a handful of sweeps; the cap only guards
            // against pathological input
            for _ in 0..MAX_QL_SWEEPS {
                let g = d[l];
                let mut p = (d[l + 1] - g) / (2.0 * e[l]);
                let mut r = p.hypot(1.0);
                if p < 0.0 {
                    r = -r;
                }
                d[l] = e[l] / (p + r);
                d[l + 1] = e[l] * (p + r);
                let dl1 = d[l + 1];
                let h = g - d[l];
                for i in (l + 2)..N {
                    d[i] -= h;
                }
                f += h;

                // Implicit QL transformation
                p = d[m];
                let mut c = 1.0;
                let mut c2 = c;
                let mut c3 = c;
                let el1 = e[l + 1];
                let mut s = 0.0;
                let mut s2 = 0.0;

                for i in (l..m).rev() {
                    c3 = c2;
                    c2 = c;
                    s2 = s;
                    let g = c * e[i];
                    let h = c * p;
                    r = p.hypot(e[i]);
                    e[i + 1] = s * r;
                    s = e[i] / r;
                    c = p / r;
                    p = c * d[i] - s * g;
                    d[i + 1] = h + s * (c * g + s * d[i]);

                    for k in 0..N {
                        let vh = v[k][i + 1];
                        v[k][i + 1] = s * v[k][i] + c * vh;
                        v[k][i] = c * v[k][i] - s * vh;
                    }
                }
                p = -s * s2 * c3 * el1 * e[l] / dl1;
                e[l] = s * p;
                d[l] = c * p;

                if e[l].abs() <= eps * tst1 {
                    break;
                }
            }
        }
        d[l] += f;
        e[l] = 0.0;
    }

    // Sort eigenvalues and corresponding vectors (ascending order)
    for i in 0..(N - 1) {
        let mut k = i;
        let mut p = d[i];
        for j in (i + 1)..N {
            if d[j] < p {
                k = j;
                p = d[j];
            }
        }
        if k != i {
            d[k] = d[i];
            d[i] = p;
            for row in v.iter_mut() {
                row.swap(i, k);
            }
        }
    }
}

const MAX_QL_SWEEPS: usize = 64;
