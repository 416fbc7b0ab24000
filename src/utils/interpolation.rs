//! Trilinear sampling of Fortran-ordered volumes
//!
//! Voxel (i, j, k) lives at `i + j*nx + k*nx*ny`, matching NIfTI.

/// Sample a volume at a continuous voxel coordinate
///
/// Neighbours outside the grid contribute zero, so points beyond half a
/// voxel outside the field of view fade to zero rather than clamping.
///
/// # Arguments
/// * `data` - Flattened volume of length nx*ny*nz
/// * `dims` - Volume dimensions (nx, ny, nz)
/// * `p` - Voxel coordinate (x, y, z)
pub fn trilinear(data: &[f64], dims: (usize, usize, usize), p: [f64; 3]) -> f64 {
    let (nx, ny, nz) = dims;
    if !(p[0].is_finite() && p[1].is_finite() && p[2].is_finite()) {
        return 0.0;
    }

    let x0 = p[0].floor();
    let y0 = p[1].floor();
    let z0 = p[2].floor();
    let fx = p[0] - x0;
    let fy = p[1] - y0;
    let fz = p[2] - z0;

    let (x0, y0, z0) = (x0 as i64, y0 as i64, z0 as i64);
    let fetch = |i: i64, j: i64, k: i64| -> f64 {
        if i < 0 || j < 0 || k < 0 || i >= nx as i64 || j >= ny as i64 || k >= nz as i64 {
            0.0
        } else {
            data[i as usize + j as usize * nx + k as usize * nx * ny]
        }
    };

    let mut value = 0.0;
    for (dk, wz) in [(0, 1.0 - fz), (1, fz)] {
        if wz == 0.0 {
            continue;
        }
        for (dj, wy) in [(0, 1.0 - fy), (1, fy)] {
            if wy == 0.0 {
                continue;
            }
            for (di, wx) in [(0, 1.0 - fx), (1, fx)] {
                if wx == 0.0 {
                    continue;
                }
                value += wx * wy * wz * fetch(x0 + di, y0 + dj, z0 + dk);
            }
        }
    }
    value
}

/// Nearest voxel index of a continuous coordinate, `None` outside the grid
#[inline]
pub fn nearest_voxel(dims: (usize, usize, usize), p: [f64; 3]) -> Option<(usize, usize, usize)> {
    let i = p[0].round();
    let j = p[1].round();
    let k = p[2].round();
    if !(i.is_finite() && j.is_finite() && k.is_finite()) {
        return None;
    }
    if i < 0.0 || j < 0.0 || k < 0.0 {
        return None;
    }
    let (i, j, k) = (i as usize, j as usize, k as usize);
    if i >= dims.0 || j >= dims.1 || k >= dims.2 {
        return None;
    }
    Some((i, j, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: (usize, usize, usize)) -> Vec<f64> {
        let (nx, ny, nz) = dims;
        let mut data = vec![0.0; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data[i + j * nx + k * nx * ny] = i as f64 + 10.0 * j as f64 + 100.0 * k as f64;
                }
            }
        }
        data
    }

    #[test]
    fn test_trilinear_exact_on_grid() {
        let dims = (4, 3, 2);
        let data = ramp(dims);
        assert_eq!(trilinear(&data, dims, [2.0, 1.0, 1.0]), 112.0);
        // Last voxel along each axis must not bleed into missing neighbours
        assert_eq!(trilinear(&data, dims, [3.0, 2.0, 1.0]), 123.0);
    }

    #[test]
    fn test_trilinear_linear_between_voxels() {
        let dims = (4, 3, 2);
        let data = ramp(dims);
        let v = trilinear(&data, dims, [1.5, 0.5, 0.5]);
        assert!((v - (1.5 + 5.0 + 50.0)).abs() < 1e-12);
    }

    #[test]
    fn test_trilinear_outside_is_zero() {
        let dims = (4, 3, 2);
        let data = ramp(dims);
        assert_eq!(trilinear(&data, dims, [-2.0, 0.0, 0.0]), 0.0);
        assert_eq!(trilinear(&data, dims, [0.0, 0.0, 5.0]), 0.0);
        assert_eq!(trilinear(&data, dims, [f64::NAN, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_nearest_voxel() {
        let dims = (4, 3, 2);
        assert_eq!(nearest_voxel(dims, [0.4, 1.6, 0.0]), Some((0, 2, 0)));
        assert_eq!(nearest_voxel(dims, [-0.4, 0.0, 0.0]), Some((0, 0, 0)));
        assert_eq!(nearest_voxel(dims, [-0.6, 0.0, 0.0]), None);
        assert_eq!(nearest_voxel(dims, [3.6, 0.0, 0.0]), None);
    }
}
