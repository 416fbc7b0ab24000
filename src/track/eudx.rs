//! Deterministic streamline tractography
//!
//! Euler integration along the principal diffusion direction of the
//! nearest voxel (EuDX). Every seed is tracked in both directions and the
//! halves are joined through the seed. Tracking is fully deterministic:
//! seeds come from a Halton sequence and results keep seed order.
//!
//! Coordinates are continuous voxel indices of the tracking grid.
//!
//! Reference:
//! Garyfallidis, E. (2012). "Towards an accurate brain tractography."
//! PhD thesis, University of Cambridge.

use std::path::Path;

use log::debug;
use rayon::prelude::*;

use crate::archive::{read_npz, write_npz, NpyArray, NpyData};
use crate::error::{PipelineError, Result};
use crate::utils::nearest_voxel;
use crate::volume::{BrainMask, Geometry};

use super::tensor::TensorField;

/// Tracking settings
#[derive(Clone, Debug)]
pub struct TrackingParams {
    pub seed_count: usize,
    /// Tracking stops in voxels below this anisotropy
    pub fa_threshold: f64,
    /// Step length in voxels
    pub step_size: f64,
    /// Largest turn between consecutive steps, degrees
    pub angle_threshold_deg: f64,
    /// Points per streamline, seed included
    pub max_points: usize,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            seed_count: 1_000_000,
            fa_threshold: 0.1,
            step_size: 0.5,
            angle_threshold_deg: 60.0,
            max_points: 1000,
        }
    }
}

/// Ordered polyline in voxel coordinates
#[derive(Clone, Debug, PartialEq)]
pub struct Streamline {
    pub points: Vec<[f64; 3]>,
}

impl Streamline {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// All streamlines of one run, on a known grid
#[derive(Clone, Debug)]
pub struct StreamlineSet {
    pub geometry: Geometry,
    pub streamlines: Vec<Streamline>,
}

impl StreamlineSet {
    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Streamline> {
        self.streamlines.iter()
    }

    pub fn total_points(&self) -> usize {
        self.streamlines.iter().map(|s| s.len()).sum()
    }

    /// Persist as an `.npz` archive: `points` (M, 3) concatenated,
    /// `offsets` and `lengths` per streamline
    pub fn write_archive(&self, path: &Path) -> Result<()> {
        let total = self.total_points();
        let mut points = Vec::with_capacity(total * 3);
        let mut offsets = Vec::with_capacity(self.len());
        let mut lengths = Vec::with_capacity(self.len());
        let mut offset = 0i64;
        for s in &self.streamlines {
            offsets.push(offset);
            lengths.push(s.len() as i64);
            offset += s.len() as i64;
            for p in &s.points {
                points.extend_from_slice(p);
            }
        }

        let entries = [
            ("points", NpyArray::f64(vec![total, 3], points)),
            ("offsets", NpyArray::i64(vec![offsets.len()], offsets)),
            ("lengths", NpyArray::i64(vec![lengths.len()], lengths)),
        ];
        write_npz(path, &entries).map_err(|e| PipelineError::io(path, e))
    }

    /// Load an archive written by [`StreamlineSet::write_archive`]
    pub fn read_archive(path: &Path, geometry: Geometry) -> Result<Self> {
        let members = read_npz(path).map_err(|e| PipelineError::io(path, e))?;
        let member = |name: &str| {
            members
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, a)| &a.data)
                .ok_or_else(|| PipelineError::io(path, format!("archive has no '{}' member", name)))
        };
        let (points, offsets, lengths) = match (member("points")?, member("offsets")?, member("lengths")?) {
            (NpyData::F64(p), NpyData::I64(o), NpyData::I64(l)) => (p, o, l),
            _ => return Err(PipelineError::io(path, "unexpected member types")),
        };
        if offsets.len() != lengths.len() || points.len() % 3 != 0 {
            return Err(PipelineError::io(path, "inconsistent streamline archive"));
        }

        let n_points = points.len() / 3;
        let mut streamlines = Vec::with_capacity(lengths.len());
        for (&offset, &length) in offsets.iter().zip(lengths) {
            let (start, len) = (offset.max(0) as usize, length.max(0) as usize);
            if start + len > n_points {
                return Err(PipelineError::io(path, "streamline extends past the point array"));
            }
            let pts = (start..start + len)
                .map(|i| [points[3 * i], points[3 * i + 1], points[3 * i + 2]])
                .collect();
            streamlines.push(Streamline { points: pts });
        }
        Ok(StreamlineSet { geometry, streamlines })
    }
}

/// Radical inverse of `index` in `base`, in (0, 1) for `index >= 1`
pub fn halton(mut index: usize, base: usize) -> f64 {
    let mut result = 0.0;
    let mut f = 1.0 / base as f64;
    while index > 0 {
        result += f * (index % base) as f64;
        index /= base;
        f /= base as f64;
    }
    result
}

/// Deterministic seeds inside the mask
///
/// Seed `s` lies in the `s mod n`-th mask voxel (Fortran order) with a
/// Halton (2, 3, 5) jitter in (-0.5, 0.5) along each axis.
pub fn seed_points(mask: &BrainMask, count: usize) -> Vec<[f64; 3]> {
    let voxels: Vec<usize> = (0..mask.voxels.len()).filter(|&i| mask.contains(i)).collect();
    if voxels.is_empty() {
        return Vec::new();
    }
    (0..count)
        .map(|s| {
            let (i, j, k) = mask.geometry.coords(voxels[s % voxels.len()]);
            [
                i as f64 + halton(s + 1, 2) - 0.5,
                j as f64 + halton(s + 1, 3) - 0.5,
                k as f64 + halton(s + 1, 5) - 0.5,
            ]
        })
        .collect()
}

struct Tracker<'a> {
    field: &'a TensorField,
    mask: &'a BrainMask,
    params: &'a TrackingParams,
    cos_threshold: f64,
}

impl Tracker<'_> {
    /// Voxel index of `p` when tracking may continue there
    fn trackable(&self, p: [f64; 3]) -> Option<usize> {
        let (i, j, k) = nearest_voxel(self.field.geometry.dims, p)?;
        let idx = self.field.geometry.index(i, j, k);
        if self.mask.contains(idx) && self.field.fa[idx] >= self.params.fa_threshold {
            Some(idx)
        } else {
            None
        }
    }

    /// Follow the field from `start`, not including `start` itself
    fn walk(&self, start: [f64; 3], initial: [f64; 3], budget: usize) -> Vec<[f64; 3]> {
        let mut out = Vec::new();
        let mut p = start;
        let mut dir = initial;
        let mut idx = match self.trackable(start) {
            Some(idx) => idx,
            None => return out,
        };

        while out.len() < budget {
            let mut v = self.field.principal[idx];
            let mut cos = v[0] * dir[0] + v[1] * dir[1] + v[2] * dir[2];
            if cos < 0.0 {
                v = [-v[0], -v[1], -v[2]];
                cos = -cos;
            }
            if cos < self.cos_threshold {
                break;
            }

            let step = self.params.step_size;
            let next = [p[0] + step * v[0], p[1] + step * v[1], p[2] + step * v[2]];
            idx = match self.trackable(next) {
                Some(idx) => idx,
                None => break,
            };
            out.push(next);
            p = next;
            dir = v;
        }
        out
    }

    fn track_seed(&self, seed: [f64; 3]) -> Option<Streamline> {
        let idx = self.trackable(seed)?;
        let d = self.field.principal[idx];
        let budget = self.params.max_points.saturating_sub(1);

        let forward = self.walk(seed, d, budget);
        let backward = self.walk(seed, [-d[0], -d[1], -d[2]], budget - forward.len());

        let mut points = Vec::with_capacity(backward.len() + 1 + forward.len());
        points.extend(backward.into_iter().rev());
        points.push(seed);
        points.extend(forward);
        if points.len() < 2 {
            return None;
        }
        Some(Streamline { points })
    }
}

/// Track from deterministic seeds through a tensor field
///
/// # Arguments
/// * `field` - Fitted tensors
/// * `mask` - Tracking domain on the same grid
/// * `params` - Seeding and stopping settings
///
/// # Returns
/// Streamlines in seed order; seeds that produce fewer than two points are
/// dropped.
pub fn track(field: &TensorField, mask: &BrainMask, params: &TrackingParams) -> Result<StreamlineSet> {
    if mask.voxels.len() != field.geometry.n_voxels() {
        return Err(PipelineError::contract(format!(
            "mask holds {} voxels, the tensor grid has {}",
            mask.voxels.len(),
            field.geometry.n_voxels()
        )));
    }
    if !(params.step_size > 0.0 && params.step_size.is_finite()) {
        return Err(PipelineError::contract(format!("step size must be positive, got {}", params.step_size)));
    }

    let tracker = Tracker {
        field,
        mask,
        params,
        cos_threshold: params.angle_threshold_deg.to_radians().cos(),
    };
    let seeds = seed_points(mask, params.seed_count);
    let streamlines: Vec<Streamline> = seeds
        .par_iter()
        .filter_map(|&seed| tracker.track_seed(seed))
        .collect();

    debug!(
        "{} seeds produced {} streamlines ({} points)",
        seeds.len(),
        streamlines.len(),
        streamlines.iter().map(|s| s.len()).sum::<usize>()
    );
    Ok(StreamlineSet {
        geometry: field.geometry.clone(),
        streamlines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uniform field with the given principal direction and FA everywhere
    fn uniform_field(dims: (usize, usize, usize), dir: [f64; 3], fa: f64) -> TensorField {
        let geometry = Geometry::new(dims, (1.0, 1.0, 1.0));
        let n = geometry.n_voxels();
        TensorField {
            geometry,
            tensors: vec![[0.0; 6]; n],
            evals: vec![[1.0, 0.2, 0.2]; n],
            principal: vec![dir; n],
            fa: vec![fa; n],
        }
    }

    #[test]
    fn test_halton_values() {
        assert_eq!(halton(1, 2), 0.5);
        assert_eq!(halton(2, 2), 0.25);
        assert_eq!(halton(3, 2), 0.75);
        assert!((halton(1, 3) - 1.0 / 3.0).abs() < 1e-15);
        assert!((halton(4, 5) - 0.8).abs() < 1e-15);
    }

    #[test]
    fn test_seeds_stay_in_mask() {
        let g = Geometry::new((4, 4, 1), (1.0, 1.0, 1.0));
        let mut mask = BrainMask { voxels: vec![0; 16], geometry: g.clone() };
        mask.voxels[g.index(1, 2, 0)] = 1;
        mask.voxels[g.index(3, 0, 0)] = 1;

        let seeds = seed_points(&mask, 50);
        assert_eq!(seeds.len(), 50);
        for p in &seeds {
            let (i, j, k) = nearest_voxel(g.dims, *p).unwrap();
            assert!(mask.contains(g.index(i, j, k)));
        }
        assert_eq!(seed_points(&mask, 50), seeds);
    }

    #[test]
    fn test_empty_mask_no_seeds() {
        let g = Geometry::new((2, 2, 2), (1.0, 1.0, 1.0));
        let mask = BrainMask { voxels: vec![0; 8], geometry: g };
        assert!(seed_points(&mask, 10).is_empty());
    }

    #[test]
    fn test_straight_field_spans_volume() {
        let field = uniform_field((10, 3, 3), [1.0, 0.0, 0.0], 0.8);
        let mask = BrainMask::full(field.geometry.clone());
        let params = TrackingParams { seed_count: 20, ..Default::default() };

        let set = track(&field, &mask, &params).unwrap();
        assert_eq!(set.len(), 20);
        for s in set.iter() {
            let xs: Vec<f64> = s.points.iter().map(|p| p[0]).collect();
            let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
            let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            assert!(min < 0.5 && max > 8.5, "streamline spans {}..{}", min, max);
            // y and z never change along an x-aligned field
            assert!(s.points.iter().all(|p| p[1] == s.points[0][1] && p[2] == s.points[0][2]));
        }
    }

    #[test]
    fn test_tracking_stops_at_mask_boundary() {
        let field = uniform_field((12, 3, 3), [1.0, 0.0, 0.0], 0.8);
        let g = field.geometry.clone();
        let mut mask = BrainMask::full(g.clone());
        for idx in 0..g.n_voxels() {
            if g.coords(idx).0 >= 6 {
                mask.voxels[idx] = 0;
            }
        }
        let params = TrackingParams { seed_count: 200, ..Default::default() };

        let set = track(&field, &mask, &params).unwrap();
        assert!(!set.is_empty());
        for s in set.iter() {
            for p in &s.points {
                let (i, j, k) = nearest_voxel(g.dims, *p).unwrap();
                assert!(mask.contains(g.index(i, j, k)), "point {:?} left the mask", p);
            }
        }
        let max_x = set.iter().flat_map(|s| s.points.iter()).map(|p| p[0]).fold(f64::NEG_INFINITY, f64::max);
        assert!(max_x < 5.5);
    }

    #[test]
    fn test_low_fa_stops_tracking() {
        let field = uniform_field((6, 2, 2), [1.0, 0.0, 0.0], 0.05);
        let mask = BrainMask::full(field.geometry.clone());
        let params = TrackingParams { seed_count: 10, ..Default::default() };
        let set = track(&field, &mask, &params).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_sharp_turn_stops_tracking() {
        let mut field = uniform_field((8, 1, 1), [1.0, 0.0, 0.0], 0.8);
        // perpendicular directions beyond x = 4
        for i in 5..8 {
            field.principal[i] = [0.0, 1.0, 0.0];
        }
        let mask = BrainMask::full(field.geometry.clone());
        let params = TrackingParams { seed_count: 1, ..Default::default() };
        let set = track(&field, &mask, &params).unwrap();
        let s = &set.streamlines[0];
        assert!(s.points.iter().all(|p| p[0] < 5.5));
    }

    #[test]
    fn test_max_points_respected() {
        let field = uniform_field((40, 1, 1), [1.0, 0.0, 0.0], 0.8);
        let mask = BrainMask::full(field.geometry.clone());
        let params = TrackingParams { seed_count: 5, max_points: 7, ..Default::default() };
        let set = track(&field, &mask, &params).unwrap();
        assert!(set.iter().all(|s| s.len() <= 7 && s.len() >= 2));
    }

    #[test]
    fn test_fibers_archive_layout() {
        let g = Geometry::new((4, 4, 4), (1.0, 1.0, 1.0));
        let set = StreamlineSet {
            geometry: g,
            streamlines: vec![
                Streamline { points: vec![[0.0; 3], [1.0, 0.0, 0.0]] },
                Streamline { points: vec![[0.0; 3], [0.0, 1.0, 0.0], [0.0, 2.0, 0.0]] },
            ],
        };
        assert_eq!(set.total_points(), 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fibers.npz");
        set.write_archive(&path).unwrap();
        let text = String::from_utf8_lossy(&std::fs::read(&path).unwrap()).into_owned();
        assert!(text.contains("points.npy"));
        assert!(text.contains("'shape': (5, 3)"));
        assert!(text.contains("offsets.npy"));
        assert!(text.contains("lengths.npy"));

        let back = StreamlineSet::read_archive(&path, set.geometry.clone()).unwrap();
        assert_eq!(back.streamlines, set.streamlines);
    }
}
