//! Gradient table construction
//!
//! Pairs each diffusion volume with its b-value and unit gradient direction,
//! then canonicalizes the diffusion stack so that a b0 volume comes first.
//!
//! File conventions follow FSL: the b-value file is a flat list of numbers,
//! the b-vector file a 3xN matrix (N×3 is also accepted).

use std::fmt;
use std::path::Path;

use log::{debug, info};

use crate::error::{PipelineError, Result};
use crate::nifti_io;

/// Entries with b-value at or below this are treated as unweighted (b0)
pub const DEFAULT_B0_THRESHOLD: f64 = 50.0;

/// Per-volume acquisition parameters, in stack order
#[derive(Clone, Debug, PartialEq)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    b0_threshold: f64,
}

impl GradientTable {
    /// Validate and normalise a table
    ///
    /// Directions of weighted entries are scaled to unit length; b0 entries
    /// get a zero vector.
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>, b0_threshold: f64) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(PipelineError::contract(format!(
                "{} b-values but {} b-vectors",
                bvals.len(),
                bvecs.len()
            )));
        }
        if bvals.is_empty() {
            return Err(PipelineError::contract("gradient table is empty"));
        }

        let mut unit = Vec::with_capacity(bvecs.len());
        for (i, (&b, v)) in bvals.iter().zip(bvecs.iter()).enumerate() {
            if !b.is_finite() || b < 0.0 {
                return Err(PipelineError::contract(format!("invalid b-value {} at entry {}", b, i)));
            }
            if b <= b0_threshold {
                unit.push([0.0; 3]);
                continue;
            }
            let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            if !norm.is_finite() || norm < 1e-8 {
                return Err(PipelineError::contract(format!(
                    "entry {} has b = {} but no gradient direction",
                    i, b
                )));
            }
            unit.push([v[0] / norm, v[1] / norm, v[2] / norm]);
        }

        Ok(GradientTable { bvals, bvecs: unit, b0_threshold })
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn b0s_mask(&self) -> Vec<bool> {
        self.bvals.iter().map(|&b| b <= self.b0_threshold).collect()
    }

    pub fn b0_count(&self) -> usize {
        self.bvals.iter().filter(|&&b| b <= self.b0_threshold).count()
    }

    /// Index of the first unweighted entry
    pub fn first_b0(&self) -> Option<usize> {
        self.bvals.iter().position(|&b| b <= self.b0_threshold)
    }

    /// Table with entries permuted: entry `t` of the result is `order[t]`
    pub fn reordered(&self, order: &[usize]) -> Self {
        GradientTable {
            bvals: order.iter().map(|&t| self.bvals[t]).collect(),
            bvecs: order.iter().map(|&t| self.bvecs[t]).collect(),
            b0_threshold: self.b0_threshold,
        }
    }
}

impl fmt::Display for GradientTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min = self.bvals.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.bvals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        write!(
            f,
            "{} entries, b-values {:.0}..{:.0}, {} b0 (threshold {})",
            self.len(),
            min,
            max,
            self.b0_count(),
            self.b0_threshold
        )
    }
}

/// Parse a numeric text matrix; rows are lines, columns split on whitespace or commas
fn parse_matrix(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::io(path, format!("Failed to read file: {}", e)))?;

    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let row: std::result::Result<Vec<f64>, _> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| tok.parse::<f64>())
            .collect();
        let row = row.map_err(|e| {
            PipelineError::io(path, format!("line {}: {}", line_no + 1, e))
        })?;
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Read FSL-style b-value and b-vector files
pub fn read_bvals_bvecs(bval_path: &Path, bvec_path: &Path) -> Result<(Vec<f64>, Vec<[f64; 3]>)> {
    let bvals: Vec<f64> = parse_matrix(bval_path)?.into_iter().flatten().collect();

    let mut rows = parse_matrix(bvec_path)?;
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    if let Some(bad) = rows.iter().position(|r| r.len() != width) {
        return Err(PipelineError::contract(format!(
            "b-vector file '{}' is ragged: row {} has {} values, row 1 has {}",
            bvec_path.display(),
            bad + 1,
            rows[bad].len(),
            width
        )));
    }

    // FSL stores one direction per column
    if width != 3 && rows.len() == 3 {
        rows = (0..width)
            .map(|c| rows.iter().map(|r| r[c]).collect())
            .collect();
    }
    if rows.first().map(|r| r.len()) != Some(3) {
        return Err(PipelineError::contract(format!(
            "b-vector file '{}' must hold 3 components per direction",
            bvec_path.display()
        )));
    }
    let bvecs = rows.iter().map(|r| [r[0], r[1], r[2]]).collect();

    Ok((bvals, bvecs))
}

/// Volume order that moves the first b0 to the front, keeping the rest in place
pub fn canonical_order(table: &GradientTable) -> Option<Vec<usize>> {
    let first = table.first_b0()?;
    let mut order = Vec::with_capacity(table.len());
    order.push(first);
    order.extend((0..table.len()).filter(|&t| t != first));
    Some(order)
}

/// Build the gradient table and write the canonicalized reference stack
///
/// # Arguments
/// * `bval_path`, `bvec_path` - Acquisition files
/// * `dwi_path` - 4-D diffusion stack
/// * `reference_path` - Destination of the reordered stack
/// * `b0_threshold` - Largest b-value treated as unweighted
///
/// # Returns
/// The table in canonical order (first b0 at index 0). Nothing is written
/// when the table and the stack disagree.
pub fn build_gradient_table(
    bval_path: &Path,
    bvec_path: &Path,
    dwi_path: &Path,
    reference_path: &Path,
    b0_threshold: f64,
) -> Result<GradientTable> {
    let (bvals, bvecs) = read_bvals_bvecs(bval_path, bvec_path)?;
    let table = GradientTable::new(bvals, bvecs, b0_threshold)?;
    debug!("gradient table: {}", table);

    let stack = nifti_io::read_stack(dwi_path)?;
    if table.len() != stack.n_volumes {
        return Err(PipelineError::contract(format!(
            "gradient table has {} entries but '{}' has {} volumes",
            table.len(),
            dwi_path.display(),
            stack.n_volumes
        )));
    }

    let order = canonical_order(&table).ok_or_else(|| {
        PipelineError::contract(format!(
            "no b0 volume (b <= {}) in the gradient table",
            b0_threshold
        ))
    })?;
    if order[0] != 0 {
        info!("moving b0 volume {} to the front of the stack", order[0]);
    }

    let reference = stack.reordered(&order)?;
    nifti_io::write_stack(reference_path, &reference)?;
    Ok(table.reordered(&order))
}
