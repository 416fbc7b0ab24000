//! Region-to-region connectivity from streamlines
//!
//! Nodes are the distinct non-zero labels of the parcellation. A streamline
//! connects every pair of regions it passes through; edge weight counts the
//! streamlines doing so. A streamline confined to one region adds nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{PipelineError, Result};
use crate::track::StreamlineSet;
use crate::utils::nearest_voxel;
use crate::volume::LabelVolume;

use super::graphml::GraphAttributes;

/// Undirected weighted graph over atlas regions
#[derive(Clone, Debug)]
pub struct ConnectivityGraph {
    name: String,
    labels: LabelVolume,
    nodes: Vec<u32>,
    /// Keyed by (smaller label, larger label)
    edges: BTreeMap<(u32, u32), u64>,
    attributes: GraphAttributes,
}

impl ConnectivityGraph {
    /// Empty graph with one node per region
    ///
    /// `label_count` is the number of regions the caller expects; it must
    /// equal the number of distinct non-zero labels in `labels`.
    pub fn new(name: impl Into<String>, label_count: usize, labels: LabelVolume) -> Result<Self> {
        let nodes = labels.distinct_labels();
        if nodes.len() != label_count {
            return Err(PipelineError::contract(format!(
                "expected {} regions but the label volume has {}",
                label_count,
                nodes.len()
            )));
        }
        Ok(ConnectivityGraph {
            name: name.into(),
            labels,
            nodes,
            edges: BTreeMap::new(),
            attributes: GraphAttributes::default(),
        })
    }

    /// Replace the descriptive attributes written with the graph
    pub fn with_attributes(mut self, attributes: GraphAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn attributes(&self) -> &GraphAttributes {
        &self.attributes
    }

    /// Accumulate edges from a streamline set
    ///
    /// Points are rounded to the nearest voxel of the label grid. Points off
    /// the grid and background voxels are ignored.
    pub fn make_graph(&mut self, streamlines: &StreamlineSet) {
        let dims = self.labels.geometry.dims;
        for s in streamlines.iter() {
            let visited: BTreeSet<u32> = s
                .points
                .iter()
                .filter_map(|&p| nearest_voxel(dims, p))
                .map(|(i, j, k)| self.labels.label_at(i, j, k))
                .filter(|&l| l != 0)
                .collect();

            let visited: Vec<u32> = visited.into_iter().collect();
            for (a_pos, &a) in visited.iter().enumerate() {
                for &b in &visited[a_pos + 1..] {
                    *self.edges.entry((a, b)).or_insert(0) += 1;
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[u32] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges in (label, label) order with their weights
    pub fn edges(&self) -> impl Iterator<Item = ((u32, u32), u64)> + '_ {
        self.edges.iter().map(|(&k, &w)| (k, w))
    }

    /// Weight between two regions, 0 when unconnected
    pub fn weight(&self, a: u32, b: u32) -> u64 {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.edges.get(&key).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> GraphSummary {
        let mut degree: BTreeMap<u32, usize> = self.nodes.iter().map(|&n| (n, 0)).collect();
        for &(a, b) in self.edges.keys() {
            *degree.entry(a).or_insert(0) += 1;
            *degree.entry(b).or_insert(0) += 1;
        }
        let degrees: Vec<usize> = degree.values().copied().collect();
        let (min_degree, max_degree, mean_degree) = if degrees.is_empty() {
            (0, 0, 0.0)
        } else {
            (
                degrees.iter().copied().min().unwrap_or(0),
                degrees.iter().copied().max().unwrap_or(0),
                degrees.iter().sum::<usize>() as f64 / degrees.len() as f64,
            )
        };

        GraphSummary {
            name: self.name.clone(),
            node_count: self.node_count(),
            edge_count: self.edge_count(),
            total_weight: self.edges.values().sum(),
            min_degree,
            max_degree,
            mean_degree,
            isolated_nodes: degrees.iter().filter(|&&d| d == 0).count(),
        }
    }
}

/// Descriptive statistics of a connectivity graph
#[derive(Clone, Debug, PartialEq)]
pub struct GraphSummary {
    pub name: String,
    pub node_count: usize,
    pub edge_count: usize,
    pub total_weight: u64,
    pub min_degree: usize,
    pub max_degree: usize,
    pub mean_degree: f64,
    pub isolated_nodes: usize,
}

impl fmt::Display for GraphSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph: {}", self.name)?;
        writeln!(f, "  Nodes:          {}", self.node_count)?;
        writeln!(f, "  Edges:          {}", self.edge_count)?;
        writeln!(f, "  Total weight:   {}", self.total_weight)?;
        writeln!(
            f,
            "  Degree:         min {} / max {} / mean {:.2}",
            self.min_degree, self.max_degree, self.mean_degree
        )?;
        write!(f, "  Isolated nodes: {}", self.isolated_nodes)
    }
}
