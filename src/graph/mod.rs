//! Connectivity graph construction and export

pub mod connectivity;
pub mod graphml;

pub use connectivity::{ConnectivityGraph, GraphSummary};
pub use graphml::GraphAttributes;
