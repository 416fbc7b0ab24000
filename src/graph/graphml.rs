//! GraphML serialisation
//!
//! Writes an undirected GraphML 1.0 document: graph-level descriptive
//! attributes, one node per region (`label`), one edge per connected pair
//! (`weight`). Output order follows the sorted labels, so identical graphs
//! serialise identically.

use std::fmt::{self, Write as _};
use std::path::Path;

use crate::error::PipelineError;

use super::connectivity::ConnectivityGraph;

/// Descriptive graph attributes
#[derive(Clone, Debug, PartialEq)]
pub struct GraphAttributes {
    /// Name of the diffusion acquisition the graph came from
    pub source: String,
    /// Name of the parcellation
    pub labels: String,
    pub region: String,
    pub sensor: String,
}

impl Default for GraphAttributes {
    fn default() -> Self {
        Self {
            source: String::new(),
            labels: String::new(),
            region: "brain".to_string(),
            sensor: "dwi".to_string(),
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

impl ConnectivityGraph {
    /// Render the graph as a GraphML document
    pub fn to_graphml(&self) -> Result<String, fmt::Error> {
        let mut doc = String::new();
        self.render(&mut doc)?;
        Ok(doc)
    }

    fn render(&self, doc: &mut String) -> fmt::Result {
        let attrs = self.attributes();
        writeln!(doc, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            doc,
            r#"<graphml xmlns="http://graphml.graphdrawing.org/xmlns" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="http://graphml.graphdrawing.org/xmlns http://graphml.graphdrawing.org/xmlns/1.0/graphml.xsd">"#
        )?;
        for (id, name, kind) in [
            ("g_name", "name", "string"),
            ("g_source", "source", "string"),
            ("g_labels", "labels", "string"),
            ("g_region", "region", "string"),
            ("g_sensor", "sensor", "string"),
            ("g_vcount", "vcount", "long"),
            ("g_ecount", "ecount", "long"),
        ] {
            writeln!(
                doc,
                r#"  <key id="{}" for="graph" attr.name="{}" attr.type="{}"/>"#,
                id, name, kind
            )?;
        }
        writeln!(doc, r#"  <key id="v_label" for="node" attr.name="label" attr.type="long"/>"#)?;
        writeln!(doc, r#"  <key id="e_weight" for="edge" attr.name="weight" attr.type="double"/>"#)?;

        writeln!(doc, r#"  <graph id="G" edgedefault="undirected">"#)?;
        for (id, value) in [
            ("g_name", escape(self.name())),
            ("g_source", escape(&attrs.source)),
            ("g_labels", escape(&attrs.labels)),
            ("g_region", escape(&attrs.region)),
            ("g_sensor", escape(&attrs.sensor)),
            ("g_vcount", self.node_count().to_string()),
            ("g_ecount", self.edge_count().to_string()),
        ] {
            writeln!(doc, r#"    <data key="{}">{}</data>"#, id, value)?;
        }

        for &label in self.nodes() {
            writeln!(doc, r#"    <node id="n{}">"#, label)?;
            writeln!(doc, r#"      <data key="v_label">{}</data>"#, label)?;
            writeln!(doc, "    </node>")?;
        }
        for (e, ((a, b), weight)) in self.edges().enumerate() {
            writeln!(doc, r#"    <edge id="e{}" source="n{}" target="n{}">"#, e, a, b)?;
            writeln!(doc, r#"      <data key="e_weight">{}</data>"#, weight as f64)?;
            writeln!(doc, "    </edge>")?;
        }

        writeln!(doc, "  </graph>")?;
        writeln!(doc, "</graphml>")
    }

    /// Write the graph as GraphML, replacing any existing file
    pub fn save_graph(&self, path: &Path) -> crate::error::Result<()> {
        let doc = self
            .to_graphml()
            .map_err(|e| PipelineError::io(path, format!("Failed to render graph: {}", e)))?;
        std::fs::write(path, doc)
            .map_err(|e| PipelineError::io(path, format!("Failed to write graph: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Streamline, StreamlineSet};
    use crate::volume::{Geometry, LabelVolume, Volume};

    fn graph() -> ConnectivityGraph {
        let g = Geometry::new((3, 1, 1), (1.0, 1.0, 1.0));
        let labels = LabelVolume::from_volume(&Volume::new(vec![4.0, 0.0, 7.0], g.clone()).unwrap()).unwrap();
        let mut graph = ConnectivityGraph::new("sub<01>", 2, labels)
            .unwrap()
            .with_attributes(GraphAttributes {
                source: "sub01_dwi".to_string(),
                labels: "desikan".to_string(),
                ..Default::default()
            });
        graph.make_graph(&StreamlineSet {
            geometry: g,
            streamlines: vec![Streamline { points: vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]] }],
        });
        graph
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a<b>&"c""#), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[test]
    fn test_graphml_content() {
        let doc = graph().to_graphml().unwrap();
        assert!(doc.starts_with("<?xml"));
        assert!(doc.contains(r#"edgedefault="undirected""#));
        assert!(doc.contains("sub&lt;01&gt;"));
        assert!(doc.contains(r#"<data key="g_labels">desikan</data>"#));
        assert!(doc.contains(r#"<data key="g_vcount">2</data>"#));
        assert!(doc.contains(r#"<node id="n4">"#));
        assert!(doc.contains(r#"<edge id="e0" source="n4" target="n7">"#));
        assert!(doc.contains(r#"<data key="e_weight">1</data>"#));
        assert!(doc.trim_end().ends_with("</graphml>"));
    }

    #[test]
    fn test_save_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.graphml");
        let graph = graph();
        graph.save_graph(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), graph.to_graphml().unwrap());
    }
}
