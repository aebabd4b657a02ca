//! Loading regional latency graphs from GraphML files.
//!
//! Datasets such as cloudping or WonderNetwork are exported as directed
//! GraphML graphs whose edges carry a `latency` attribute in milliseconds.
//! Region vertices become transparent relays prefixed with `internet_`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use xmltree::{Element, XMLNode};

use crate::network::topology::{Topology, TopologyError};
use crate::network::types::Connection;

/// Prefix applied to every ingested region vertex.
pub const NODE_PREFIX: &str = "internet_";

/// The ways loading a regional graph can fail.
#[derive(Debug, thiserror::Error)]
pub enum InetError {
    /// The graph file could not be read.
    #[error("failed to read graph file")]
    Io(#[from] std::io::Error),

    /// The file is not well-formed XML.
    #[error("malformed GraphML document")]
    Xml(#[from] xmltree::ParseError),

    /// The document declares no edge attribute named `latency`.
    #[error("GraphML defines no edge attribute named `latency`")]
    MissingLatencyKey,

    /// The document has no `<graph>` element.
    #[error("GraphML document has no <graph> element")]
    MissingGraph,

    /// An edge lacks its latency datum.
    #[error("edge {from} -> {target} is missing its latency value")]
    MissingLatency {
        /// Edge source region.
        from: String,
        /// Edge target region.
        target: String,
    },

    /// A latency datum is not a number.
    #[error("invalid latency value `{0}`")]
    InvalidLatency(String),

    /// The ingested edges violate a topology invariant.
    #[error("invalid topology")]
    Topology(#[from] TopologyError),
}

impl Topology {
    /// Loads the latest regional latency graph for `source` from `dir`.
    pub fn load_inet_graph(&mut self, source: &str, dir: impl AsRef<Path>) -> Result<(), InetError> {
        self.load_inet_graph_tagged(source, "latest", dir)
    }

    /// Loads `<source>_<tag>.graphml` from `dir`. Tags are `latest` or a
    /// `YYYY_MM_DD` snapshot date.
    pub fn load_inet_graph_tagged(
        &mut self,
        source: &str,
        tag: &str,
        dir: impl AsRef<Path>,
    ) -> Result<(), InetError> {
        let path = dir.as_ref().join(format!("{source}_{tag}.graphml"));
        tracing::debug!(path = %path.display(), "loading regional latency graph");
        let file = BufReader::new(File::open(&path)?);
        let root = Element::parse(file)?;

        let latency_key = elements(&root)
            .filter(|e| e.name == "key")
            .find(|e| e.attributes.get("attr.name").map(String::as_str) == Some("latency"))
            .and_then(|e| e.attributes.get("id").cloned())
            .ok_or(InetError::MissingLatencyKey)?;
        let graph = elements(&root)
            .find(|e| e.name == "graph")
            .ok_or(InetError::MissingGraph)?;
        let directed = graph.attributes.get("edgedefault").map(String::as_str) != Some("undirected");

        for edge in elements(graph).filter(|e| e.name == "edge") {
            let (Some(source), Some(target)) = (
                edge.attributes.get("source"),
                edge.attributes.get("target"),
            ) else {
                continue;
            };
            let value = elements(edge)
                .find(|d| d.name == "data" && d.attributes.get("key") == Some(&latency_key))
                .and_then(Element::get_text)
                .ok_or_else(|| InetError::MissingLatency {
                    from: source.clone(),
                    target: target.clone(),
                })?;
            let latency: f64 = value
                .trim()
                .parse()
                .map_err(|_| InetError::InvalidLatency(value.into_owned()))?;
            let connection = Connection::new(
                format!("{NODE_PREFIX}{source}"),
                format!("{NODE_PREFIX}{target}"),
            )
            .with_latency(latency);
            self.add_connection(connection, directed)?;
        }
        Ok(())
    }
}

fn elements(parent: &Element) -> impl Iterator<Item = &Element> {
    parent.children.iter().filter_map(|node| match node {
        XMLNode::Element(element) => Some(element),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::network::types::{Link, Node};

    const GRAPHML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<graphml xmlns="http://graphml.graphdrawing.org/xmlns">
  <key id="d0" for="edge" attr.name="latency" attr.type="double"/>
  <graph edgedefault="directed">
    <node id="eu-west-1"/>
    <node id="us-east-1"/>
    <edge source="eu-west-1" target="us-east-1"><data key="d0">37.5</data></edge>
    <edge source="us-east-1" target="eu-west-1"><data key="d0">37.5</data></edge>
  </graph>
</graphml>
"#;

    #[test]
    fn loads_latencies_between_prefixed_regions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = File::create(dir.path().join("cloudping_latest.graphml"))?;
        file.write_all(GRAPHML.as_bytes())?;
        drop(file);

        let mut topo = Topology::new();
        topo.load_inet_graph("cloudping", dir.path())?;

        // attach one host per region and measure across the backbone
        let a = topo.add_node(Node::new("a"));
        let b = topo.add_node(Node::new("b"));
        let la = topo.add_link(Link::new(1000.0));
        let lb = topo.add_link(Link::new(1000.0));
        topo.add_connection(Connection::new(a, la), false)?;
        topo.add_connection(Connection::new(la, "internet_eu-west-1"), false)?;
        topo.add_connection(Connection::new(b, lb), false)?;
        topo.add_connection(Connection::new(lb, "internet_us-east-1"), false)?;

        approx::assert_relative_eq!(topo.latency(a, b, false), 37.5);
        Ok(())
    }

    #[test]
    fn missing_file_reports_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut topo = Topology::new();
        assert!(matches!(
            topo.load_inet_graph("nowhere", dir.path()),
            Err(InetError::Io(_))
        ));
    }

    #[test]
    fn missing_latency_key_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = File::create(dir.path().join("x_latest.graphml"))?;
        file.write_all(b"<graphml><graph edgedefault=\"directed\"/></graphml>")?;
        drop(file);
        let mut topo = Topology::new();
        assert!(matches!(
            topo.load_inet_graph("x", dir.path()),
            Err(InetError::MissingLatencyKey)
        ));
        Ok(())
    }
}
