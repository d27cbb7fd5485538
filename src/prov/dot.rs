//! Graphviz rendering of a provenance graph.
//!
//! Node shapes and colours follow the usual PROV diagram convention: yellow
//! ellipses for entities, blue boxes for activities, orange houses for
//! agents. Attributes hang off their record as note-shaped annotations.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

use tracing::debug;

use super::json::format_time;
use super::{Document, Element, ElementKind, QualifiedName, RelationKind};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Bottom to top: derived artifacts sit above their sources.
    #[default]
    BottomTop,
    TopBottom,
    LeftRight,
    RightLeft,
}

impl Direction {
    pub fn rankdir(&self) -> &'static str {
        match self {
            Direction::BottomTop => "BT",
            Direction::TopBottom => "TB",
            Direction::LeftRight => "LR",
            Direction::RightLeft => "RL",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BT" => Ok(Direction::BottomTop),
            "TB" => Ok(Direction::TopBottom),
            "LR" => Ok(Direction::LeftRight),
            "RL" => Ok(Direction::RightLeft),
            _ => Err(Error::Configuration(format!("unknown graph direction '{s}'"))),
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_style(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Entity => "shape=oval, style=filled, fillcolor=\"#FFFC87\", color=\"#808080\"",
        ElementKind::Activity => "shape=box, style=filled, fillcolor=\"#9FB1FC\", color=\"#0000FF\"",
        ElementKind::Agent => "shape=house, style=filled, fillcolor=\"#FED37F\"",
    }
}

fn edge_style(kind: RelationKind) -> &'static str {
    match kind {
        RelationKind::Used => "color=\"#A3A3A3\"",
        RelationKind::WasGeneratedBy => "color=\"darkgreen\", fontcolor=\"darkgreen\"",
        RelationKind::WasAssociatedWith => "color=\"#FED37F\"",
        RelationKind::WasDerivedFrom => "color=\"#808080\"",
    }
}

fn annotation_label(element: &Element) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(start) = element.start_time {
        lines.push(format!("prov:startTime: {}", format_time(&start)));
    }
    if let Some(end) = element.end_time {
        lines.push(format!("prov:endTime: {}", format_time(&end)));
    }
    for (key, value) in &element.attributes {
        lines.push(format!("{key}: {value}"));
    }
    if lines.is_empty() {
        return None;
    }
    Some(
        lines
            .iter()
            .map(|line| escape(line))
            .collect::<Vec<_>>()
            .join("\\l")
            + "\\l",
    )
}

pub fn render(doc: &Document, direction: Direction) -> String {
    let mut out = String::new();
    out.push_str("digraph provenance {\n");
    out.push_str(&format!("  rankdir={};\n", direction.rankdir()));
    out.push_str("  charset=\"utf-8\";\n");
    out.push_str("  node [fontname=\"Helvetica\"];\n");
    out.push_str("  edge [fontname=\"Helvetica\", fontsize=10];\n\n");

    let mut node_ids: BTreeMap<&QualifiedName, String> = BTreeMap::new();
    let mut annotations = 0usize;

    for element in doc.elements() {
        let node = format!("n{}", node_ids.len());
        out.push_str(&format!(
            "  {node} [label=\"{}\", {}];\n",
            escape(&element.id.to_string()),
            node_style(element.kind),
        ));
        if let Some(label) = annotation_label(element) {
            let note = format!("ann{annotations}");
            annotations += 1;
            out.push_str(&format!(
                "  {note} [label=\"{label}\", shape=note, fontsize=9, color=\"gray\"];\n"
            ));
            out.push_str(&format!(
                "  {note} -> {node} [style=dashed, arrowhead=none, color=\"gray\"];\n"
            ));
        }
        node_ids.insert(&element.id, node);
    }

    // Relations may point at records the document does not describe.
    for relation in doc.relations() {
        for name in [&relation.subject, &relation.object] {
            if !node_ids.contains_key(name) {
                let node = format!("n{}", node_ids.len());
                out.push_str(&format!(
                    "  {node} [label=\"{}\", shape=oval, style=dashed];\n",
                    escape(&name.to_string()),
                ));
                node_ids.insert(name, node);
            }
        }
    }

    out.push('\n');
    for relation in doc.relations() {
        out.push_str(&format!(
            "  {} -> {} [label=\"{}\", {}];\n",
            node_ids[&relation.subject],
            node_ids[&relation.object],
            relation.kind.as_str(),
            edge_style(relation.kind),
        ));
    }
    out.push_str("}\n");
    out
}

/// Lays out DOT source with Graphviz and writes the result to `output`.
pub fn render_image(dot_program: &str, dot_source: &str, format: &str, output: &Path) -> Result<()> {
    debug!("Rendering provenance graph to {:?} with {}", output, dot_program);

    let mut child = Command::new(dot_program)
        .arg(format!("-T{format}"))
        .arg("-o")
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::tool(dot_program, format!("failed to spawn Graphviz: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(dot_source.as_bytes())
            .map_err(|e| Error::tool(dot_program, format!("failed to write DOT source: {e}")))?;
    }

    let result = child.wait_with_output()?;
    if !result.status.success() {
        return Err(Error::tool(
            dot_program,
            String::from_utf8_lossy(&result.stderr).trim().to_string(),
        ));
    }
    if !output.exists() {
        return Err(Error::MissingOutput {
            tool: dot_program.to_string(),
            path: output.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample() -> Document {
        let mut doc = Document::with_geo_namespaces();
        let saga = doc.agent(
            "saga_cmd",
            vec![("prov:type".into(), QualifiedName::prov("SoftwareAgent").into())],
        );
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let act = doc.activity("grid_tools_0_1714564800.000000", t, t);
        let raster = doc.entity_ref("dem_rsmpl_raster.tif");
        let out = doc.entity_ref("dem_rsmpl.tif");
        doc.used(&act, &raster);
        doc.was_generated_by(&out, &act);
        doc.was_associated_with(&act, &saga);
        doc.was_derived_from(&QualifiedName::parse("rsmpl_table.csv"), &QualifiedName::parse("dem_rsmpl.xyz"));
        doc
    }

    #[test]
    fn test_render_contains_nodes_and_edges() {
        let dot = render(&sample(), Direction::default());

        assert!(dot.starts_with("digraph provenance {"));
        assert!(dot.contains("rankdir=BT;"));
        assert!(dot.contains("label=\"saga_cmd\", shape=house"));
        assert!(dot.contains("label=\"grid_tools_0_1714564800.000000\", shape=box"));
        assert!(dot.contains("label=\"dem_rsmpl.tif\", shape=oval"));
        assert_eq!(dot.matches("[label=\"used\"").count(), 1);
        assert_eq!(dot.matches("[label=\"wasGeneratedBy\"").count(), 1);
        assert_eq!(dot.matches("[label=\"wasAssociatedWith\"").count(), 1);
        assert_eq!(dot.matches("[label=\"wasDerivedFrom\"").count(), 1);
    }

    #[test]
    fn test_undescribed_relation_targets_get_nodes() {
        let dot = render(&sample(), Direction::TopBottom);
        assert!(dot.contains("rankdir=TB;"));
        assert!(dot.contains("label=\"rsmpl_table.csv\", shape=oval, style=dashed"));
    }

    #[test]
    fn test_attributes_become_annotations() {
        let dot = render(&sample(), Direction::default());
        assert!(dot.contains("prov:type: prov:SoftwareAgent\\l"));
        assert!(dot.contains("prov:startTime: 2024-05-01T12:00:00.000000Z\\l"));
        assert!(dot.contains("shape=note"));
    }

    #[test]
    fn test_direction_names() {
        assert_eq!("lr".parse::<Direction>().unwrap(), Direction::LeftRight);
        assert!("up".parse::<Direction>().is_err());
    }

    #[test]
    fn test_missing_graphviz_is_a_tool_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let err = render_image(
            "geogear-no-such-dot-binary",
            "digraph {}",
            "png",
            &temp_dir.path().join("out.png"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ToolInvocation { .. }), "got {err:?}");
    }
}
