//! Provenance Exporter.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::config::ExportFormat;
use crate::error::{Error, Result};
use crate::prov::dot::{self, Direction};
use crate::prov::{json, turtle, xml, Document};
use crate::workspace::{Workspace, PROV_FILE_PREFIX};

#[derive(Debug)]
pub struct FailedExport {
    pub format: ExportFormat,
    pub error: Error,
}

/// Files written by one export, and the formats that could not be written.
#[derive(Debug, Default)]
pub struct Exported {
    pub written: Vec<PathBuf>,
    pub failed: Vec<FailedExport>,
}

impl Exported {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Exporter {
    dot_program: String,
    direction: Direction,
}

impl Default for Exporter {
    fn default() -> Self {
        Self {
            dot_program: "dot".to_string(),
            direction: Direction::default(),
        }
    }
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `GEOGEAR_DOT` as the Graphviz binary when set.
    pub fn from_env() -> Self {
        Self {
            dot_program: env::var("GEOGEAR_DOT").unwrap_or_else(|_| "dot".to_string()),
            ..Self::default()
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_dot_program(mut self, program: impl Into<String>) -> Self {
        self.dot_program = program.into();
        self
    }

    /// Writes `output/provenance/GEOGEAR-prov.<ext>` for every requested
    /// format. Each format is written independently; one that fails is
    /// reported in [`Exported::failed`] and the others are still written.
    pub fn export(
        &self,
        doc: &Document,
        workspace: &Workspace,
        formats: &BTreeSet<ExportFormat>,
    ) -> Exported {
        let mut exported = Exported::default();
        let dir = workspace.provenance_dir();
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Cannot create {:?}: {}", dir, e);
            exported.failed = formats
                .iter()
                .map(|&format| FailedExport {
                    format,
                    error: Error::Serialization(format!("cannot create {}: {e}", dir.display())),
                })
                .collect();
            return exported;
        }

        for &format in formats {
            let path = dir.join(format!("{PROV_FILE_PREFIX}.{}", format.extension()));
            match self.write_format(doc, format, &path) {
                Ok(()) => {
                    info!("Exported provenance as {}: {:?}", format, path);
                    exported.written.push(path);
                }
                Err(error) => {
                    error!("Failed to export provenance as {}: {}", format, error);
                    exported.failed.push(FailedExport { format, error });
                }
            }
        }
        exported
    }

    fn write_format(&self, doc: &Document, format: ExportFormat, path: &Path) -> Result<()> {
        match format {
            ExportFormat::Json => json::write(doc, path),
            ExportFormat::Xml => xml::write(doc, path),
            ExportFormat::Rdf => turtle::write(doc, path),
            ExportFormat::Png | ExportFormat::Pdf => {
                let source = dot::render(doc, self.direction);
                dot::render_image(&self.dot_program, &source, format.extension(), path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn listing(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_exports_only_requested_formats() {
        let temp_dir = TempDir::new().unwrap();
        let ws = Workspace::new(temp_dir.path());
        let mut doc = Document::with_geo_namespaces();
        doc.entity_ref("grid.csv");

        let formats = BTreeSet::from([ExportFormat::Json, ExportFormat::Rdf]);
        let exported = Exporter::new().export(&doc, &ws, &formats);

        assert!(exported.is_complete());
        assert_eq!(exported.written.len(), 2);
        assert_eq!(
            listing(&ws.provenance_dir()),
            vec!["GEOGEAR-prov.json", "GEOGEAR-prov.ttl"]
        );
    }

    #[test]
    fn test_missing_graphviz_fails_only_the_image_formats() {
        let temp_dir = TempDir::new().unwrap();
        let ws = Workspace::new(temp_dir.path());
        let exporter = Exporter::new().with_dot_program("geogear-no-such-dot");

        // PNG sorts before JSON, so the JSON file is written after the failure.
        let formats = BTreeSet::from([ExportFormat::Png, ExportFormat::Json]);
        let exported = exporter.export(&Document::new(), &ws, &formats);

        assert_eq!(exported.failed.len(), 1);
        assert_eq!(exported.failed[0].format, ExportFormat::Png);
        assert!(matches!(exported.failed[0].error, Error::ToolInvocation { .. }));
        assert_eq!(exported.written, vec![ws.provenance_dir().join("GEOGEAR-prov.json")]);
        assert_eq!(listing(&ws.provenance_dir()), vec!["GEOGEAR-prov.json"]);
    }
}
