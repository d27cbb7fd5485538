//! Stage configuration: which analysis stages run and which layers feed them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Cell size used when the configuration does not name one.
pub const DEFAULT_CELL_SIZE: f64 = 100.0;

/// Pipeline stages, declared in the order the dispatcher runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Grid,
    Coverages,
    Resample,
    PresenceAbsence,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Grid,
        StageKind::Coverages,
        StageKind::Resample,
        StageKind::PresenceAbsence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Grid => "grid",
            StageKind::Coverages => "coverages",
            StageKind::Resample => "resample",
            StageKind::PresenceAbsence => "presence_absence",
        }
    }

    /// Tag embedded in intermediate artifact names.
    pub fn tag(&self) -> &'static str {
        match self {
            StageKind::Grid => "grid",
            StageKind::Coverages => "cov",
            StageKind::Resample => "rsmpl",
            StageKind::PresenceAbsence => "pa",
        }
    }

    /// File name of the stage's joined output table.
    pub fn table_name(&self) -> &'static str {
        match self {
            StageKind::Grid => "grid.csv",
            StageKind::Coverages => "cov_table.csv",
            StageKind::Resample => "rsmpl_table.csv",
            StageKind::PresenceAbsence => "pa_table.csv",
        }
    }

    /// Name of the value column in the stage's output table.
    pub fn value_column(&self) -> &'static str {
        match self {
            StageKind::Coverages => "proportion",
            _ => "value",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A layer file and the URL it is retrieved from.
///
/// In configuration files each layer is a single-entry object
/// `{"forest.shp": "https://..."}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct LayerSpec {
    pub filename: String,
    pub url: String,
}

impl LayerSpec {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
        }
    }

    /// File name without its extension.
    pub fn name(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
    }
}

impl TryFrom<BTreeMap<String, String>> for LayerSpec {
    type Error = Error;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self> {
        if map.len() != 1 {
            return Err(Error::Configuration(format!(
                "a layer must be a single {{filename: url}} entry, found {} entries",
                map.len()
            )));
        }
        let (filename, url) = map.into_iter().next().ok_or_else(|| {
            Error::Configuration("a layer must be a single {filename: url} entry".to_string())
        })?;
        if filename.trim().is_empty() {
            return Err(Error::Configuration("layer filename is empty".to_string()));
        }
        Ok(LayerSpec { filename, url })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportFormat {
    Png,
    Pdf,
    Json,
    Xml,
    Rdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Json => "json",
            ExportFormat::Xml => "xml",
            ExportFormat::Rdf => "ttl",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Png => "PNG",
            ExportFormat::Pdf => "PDF",
            ExportFormat::Json => "JSON",
            ExportFormat::Xml => "XML",
            ExportFormat::Rdf => "RDF",
        };
        f.write_str(name)
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PNG" => Ok(ExportFormat::Png),
            "PDF" => Ok(ExportFormat::Pdf),
            "JSON" => Ok(ExportFormat::Json),
            "XML" => Ok(ExportFormat::Xml),
            "RDF" | "TTL" | "TURTLE" => Ok(ExportFormat::Rdf),
            _ => Err(Error::Serialization(format!(
                "unsupported export format '{s}'"
            ))),
        }
    }
}

fn default_cell_size() -> f64 {
    DEFAULT_CELL_SIZE
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageConfig {
    /// Target CRS as a PROJ.4 string.
    pub projection: String,
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
    #[serde(default)]
    pub stages: BTreeMap<StageKind, Vec<LayerSpec>>,
    #[serde(default)]
    pub export: BTreeSet<ExportFormat>,
}

impl StageConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: StageConfig = serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid stage configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.projection.trim().is_empty() {
            return Err(Error::Configuration("projection is empty".to_string()));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(Error::Configuration(format!(
                "cell size must be positive, got {}",
                self.cell_size
            )));
        }
        for (stage, layers) in &self.stages {
            let mut seen = BTreeSet::new();
            for layer in layers {
                if !seen.insert(layer.name()) {
                    return Err(Error::Configuration(format!(
                        "layer name '{}' appears twice in stage {stage}",
                        layer.name()
                    )));
                }
            }
            if *stage == StageKind::Grid && layers.len() > 1 {
                return Err(Error::Configuration(
                    "the grid stage takes exactly one mask layer".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Configured stages with at least one layer, in run order.
    pub fn populated_stages(&self) -> impl Iterator<Item = (StageKind, &[LayerSpec])> {
        self.stages
            .iter()
            .filter(|(_, layers)| !layers.is_empty())
            .map(|(kind, layers)| (*kind, layers.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "projection": "+proj=utm +zone=23 +south +datum=WGS84 +units=m +no_defs",
        "stages": {
            "presence_absence": [{"wells.gpkg": "https://example.org/wells"}],
            "coverages": [
                {"forest.shp": "https://example.org/forest"},
                {"soil.tif": "https://example.org/soil"}
            ]
        },
        "export": ["JSON", "PNG"]
    }"#;

    #[test]
    fn test_parse_stage_config() {
        let config = StageConfig::from_json(CONFIG).unwrap();

        assert_eq!(config.cell_size, DEFAULT_CELL_SIZE);
        assert_eq!(config.stages[&StageKind::Coverages].len(), 2);
        assert_eq!(
            config.stages[&StageKind::Coverages][0],
            LayerSpec::new("forest.shp", "https://example.org/forest")
        );
        assert!(config.export.contains(&ExportFormat::Json));
        assert!(config.export.contains(&ExportFormat::Png));
    }

    #[test]
    fn test_populated_stages_follow_run_order() {
        let config = StageConfig::from_json(CONFIG).unwrap();
        let kinds: Vec<_> = config.populated_stages().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![StageKind::Coverages, StageKind::PresenceAbsence]);
    }

    #[test]
    fn test_layer_with_two_entries_is_rejected() {
        let json = r#"{
            "projection": "EPSG:3857",
            "stages": {"resample": [{"a.tif": "u1", "b.tif": "u2"}]}
        }"#;
        let err = StageConfig::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let json = r#"{"projection": "EPSG:3857", "stages": {"slope": []}}"#;
        assert!(StageConfig::from_json(json).is_err());
    }

    #[test]
    fn test_non_positive_cell_size_is_rejected() {
        let json = r#"{"projection": "EPSG:3857", "cell_size": 0}"#;
        assert!(matches!(
            StageConfig::from_json(json),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_layer_names_are_rejected() {
        let json = r#"{
            "projection": "EPSG:3857",
            "stages": {"coverages": [{"forest.shp": ""}, {"forest.tif": ""}]}
        }"#;
        assert!(StageConfig::from_json(json).is_err());
    }

    #[test]
    fn test_export_format_names() {
        assert_eq!("png".parse::<ExportFormat>().unwrap(), ExportFormat::Png);
        assert_eq!("TTL".parse::<ExportFormat>().unwrap(), ExportFormat::Rdf);
        assert_eq!(ExportFormat::Rdf.extension(), "ttl");
        assert!(matches!(
            "svg".parse::<ExportFormat>(),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_layer_name_strips_extension() {
        let layer = LayerSpec::new("forest.shp", "");
        assert_eq!(layer.name(), "forest");
    }
}
