use std::path::Path;

use crate::config::StageKind;

const VECTOR_EXTENSIONS: &[&str] = &["shp", "gpkg", "geojson", "json", "kml", "gml", "zip"];
const RASTER_EXTENSIONS: &[&str] = &["tif", "tiff", "asc", "img", "vrt", "sdat", "nc"];

/// How a layer is processed, resolved once from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Vector,
    Raster,
    Unrecognized,
}

impl LayerKind {
    pub fn classify(filename: &str) -> Self {
        let ext = Path::new(filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());

        match ext.as_deref() {
            Some(ext) if VECTOR_EXTENSIONS.contains(&ext) => LayerKind::Vector,
            Some(ext) if RASTER_EXTENSIONS.contains(&ext) => LayerKind::Raster,
            _ => LayerKind::Unrecognized,
        }
    }

    /// Shapefiles travel as zip archives holding their sidecar files.
    pub fn is_archive(filename: &str) -> bool {
        matches!(
            Path::new(filename)
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_ascii_lowercase())
                .as_deref(),
            Some("zip" | "shp")
        )
    }
}

/// Names of the files a stage derives from one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    stage: StageKind,
    layer: String,
}

impl ArtifactNames {
    pub fn new(stage: StageKind, layer: impl Into<String>) -> Self {
        Self {
            stage,
            layer: layer.into(),
        }
    }

    /// Reprojected vector, e.g. `forest_cov_reproj.gpkg`.
    pub fn reprojected(&self) -> String {
        format!("{}_{}_reproj.gpkg", self.layer, self.stage.tag())
    }

    /// Stage-tagged intermediate raster, e.g. `forest_cov_raster.tif`.
    pub fn raster(&self) -> String {
        format!("{}{}", self.layer, raster_suffix(self.stage))
    }

    /// Stage output raster, e.g. `forest_cov.tif`.
    pub fn output(&self) -> String {
        match self.stage {
            StageKind::Grid => "grid.tif".to_string(),
            _ => format!("{}_{}.tif", self.layer, self.stage.tag()),
        }
    }

    pub fn presence(&self) -> String {
        format!("{}_pa.tif", self.layer)
    }

    pub fn count(&self) -> String {
        format!("{}_count.tif", self.layer)
    }
}

/// Suffix that marks a stage's intermediate rasters in `analysis/`.
pub fn raster_suffix(stage: StageKind) -> String {
    format!("_{}_raster.tif", stage.tag())
}

/// Swaps a raster file name's extension for `.xyz`.
pub fn xyz_name(raster: &str) -> String {
    format!("{}.xyz", stem(raster))
}

pub fn stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_layers() {
        assert_eq!(LayerKind::classify("forest.shp"), LayerKind::Vector);
        assert_eq!(LayerKind::classify("wells.GPKG"), LayerKind::Vector);
        assert_eq!(LayerKind::classify("roads.zip"), LayerKind::Vector);
        assert_eq!(LayerKind::classify("dem.tif"), LayerKind::Raster);
        assert_eq!(LayerKind::classify("dem.TIFF"), LayerKind::Raster);
        assert_eq!(LayerKind::classify("notes.txt"), LayerKind::Unrecognized);
        assert_eq!(LayerKind::classify("no_extension"), LayerKind::Unrecognized);
    }

    #[test]
    fn test_archives() {
        assert!(LayerKind::is_archive("forest.shp"));
        assert!(LayerKind::is_archive("roads.zip"));
        assert!(!LayerKind::is_archive("wells.gpkg"));
    }

    #[test]
    fn test_artifact_names() {
        let cov = ArtifactNames::new(StageKind::Coverages, "forest");
        assert_eq!(cov.reprojected(), "forest_cov_reproj.gpkg");
        assert_eq!(cov.raster(), "forest_cov_raster.tif");
        assert_eq!(cov.output(), "forest_cov.tif");
        assert_eq!(
            ArtifactNames::new(StageKind::Resample, "dem").output(),
            "dem_rsmpl.tif"
        );
        assert_eq!(ArtifactNames::new(StageKind::Grid, "mask").output(), "grid.tif");

        let pa = ArtifactNames::new(StageKind::PresenceAbsence, "forest");
        assert_eq!(pa.presence(), "forest_pa.tif");
        assert_eq!(pa.count(), "forest_count.tif");

        assert_eq!(xyz_name("forest_count.tif"), "forest_count.xyz");
    }
}
