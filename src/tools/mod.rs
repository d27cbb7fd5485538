//! The Geoprocessing Tool capability.
//!
//! Every operation is a blocking call that either produces its declared
//! output files or fails with a diagnostic. Callers never assume an output
//! exists unless the call returned `Ok`.

mod saga;

use std::path::{Path, PathBuf};

pub use saga::SagaGdal;

use crate::error::Result;
use crate::layer::LayerKind;

/// External tools that act as provenance agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Saga,
    Gdal,
}

impl Tool {
    /// Identifier of the tool's agent record.
    pub fn agent_id(&self) -> &'static str {
        match self {
            Tool::Saga => "saga_cmd",
            Tool::Gdal => "gdal",
        }
    }
}

/// Descriptive metadata of a layer, recorded on its entity.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescription {
    /// Geometry type for vectors, driver short name for rasters.
    pub type_label: String,
    /// PROJ.4 rendering of the layer CRS.
    pub crs: String,
    /// `[xmin, ymin, xmax, ymax]`.
    pub bounds: [f64; 4],
    /// Pixel width; rasters only.
    pub resolution: Option<f64>,
    /// Linear unit of the CRS axes, e.g. `metre`.
    pub linear_units: Option<String>,
}

impl LayerDescription {
    pub fn bounds_label(&self) -> String {
        let [xmin, ymin, xmax, ymax] = self.bounds;
        format!("[{xmin}, {ymin}, {xmax}, {ymax}]")
    }
}

/// Target extent of the grid built from a mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridExtent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl GridExtent {
    /// Mask bounds shifted by half a cell so cell centres line up with the
    /// mask origin.
    pub fn around_mask(bounds: [f64; 4], cell_size: f64) -> Self {
        let half = 0.5 * cell_size;
        Self {
            xmin: bounds[0] - half,
            ymin: bounds[1] - half,
            xmax: bounds[2] - half,
            ymax: bounds[3] - half,
        }
    }
}

/// Statistics `grid_statistics` can emit per grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Statistic {
    DataCells,
    NodataCells,
    CellSize,
    Mean,
    Min,
    Max,
    Range,
    Sum,
    SumOfSquares,
    Variance,
    StdDev,
    StdDevLow,
    StdDevHigh,
}

impl Statistic {
    pub const ALL: [Statistic; 13] = [
        Statistic::DataCells,
        Statistic::NodataCells,
        Statistic::CellSize,
        Statistic::Mean,
        Statistic::Min,
        Statistic::Max,
        Statistic::Range,
        Statistic::Sum,
        Statistic::SumOfSquares,
        Statistic::Variance,
        Statistic::StdDev,
        Statistic::StdDevLow,
        Statistic::StdDevHigh,
    ];

    /// SAGA `statistics_grid 13` flag.
    pub fn flag(&self) -> &'static str {
        match self {
            Statistic::DataCells => "-DATA_CELLS",
            Statistic::NodataCells => "-NODATA_CELLS",
            Statistic::CellSize => "-CELLSIZE",
            Statistic::Mean => "-MEAN",
            Statistic::Min => "-MIN",
            Statistic::Max => "-MAX",
            Statistic::Range => "-RANGE",
            Statistic::Sum => "-SUM",
            Statistic::SumOfSquares => "-SUM2",
            Statistic::Variance => "-VAR",
            Statistic::StdDev => "-STDDEV",
            Statistic::StdDevLow => "-STDDEVLO",
            Statistic::StdDevHigh => "-STDDEVHI",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let flag = format!("-{}", name.to_ascii_uppercase().replace(['-', '_'], ""));
        Statistic::ALL
            .into_iter()
            .find(|s| s.flag().replace('_', "") == flag)
    }
}

pub trait Geoprocessing: Send + Sync {
    /// First line of the tool's version output.
    fn version(&self, tool: Tool) -> Result<String>;

    fn describe(&self, path: &Path, kind: LayerKind) -> Result<LayerDescription>;

    /// Nodata value of a raster's first band.
    fn nodata(&self, raster: &Path) -> Result<Option<f64>>;

    fn grid_from_mask(
        &self,
        mask: &Path,
        cell_size: f64,
        extent: &GridExtent,
        target: &Path,
    ) -> Result<PathBuf>;

    fn reproject_vector(&self, source: &Path, crs: &str, target: &Path) -> Result<PathBuf>;

    fn reproject_raster(&self, source: &Path, crs: &str, target: &Path) -> Result<PathBuf>;

    fn rasterize(&self, vector: &Path, cell_size: f64, target: &Path) -> Result<PathBuf>;

    /// Fraction of each template cell covered by the raster's classes.
    fn classify_coverage(&self, raster: &Path, template: &Path, target: &Path) -> Result<PathBuf>;

    fn resample_to_grid(&self, raster: &Path, template: &Path, target: &Path) -> Result<PathBuf>;

    /// Grids points onto the template, yielding a presence/absence raster and
    /// a point-count raster.
    fn grid_points(
        &self,
        vector: &Path,
        template: &Path,
        presence: &Path,
        count: &Path,
    ) -> Result<(PathBuf, PathBuf)>;

    /// Writes the raster as `x y value` lines.
    fn raster_to_xyz(&self, raster: &Path, target: &Path) -> Result<PathBuf>;

    fn grid_statistics(
        &self,
        grids: &[PathBuf],
        table: &Path,
        statistics: &[Statistic],
    ) -> Result<PathBuf>;
}
