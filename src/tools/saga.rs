use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use gdal::vector::LayerAccess;
use gdal::Dataset;
use tracing::debug;

use super::{Geoprocessing, GridExtent, LayerDescription, Statistic, Tool};
use crate::error::{Error, Result};
use crate::layer::LayerKind;

/// Runs SAGA GIS (`saga_cmd`) and the GDAL utilities, and reads layer
/// metadata through the GDAL bindings.
#[derive(Debug, Clone)]
pub struct SagaGdal {
    saga_cmd: String,
    gdal_translate: String,
    ogrinfo: String,
}

impl Default for SagaGdal {
    fn default() -> Self {
        Self {
            saga_cmd: "saga_cmd".to_string(),
            gdal_translate: "gdal_translate".to_string(),
            ogrinfo: "ogrinfo".to_string(),
        }
    }
}

impl SagaGdal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honours `GEOGEAR_SAGA_CMD`, `GEOGEAR_GDAL_TRANSLATE` and
    /// `GEOGEAR_OGRINFO`.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            saga_cmd: env::var("GEOGEAR_SAGA_CMD").unwrap_or(default.saga_cmd),
            gdal_translate: env::var("GEOGEAR_GDAL_TRANSLATE").unwrap_or(default.gdal_translate),
            ogrinfo: env::var("GEOGEAR_OGRINFO").unwrap_or(default.ogrinfo),
        }
    }

    fn run(&self, program: &str, args: Vec<OsString>) -> Result<Output> {
        debug!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|e| Error::tool(program, format!("failed to start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostic = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::tool(
                program,
                format!("exited with {}: {}", output.status, diagnostic),
            ));
        }
        Ok(output)
    }

    fn saga(&self, args: Vec<OsString>, outputs: &[&Path]) -> Result<()> {
        self.run(&self.saga_cmd, args)?;
        for output in outputs {
            ensure_output(&self.saga_cmd, output)?;
        }
        Ok(())
    }
}

fn ensure_output(tool: &str, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::MissingOutput {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        })
    }
}

macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$(OsString::from($arg)),*]
    };
}

impl Geoprocessing for SagaGdal {
    fn version(&self, tool: Tool) -> Result<String> {
        let program = match tool {
            Tool::Saga => &self.saga_cmd,
            Tool::Gdal => &self.ogrinfo,
        };
        let output = self.run(program, args!["--version"])?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::tool(program.as_str(), "printed no version"))
    }

    fn describe(&self, path: &Path, kind: LayerKind) -> Result<LayerDescription> {
        let dataset = Dataset::open(path)?;
        match kind {
            LayerKind::Raster => {
                let srs = dataset.spatial_ref()?;
                let transform = dataset.geo_transform()?;
                let (cols, rows) = dataset.raster_size();
                let xmin = transform[0];
                let ymax = transform[3];
                let xmax = xmin + transform[1] * cols as f64;
                let ymin = ymax + transform[5] * rows as f64;
                Ok(LayerDescription {
                    type_label: dataset.driver().short_name(),
                    crs: srs.to_proj4()?,
                    bounds: [xmin, ymin.min(ymax), xmax, ymax.max(ymin)],
                    resolution: Some(transform[1]),
                    linear_units: srs.linear_units_name(),
                })
            }
            LayerKind::Vector => {
                let layer = dataset.layer(0)?;
                let srs = layer.spatial_ref().ok_or_else(|| {
                    Error::tool(&self.ogrinfo, format!("{} has no spatial reference", path.display()))
                })?;
                let extent = layer.get_extent()?;
                let type_label = layer
                    .defn()
                    .geom_fields()
                    .next()
                    .map(|field| gdal::vector::geometry_type_to_name(field.field_type()))
                    .unwrap_or_else(|| "Unknown".to_string());
                Ok(LayerDescription {
                    type_label,
                    crs: srs.to_proj4()?,
                    bounds: [extent.MinX, extent.MinY, extent.MaxX, extent.MaxY],
                    resolution: None,
                    linear_units: srs.linear_units_name(),
                })
            }
            LayerKind::Unrecognized => Err(Error::UnrecognizedLayerKind(path.display().to_string())),
        }
    }

    fn nodata(&self, raster: &Path) -> Result<Option<f64>> {
        let dataset = Dataset::open(raster)?;
        let band = dataset.rasterband(1)?;
        Ok(band.no_data_value())
    }

    fn grid_from_mask(
        &self,
        mask: &Path,
        cell_size: f64,
        extent: &GridExtent,
        target: &Path,
    ) -> Result<PathBuf> {
        self.saga(
            args![
                "grid_gridding", "0",
                "-INPUT", mask,
                "-GRID", target,
                "-OUTPUT", "0",
                "-GRID_TYPE", "1",
                "-TARGET_DEFINITION", "0",
                "-TARGET_USER_SIZE", cell_size.to_string(),
                "-TARGET_USER_XMIN", extent.xmin.to_string(),
                "-TARGET_USER_YMIN", extent.ymin.to_string(),
                "-TARGET_USER_XMAX", extent.xmax.to_string(),
                "-TARGET_USER_YMAX", extent.ymax.to_string(),
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn reproject_vector(&self, source: &Path, crs: &str, target: &Path) -> Result<PathBuf> {
        self.saga(
            args![
                "-f=p", "pj_proj4", "2",
                "-CRS_PROJ4", crs,
                "-SOURCE", source,
                "-TARGET", target,
                "-PARALLEL", "1",
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn reproject_raster(&self, source: &Path, crs: &str, target: &Path) -> Result<PathBuf> {
        self.saga(
            args![
                "pj_proj4", "4",
                "-CRS_PROJ4", crs,
                "-SOURCE", source,
                "-GRID", target,
                "-RESAMPLING", "0",
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn rasterize(&self, vector: &Path, cell_size: f64, target: &Path) -> Result<PathBuf> {
        self.saga(
            args![
                "grid_gridding", "0",
                "-INPUT", vector,
                "-GRID", target,
                "-TARGET_USER_SIZE", cell_size.to_string(),
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn classify_coverage(&self, raster: &Path, template: &Path, target: &Path) -> Result<PathBuf> {
        self.saga(
            args![
                "grid_analysis", "26",
                "-CLASSES", raster,
                "-COVERAGES", target,
                "-TARGET_DEFINITION", "1",
                "-TARGET_TEMPLATE", template,
                "-DATADEPTH", "3",
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn resample_to_grid(&self, raster: &Path, template: &Path, target: &Path) -> Result<PathBuf> {
        self.saga(
            args![
                "grid_tools", "0",
                "-INPUT", raster,
                "-TARGET_TEMPLATE", template,
                "-OUTPUT", target,
                "-TARGET_DEFINITION", "1",
                "-SCALE_UP", "8",
                "-SCALE_DOWN", "0",
            ],
            &[target],
        )?;
        Ok(target.to_path_buf())
    }

    fn grid_points(
        &self,
        vector: &Path,
        template: &Path,
        presence: &Path,
        count: &Path,
    ) -> Result<(PathBuf, PathBuf)> {
        self.saga(
            args![
                "grid_gridding", "0",
                "-INPUT", vector,
                "-TARGET_TEMPLATE", template,
                "-GRID", presence,
                "-COUNT", count,
                "-OUTPUT", "0",
                "-TARGET_DEFINITION", "1",
            ],
            &[presence, count],
        )?;
        Ok((presence.to_path_buf(), count.to_path_buf()))
    }

    fn raster_to_xyz(&self, raster: &Path, target: &Path) -> Result<PathBuf> {
        self.run(&self.gdal_translate, args!["-of", "XYZ", raster, target])?;
        ensure_output(&self.gdal_translate, target)
    }

    fn grid_statistics(
        &self,
        grids: &[PathBuf],
        table: &Path,
        statistics: &[Statistic],
    ) -> Result<PathBuf> {
        if grids.is_empty() {
            return Err(Error::tool(&self.saga_cmd, "no grids to summarise"));
        }
        let grid_list = grids
            .iter()
            .map(|g| g.display().to_string())
            .collect::<Vec<_>>()
            .join(";");

        let mut args = args!["statistics_grid", "13", "-GRIDS", grid_list, "-STATS", table];
        for statistic in Statistic::ALL {
            let enabled = statistics.contains(&statistic);
            args.push(OsString::from(statistic.flag()));
            args.push(OsString::from(if enabled { "1" } else { "0" }));
        }
        self.saga(args, &[table])?;
        Ok(table.to_path_buf())
    }
}
