#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use geogear::config::LayerSpec;
use geogear::fetch::LayerSource;
use geogear::layer::LayerKind;
use geogear::tools::{Geoprocessing, GridExtent, LayerDescription, Statistic, Tool};
use geogear::{Error, Result};

pub const PROJECTION: &str = "+proj=utm +zone=23 +south +datum=WGS84 +units=m +no_defs";
pub const GRID_NODATA: f64 = -99999.0;

pub type Cells = Vec<(f64, f64, f64)>;

/// 3x2 grid of 100 unit cells; one zero cell and one nodata cell.
pub fn grid_cells() -> Cells {
    vec![
        (50.0, 150.0, 1.0),
        (150.0, 150.0, 1.0),
        (250.0, 150.0, 0.0),
        (50.0, 50.0, 1.0),
        (150.0, 50.0, GRID_NODATA),
        (250.0, 50.0, 1.0),
    ]
}

/// Stands in for SAGA and GDAL. A fake raster is a text file: a
/// `nodata <value|none>` header followed by its `x y value` lines, so
/// `raster_to_xyz` only has to drop the header.
pub struct FakeTools {
    /// Cell values each layer's stage rasters carry, keyed by layer name.
    pub layers: BTreeMap<String, Cells>,
    /// Nodata value written into rasters derived from layers.
    pub layer_nodata: Option<f64>,
    /// Target file names whose production fails.
    pub failing: BTreeSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            layers: BTreeMap::new(),
            layer_nodata: None,
            failing: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_layer(mut self, name: &str, cells: Cells) -> Self {
        self.layers.insert(name.to_string(), cells);
        self
    }

    pub fn failing_on(mut self, target: &str) -> Self {
        self.failing.insert(target.to_string());
        self
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    fn run(&self, operation: &str, target: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        let name = file_name(target);
        if self.failing.contains(&name) {
            return Err(Error::ToolInvocation {
                tool: "saga_cmd".to_string(),
                diagnostic: format!("{operation} could not write {name}"),
            });
        }
        Ok(())
    }

    fn layer_cells(&self, target: &Path) -> Cells {
        let name = file_name(target);
        self.layers
            .iter()
            .filter(|(layer, _)| name.starts_with(&format!("{layer}_")))
            .max_by_key(|(layer, _)| layer.len())
            .map(|(_, cells)| cells.clone())
            .unwrap_or_default()
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

pub fn write_raster(path: &Path, nodata: Option<f64>, cells: &[(f64, f64, f64)]) {
    let mut out = match nodata {
        Some(value) => format!("nodata {value}\n"),
        None => "nodata none\n".to_string(),
    };
    for (x, y, value) in cells {
        out.push_str(&format!("{x} {y} {value}\n"));
    }
    fs::write(path, out).unwrap();
}

fn read_raster(path: &Path) -> Result<(Option<f64>, String)> {
    let content = fs::read_to_string(path)?;
    let (header, body) = content.split_once('\n').unwrap_or((&content, ""));
    let nodata = header
        .strip_prefix("nodata ")
        .and_then(|v| v.trim().parse::<f64>().ok());
    Ok((nodata, body.to_string()))
}

impl Geoprocessing for FakeTools {
    fn version(&self, tool: Tool) -> Result<String> {
        Ok(match tool {
            Tool::Saga => "SAGA Version: 9.3.1".to_string(),
            Tool::Gdal => "GDAL 3.8.4, released 2024/02/08".to_string(),
        })
    }

    fn describe(&self, path: &Path, kind: LayerKind) -> Result<LayerDescription> {
        Ok(match kind {
            // The grid raster is in the mask's projected CRS.
            LayerKind::Raster if file_name(path) == "grid.tif" => LayerDescription {
                type_label: "GTiff".to_string(),
                crs: PROJECTION.to_string(),
                bounds: [0.0, 0.0, 300.0, 200.0],
                resolution: Some(100.0),
                linear_units: Some("metre".to_string()),
            },
            LayerKind::Raster => LayerDescription {
                type_label: "GTiff".to_string(),
                crs: "+proj=longlat +datum=WGS84 +no_defs".to_string(),
                bounds: [-47.5, -23.25, -46.0, -22.0],
                resolution: Some(0.25),
                linear_units: Some("degree".to_string()),
            },
            _ => LayerDescription {
                type_label: "Polygon".to_string(),
                crs: PROJECTION.to_string(),
                bounds: [0.0, 0.0, 300.0, 200.0],
                resolution: None,
                linear_units: Some("metre".to_string()),
            },
        })
    }

    fn nodata(&self, raster: &Path) -> Result<Option<f64>> {
        Ok(read_raster(raster)?.0)
    }

    fn grid_from_mask(
        &self,
        _mask: &Path,
        _cell_size: f64,
        _extent: &GridExtent,
        target: &Path,
    ) -> Result<PathBuf> {
        self.run("grid_from_mask", target)?;
        write_raster(target, Some(GRID_NODATA), &grid_cells());
        Ok(target.to_path_buf())
    }

    fn reproject_vector(&self, _source: &Path, _crs: &str, target: &Path) -> Result<PathBuf> {
        self.run("reproject_vector", target)?;
        fs::write(target, "vector")?;
        Ok(target.to_path_buf())
    }

    fn reproject_raster(&self, _source: &Path, _crs: &str, target: &Path) -> Result<PathBuf> {
        self.run("reproject_raster", target)?;
        write_raster(target, self.layer_nodata, &self.layer_cells(target));
        Ok(target.to_path_buf())
    }

    fn rasterize(&self, _vector: &Path, _cell_size: f64, target: &Path) -> Result<PathBuf> {
        self.run("rasterize", target)?;
        write_raster(target, self.layer_nodata, &self.layer_cells(target));
        Ok(target.to_path_buf())
    }

    fn classify_coverage(&self, raster: &Path, _template: &Path, target: &Path) -> Result<PathBuf> {
        self.run("classify_coverage", target)?;
        fs::copy(raster, target)?;
        Ok(target.to_path_buf())
    }

    fn resample_to_grid(&self, raster: &Path, _template: &Path, target: &Path) -> Result<PathBuf> {
        self.run("resample_to_grid", target)?;
        fs::copy(raster, target)?;
        Ok(target.to_path_buf())
    }

    fn grid_points(
        &self,
        _vector: &Path,
        _template: &Path,
        presence: &Path,
        count: &Path,
    ) -> Result<(PathBuf, PathBuf)> {
        self.run("grid_points", presence)?;
        let counts = self.layer_cells(presence);
        let flags: Cells = counts
            .iter()
            .map(|&(x, y, n)| (x, y, if n > 0.0 { 1.0 } else { 0.0 }))
            .collect();
        write_raster(presence, None, &flags);
        write_raster(count, None, &counts);
        Ok((presence.to_path_buf(), count.to_path_buf()))
    }

    fn raster_to_xyz(&self, raster: &Path, target: &Path) -> Result<PathBuf> {
        self.run("raster_to_xyz", target)?;
        let (_, body) = read_raster(raster)?;
        fs::write(target, body)?;
        Ok(target.to_path_buf())
    }

    fn grid_statistics(
        &self,
        grids: &[PathBuf],
        table: &Path,
        statistics: &[Statistic],
    ) -> Result<PathBuf> {
        self.run("grid_statistics", table)?;
        fs::write(table, format!("{} grids, {} statistics\n", grids.len(), statistics.len()))?;
        Ok(table.to_path_buf())
    }
}

/// Writes a placeholder file for every layer, except those listed as
/// unreachable.
pub struct FakeSource {
    pub unreachable: BTreeSet<String>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            unreachable: BTreeSet::new(),
        }
    }

    pub fn unreachable(mut self, filename: &str) -> Self {
        self.unreachable.insert(filename.to_string());
        self
    }
}

impl LayerSource for FakeSource {
    fn fetch(&self, layer: &LayerSpec, input_dir: &Path) -> Result<PathBuf> {
        if self.unreachable.contains(&layer.filename) {
            return Err(Error::Retrieval {
                layer: layer.filename.clone(),
                reason: "404 Not Found".to_string(),
            });
        }
        fs::create_dir_all(input_dir)?;
        let path = input_dir.join(&layer.filename);
        fs::write(&path, format!("layer from {}", layer.url))?;
        Ok(path)
    }
}

pub fn mask_layer() -> LayerSpec {
    LayerSpec::new("mask.gpkg", "https://example.org/mask.gpkg")
}
