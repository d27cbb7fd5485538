//! Provenance Recorder.
//!
//! [`Recorder::record_stage`] runs one pipeline stage against a workspace and
//! returns the provenance document describing it. Each layer's records are
//! built in a scratch document and only land in the stage document once every
//! step for that layer succeeded, so a failing layer leaves no partial trail.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{LayerSpec, StageKind};
use crate::error::{Error, Result};
use crate::fetch::LayerSource;
use crate::layer::{raster_suffix, stem, xyz_name, ArtifactNames, LayerKind};
use crate::prov::{Attributes, Document, QualifiedName};
use crate::table::{read_xyz, tag_rows, write_table, FeatureRow, GridIndex};
use crate::tools::{Geoprocessing, GridExtent, LayerDescription, Tool};
use crate::workspace::Workspace;

const GRID_TEMPLATE: &str = "grid.tif";

/// Hands out strictly increasing, microsecond-precision timestamps so that
/// activity identifiers never collide, even across threads.
#[derive(Debug, Default)]
pub struct ActivityClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

/// `<operation>_<unix seconds>.<microseconds>`.
pub fn activity_id(operation: &str, at: &DateTime<Utc>) -> String {
    format!(
        "{operation}_{}.{:06}",
        at.timestamp(),
        at.timestamp_subsec_micros()
    )
}

/// A layer (or one of its derived rasters) the stage could not process.
#[derive(Debug)]
pub struct SkippedLayer {
    pub layer: String,
    pub error: Error,
}

/// What one stage produced.
#[derive(Debug)]
pub struct StageDocument {
    pub stage: StageKind,
    pub document: Document,
    pub skipped: Vec<SkippedLayer>,
    /// `grid.csv` for the grid stage, the joined stage table otherwise.
    pub table: PathBuf,
}

struct Agents {
    saga: QualifiedName,
    gdal: QualifiedName,
}

/// An output raster converted to a coordinate table.
struct Conversion {
    raster: String,
    xyz: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rows: Vec<FeatureRow>,
}

pub struct Recorder<'a> {
    tools: &'a dyn Geoprocessing,
    source: &'a dyn LayerSource,
    workspace: &'a Workspace,
    projection: &'a str,
    cell_size: f64,
    clock: ActivityClock,
}

impl<'a> Recorder<'a> {
    pub fn new(
        tools: &'a dyn Geoprocessing,
        source: &'a dyn LayerSource,
        workspace: &'a Workspace,
        projection: &'a str,
        cell_size: f64,
    ) -> Self {
        Self {
            tools,
            source,
            workspace,
            projection,
            cell_size,
            clock: ActivityClock::new(),
        }
    }

    pub fn record_stage(&self, stage: StageKind, layers: &[LayerSpec]) -> Result<StageDocument> {
        let started = Instant::now();
        info!("Recording stage {} with {} layers", stage, layers.len());

        self.workspace.prepare(stage)?;
        let mut layers = layers.to_vec();
        layers.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut document = Document::with_geo_namespaces();
        let agents = self.register_agents(&mut document)?;
        let mut skipped = Vec::new();

        let table = match stage {
            StageKind::Grid => self.record_grid(&mut document, &agents, &layers)?,
            _ => self.record_layers(stage, &mut document, &agents, &layers, &mut skipped)?,
        };

        info!(
            "Stage {} finished in {:?}: {} records, {} skipped",
            stage,
            started.elapsed(),
            document.elements().count(),
            skipped.len()
        );
        Ok(StageDocument {
            stage,
            document,
            skipped,
            table,
        })
    }

    /// Queries each tool's version once and records it on the agent.
    fn register_agents(&self, doc: &mut Document) -> Result<Agents> {
        let mut register = |tool: Tool| -> Result<QualifiedName> {
            let edition = self.tools.version(tool)?;
            debug!("{} edition: {}", tool.agent_id(), edition);
            Ok(doc.agent(
                tool.agent_id(),
                vec![
                    (QualifiedName::prov("type"), QualifiedName::prov("SoftwareAgent").into()),
                    ("cit:edition".into(), edition.into()),
                ],
            ))
        };
        Ok(Agents {
            saga: register(Tool::Saga)?,
            gdal: register(Tool::Gdal)?,
        })
    }

    fn record_activity(
        &self,
        doc: &mut Document,
        operation: &str,
        agent: &QualifiedName,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> QualifiedName {
        let activity = doc.activity(activity_id(operation, &start), start, end);
        doc.was_associated_with(&activity, agent);
        activity
    }

    /// Runs one tool invocation bracketed by the activity's start and end
    /// times. Nothing is recorded when the invocation fails.
    fn step<T>(
        &self,
        doc: &mut Document,
        operation: &str,
        agent: &QualifiedName,
        run: impl FnOnce() -> Result<T>,
    ) -> Result<(QualifiedName, T)> {
        let start = self.clock.tick();
        let output = run()?;
        let end = self.clock.tick();
        let activity = self.record_activity(doc, operation, agent, start, end);
        debug!("Recorded activity {}", activity);
        Ok((activity, output))
    }

    fn layer_entity(
        &self,
        doc: &mut Document,
        layer: &LayerSpec,
        desc: &LayerDescription,
    ) -> QualifiedName {
        let mut attributes: Attributes = vec![
            ("prov:type".into(), desc.type_label.clone().into()),
            ("cat:CT_CRS".into(), desc.crs.clone().into()),
            ("gex:EX_GeographicBoundingBox".into(), desc.bounds_label().into()),
        ];
        if let Some(resolution) = desc.resolution {
            attributes.push(("msr:resolution".into(), resolution.into()));
        }
        if !layer.url.is_empty() {
            attributes.push(("cit:CI_OnlineResource".into(), layer.url.clone().into()));
        }
        doc.entity(layer.filename.as_str(), attributes)
    }

    fn projection_entity(&self, doc: &mut Document) -> QualifiedName {
        doc.entity(
            "projection",
            vec![
                ("prov:type".into(), "proj4string".into()),
                ("prov:value".into(), self.projection.into()),
            ],
        )
    }

    fn resolution_entity(&self, doc: &mut Document, units: Option<&str>) -> QualifiedName {
        let mut attributes: Attributes = Vec::new();
        if let Some(units) = units {
            attributes.push(("prov:type".into(), units.into()));
        }
        attributes.push(("prov:value".into(), self.cell_size.into()));
        doc.entity("msr:resolution", attributes)
    }

    fn record_grid(
        &self,
        doc: &mut Document,
        agents: &Agents,
        layers: &[LayerSpec],
    ) -> Result<PathBuf> {
        let mask = match layers {
            [mask] => mask,
            _ => {
                return Err(Error::Configuration(format!(
                    "the grid stage takes exactly one mask layer, got {}",
                    layers.len()
                )));
            }
        };
        let kind = LayerKind::classify(&mask.filename);
        match kind {
            LayerKind::Vector => {}
            LayerKind::Raster => {
                return Err(Error::UnsupportedLayer {
                    layer: mask.filename.clone(),
                    stage: StageKind::Grid.to_string(),
                    reason: "the mask must be a vector layer".to_string(),
                });
            }
            LayerKind::Unrecognized => {
                return Err(Error::UnrecognizedLayerKind(mask.filename.clone()));
            }
        }

        let path = self.source.fetch(mask, &self.workspace.input_dir())?;
        let desc = self.tools.describe(&path, kind)?;
        let mask_id = self.layer_entity(doc, mask, &desc);
        let resolution = self.resolution_entity(doc, desc.linear_units.as_deref());

        let grid_raster = self.workspace.grid_raster();
        let extent = GridExtent::around_mask(desc.bounds, self.cell_size);
        info!("Building a {} unit grid from {}", self.cell_size, mask.filename);
        let (gridding, _) = self.step(doc, "grid_gridding_0", &agents.saga, || {
            self.tools
                .grid_from_mask(&path, self.cell_size, &extent, &grid_raster)
        })?;
        let grid_id = doc.entity_ref(GRID_TEMPLATE);
        doc.used(&gridding, &mask_id);
        doc.used(&gridding, &resolution);
        doc.was_generated_by(&grid_id, &gridding);

        let grid_xyz = self.workspace.analysis_dir().join(xyz_name(GRID_TEMPLATE));
        let (translate, _) = self.step(doc, "gdal_translate", &agents.gdal, || {
            self.tools.raster_to_xyz(&grid_raster, &grid_xyz)
        })?;
        let xyz_id = doc.entity_ref(xyz_name(GRID_TEMPLATE));
        doc.used(&translate, &grid_id);
        doc.was_generated_by(&xyz_id, &translate);

        let nodata = self.tools.nodata(&grid_raster)?;
        let index = GridIndex::from_rows(&read_xyz(&grid_xyz)?, nodata);
        if index.is_empty() {
            warn!("Grid built from {} has no data cells", mask.filename);
        }
        let grid_table = self.workspace.grid_table();
        index.write_csv(&grid_table)?;
        info!("Grid index has {} cells: {:?}", index.len(), grid_table);

        let table_id = doc.entity_ref(StageKind::Grid.table_name());
        doc.was_derived_from(&table_id, &xyz_id);
        Ok(grid_table)
    }

    fn record_layers(
        &self,
        stage: StageKind,
        doc: &mut Document,
        agents: &Agents,
        layers: &[LayerSpec],
        skipped: &mut Vec<SkippedLayer>,
    ) -> Result<PathBuf> {
        for required in [self.workspace.grid_raster(), self.workspace.grid_table()] {
            if !required.exists() {
                return Err(Error::Configuration(format!(
                    "{} is missing; the grid stage must run first",
                    required.display()
                )));
            }
        }

        // Rasterized layers carry the grid's cell size in the grid's units.
        let units = match stage {
            StageKind::PresenceAbsence => None,
            _ => {
                self.tools
                    .describe(&self.workspace.grid_raster(), LayerKind::Raster)?
                    .linear_units
            }
        };

        let mut produced = Vec::new();
        for layer in layers {
            info!("Processing layer {} for {}", layer.filename, stage);
            let mut scratch = Document::new();
            match self.record_layer(stage, &mut scratch, agents, layer, units.as_deref()) {
                Ok(paths) => {
                    doc.update(scratch);
                    produced.extend(paths);
                }
                Err(error) => {
                    warn!("Skipping layer {} in {}: {}", layer.filename, stage, error);
                    skipped.push(SkippedLayer {
                        layer: layer.filename.clone(),
                        error,
                    });
                }
            }
        }

        let outputs = match stage {
            StageKind::PresenceAbsence => produced,
            _ => self.apply_to_grid(stage, doc, agents, produced, skipped),
        };

        self.tabulate(stage, doc, agents, outputs, skipped)
    }

    /// Reprojects one layer and, depending on the stage, rasterizes it or
    /// grids its points. Returns the stage-tagged raster for coverages and
    /// resample, or the presence and count outputs for presence/absence.
    fn record_layer(
        &self,
        stage: StageKind,
        doc: &mut Document,
        agents: &Agents,
        layer: &LayerSpec,
        units: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let kind = LayerKind::classify(&layer.filename);
        match (kind, stage) {
            (LayerKind::Unrecognized, _) => {
                return Err(Error::UnrecognizedLayerKind(layer.filename.clone()));
            }
            (LayerKind::Raster, StageKind::PresenceAbsence) => {
                return Err(Error::UnsupportedLayer {
                    layer: layer.filename.clone(),
                    stage: stage.to_string(),
                    reason: "presence/absence needs a vector layer".to_string(),
                });
            }
            _ => {}
        }

        let path = self.source.fetch(layer, &self.workspace.input_dir())?;
        let desc = self.tools.describe(&path, kind)?;
        let layer_id = self.layer_entity(doc, layer, &desc);
        let projection = self.projection_entity(doc);
        let names = ArtifactNames::new(stage, layer.name());
        let analysis = self.workspace.analysis_dir();

        if kind == LayerKind::Raster {
            let target = analysis.join(names.raster());
            let (reproject, _) = self.step(doc, "pj_proj4_4", &agents.saga, || {
                self.tools.reproject_raster(&path, self.projection, &target)
            })?;
            let raster = doc.entity_ref(names.raster());
            doc.used(&reproject, &layer_id);
            doc.used(&reproject, &projection);
            doc.was_generated_by(&raster, &reproject);
            return Ok(vec![target]);
        }

        let reprojected = analysis.join(names.reprojected());
        let (reproject, _) = self.step(doc, "pj_proj4_2", &agents.saga, || {
            self.tools.reproject_vector(&path, self.projection, &reprojected)
        })?;
        let reprojected_id = doc.entity_ref(names.reprojected());
        doc.used(&reproject, &layer_id);
        doc.used(&reproject, &projection);
        doc.was_generated_by(&reprojected_id, &reproject);

        if stage == StageKind::PresenceAbsence {
            let stage_dir = self.workspace.stage_dir(stage);
            let presence = stage_dir.join(names.presence());
            let count = stage_dir.join(names.count());
            let grid_raster = self.workspace.grid_raster();
            let (gridding, _) = self.step(doc, "grid_gridding_0", &agents.saga, || {
                self.tools
                    .grid_points(&reprojected, &grid_raster, &presence, &count)
            })?;
            let grid_id = doc.entity_ref(GRID_TEMPLATE);
            doc.used(&gridding, &reprojected_id);
            doc.used(&gridding, &grid_id);
            for output in [names.presence(), names.count()] {
                let output_id = doc.entity_ref(output);
                doc.was_generated_by(&output_id, &gridding);
            }
            return Ok(vec![presence, count]);
        }

        let resolution = self.resolution_entity(doc, units);
        let target = analysis.join(names.raster());
        let (rasterize, _) = self.step(doc, "grid_gridding_0", &agents.saga, || {
            self.tools.rasterize(&reprojected, self.cell_size, &target)
        })?;
        let raster = doc.entity_ref(names.raster());
        doc.used(&rasterize, &reprojected_id);
        doc.used(&rasterize, &resolution);
        doc.was_generated_by(&raster, &rasterize);
        Ok(vec![target])
    }

    /// Second pass: aligns the stage-tagged rasters recorded in this stage
    /// with the grid template, in name order. Rasters left in `analysis/` by
    /// earlier runs are not picked up.
    fn apply_to_grid(
        &self,
        stage: StageKind,
        doc: &mut Document,
        agents: &Agents,
        rasters: Vec<PathBuf>,
        skipped: &mut Vec<SkippedLayer>,
    ) -> Vec<PathBuf> {
        let suffix = raster_suffix(stage);
        let mut rasters: Vec<String> = rasters
            .iter()
            .filter_map(|path| path.file_name())
            .filter_map(|name| name.to_str())
            .map(str::to_string)
            .collect();
        rasters.sort();
        debug!("Aligning {} {} rasters with the grid", rasters.len(), stage);

        let operation = match stage {
            StageKind::Coverages => "grid_analysis_26",
            _ => "grid_tools_0",
        };
        let analysis = self.workspace.analysis_dir();
        let grid_raster = self.workspace.grid_raster();
        let stage_dir = self.workspace.stage_dir(stage);
        let mut outputs = Vec::new();

        for raster_name in rasters {
            let layer = raster_name
                .strip_suffix(suffix.as_str())
                .unwrap_or(&raster_name);
            let output_name = ArtifactNames::new(stage, layer).output();
            let raster = analysis.join(&raster_name);
            let output = stage_dir.join(&output_name);

            let result = self.step(doc, operation, &agents.saga, || match stage {
                StageKind::Coverages => {
                    self.tools.classify_coverage(&raster, &grid_raster, &output)
                }
                _ => self.tools.resample_to_grid(&raster, &grid_raster, &output),
            });
            match result {
                Ok((activity, _)) => {
                    let raster_id = doc.entity_ref(raster_name.as_str());
                    let grid_id = doc.entity_ref(GRID_TEMPLATE);
                    let output_id = doc.entity_ref(output_name);
                    doc.used(&activity, &raster_id);
                    doc.used(&activity, &grid_id);
                    doc.was_generated_by(&output_id, &activity);
                    outputs.push(output);
                }
                Err(error) => {
                    warn!("Skipping {} in {}: {}", raster_name, stage, error);
                    skipped.push(SkippedLayer {
                        layer: raster_name.clone(),
                        error,
                    });
                }
            }
        }
        outputs
    }

    fn convert(&self, stage: StageKind, raster: &Path) -> Result<Conversion> {
        let raster_name = raster
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::tool("gdal_translate", format!("bad raster path {raster:?}")))?
            .to_string();
        let xyz = xyz_name(&raster_name);
        let target = self.workspace.analysis_dir().join(&xyz);

        let start = self.clock.tick();
        self.tools.raster_to_xyz(raster, &target)?;
        let end = self.clock.tick();

        let sentinel = match stage {
            StageKind::Resample => self.tools.nodata(raster)?,
            _ => Some(0.0),
        };
        let rows = tag_rows(&read_xyz(&target)?, sentinel, stem(&raster_name));
        debug!("{} holds {} data cells", xyz, rows.len());

        Ok(Conversion {
            raster: raster_name,
            xyz,
            start,
            end,
            rows,
        })
    }

    /// Third pass: converts every output raster to a coordinate table, joins
    /// the concatenation against the grid index and writes the stage table.
    fn tabulate(
        &self,
        stage: StageKind,
        doc: &mut Document,
        agents: &Agents,
        mut outputs: Vec<PathBuf>,
        skipped: &mut Vec<SkippedLayer>,
    ) -> Result<PathBuf> {
        outputs.sort();
        let conversions: Vec<(PathBuf, Result<Conversion>)> = outputs
            .into_par_iter()
            .map(|raster| {
                let conversion = self.convert(stage, &raster);
                (raster, conversion)
            })
            .collect();

        let mut rows = Vec::new();
        let mut tables = Vec::new();
        for (raster, conversion) in conversions {
            match conversion {
                Ok(conversion) => {
                    let activity = self.record_activity(
                        doc,
                        "gdal_translate",
                        &agents.gdal,
                        conversion.start,
                        conversion.end,
                    );
                    let raster_id = doc.entity_ref(conversion.raster.as_str());
                    let xyz_id = doc.entity_ref(conversion.xyz.as_str());
                    doc.used(&activity, &raster_id);
                    doc.was_generated_by(&xyz_id, &activity);
                    rows.extend(conversion.rows);
                    tables.push(xyz_id);
                }
                Err(error) => {
                    warn!("Could not tabulate {:?}: {}", raster, error);
                    skipped.push(SkippedLayer {
                        layer: raster
                            .file_name()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        error,
                    });
                }
            }
        }

        let grid = GridIndex::read_csv(&self.workspace.grid_table())?;
        let joined = grid.join(&rows);
        let table_path = self.workspace.stage_dir(stage).join(stage.table_name());
        write_table(&table_path, stage.value_column(), &joined)?;
        info!("Wrote {} rows to {:?}", joined.len(), table_path);

        let table_id = doc.entity_ref(stage.table_name());
        for xyz_id in &tables {
            doc.was_derived_from(&table_id, xyz_id);
        }
        Ok(table_path)
    }
}
