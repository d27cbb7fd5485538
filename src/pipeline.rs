//! Pipeline Dispatcher: runs the configured stages, merges their provenance
//! and exports the result.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::{ExportFormat, StageConfig, StageKind};
use crate::error::{Error, Result};
use crate::export::{Exporter, FailedExport};
use crate::fetch::LayerSource;
use crate::prov::{self, json, Document};
use crate::recorder::{Recorder, SkippedLayer};
use crate::tools::Geoprocessing;
use crate::workspace::Workspace;

/// Where the merge target comes from.
#[derive(Debug, Clone, Default)]
pub enum BaseDocument {
    /// An empty document with the geospatial namespace bindings.
    #[default]
    Fresh,
    /// A PROV-JSON document from an earlier run.
    File(PathBuf),
    Document(Document),
}

impl BaseDocument {
    pub fn load(self) -> Result<Document> {
        match self {
            BaseDocument::Fresh => Ok(Document::with_geo_namespaces()),
            BaseDocument::File(path) => {
                info!("Resuming from {:?}", path);
                json::read(&path)
            }
            BaseDocument::Document(doc) => Ok(doc),
        }
    }
}

#[derive(Debug)]
pub struct StageSummary {
    pub stage: StageKind,
    pub table: PathBuf,
    pub skipped: Vec<SkippedLayer>,
}

#[derive(Debug)]
pub struct FailedStage {
    pub stage: StageKind,
    pub error: Error,
}

#[derive(Debug)]
pub struct RunReport {
    pub document: Document,
    pub stages: Vec<StageSummary>,
    pub failed: Vec<FailedStage>,
    pub exported: Vec<PathBuf>,
    pub export_failures: Vec<FailedExport>,
}

impl RunReport {
    /// True when every stage was recorded and every format written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.export_failures.is_empty()
    }
}

pub struct Dispatcher<'a> {
    tools: &'a dyn Geoprocessing,
    source: &'a dyn LayerSource,
    exporter: Exporter,
}

impl<'a> Dispatcher<'a> {
    pub fn new(tools: &'a dyn Geoprocessing, source: &'a dyn LayerSource, exporter: Exporter) -> Self {
        Self {
            tools,
            source,
            exporter,
        }
    }

    /// Runs every populated stage in stage order. A failing stage is reported
    /// and left out of the merge; the other stages still land in the base
    /// document, which is then exported in `formats`. Export failures are
    /// reported per format alongside the merged document.
    pub fn run(
        &self,
        config: &StageConfig,
        workspace: &Workspace,
        base: BaseDocument,
        formats: &BTreeSet<ExportFormat>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let base = base.load()?;
        let recorder = Recorder::new(
            self.tools,
            self.source,
            workspace,
            &config.projection,
            config.cell_size,
        );

        let mut documents = Vec::new();
        let mut stages = Vec::new();
        let mut failed = Vec::new();

        for (stage, layers) in config.populated_stages() {
            match recorder.record_stage(stage, layers) {
                Ok(recorded) => {
                    for skip in &recorded.skipped {
                        warn!("{}: skipped {}: {}", stage, skip.layer, skip.error);
                    }
                    documents.push(recorded.document);
                    stages.push(StageSummary {
                        stage,
                        table: recorded.table,
                        skipped: recorded.skipped,
                    });
                }
                Err(e) => {
                    error!("Stage {} failed: {}", stage, e);
                    failed.push(FailedStage { stage, error: e });
                }
            }
        }

        let document = prov::merge(base, documents);
        let exported = self.exporter.export(&document, workspace, formats);

        info!(
            "Pipeline finished in {:?}: {} stages recorded, {} failed, {} formats not exported",
            started.elapsed(),
            stages.len(),
            failed.len(),
            exported.failed.len()
        );
        Ok(RunReport {
            document,
            stages,
            failed,
            exported: exported.written,
            export_failures: exported.failed,
        })
    }
}
