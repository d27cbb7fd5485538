//! Filesystem layout of a pipeline run.
//!
//! Every component receives a [`Workspace`] explicitly; nothing depends on the
//! process working directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::StageKind;
use crate::error::Result;

/// Fixed prefix of every exported provenance file.
pub const PROV_FILE_PREFIX: &str = "GEOGEAR-prov";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Downloaded and raw layers.
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// Intermediate reprojected, rasterized and tabular artifacts.
    pub fn analysis_dir(&self) -> PathBuf {
        self.root.join("analysis")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.output_dir().join(stage.as_str())
    }

    pub fn provenance_dir(&self) -> PathBuf {
        self.output_dir().join("provenance")
    }

    /// The grid template raster every stage aligns to.
    pub fn grid_raster(&self) -> PathBuf {
        self.stage_dir(StageKind::Grid).join("grid.tif")
    }

    /// The stage-independent grid index table.
    pub fn grid_table(&self) -> PathBuf {
        self.stage_dir(StageKind::Grid).join("grid.csv")
    }

    /// Creates `input/`, `analysis/` and `output/<stage>/`.
    pub fn prepare(&self, stage: StageKind) -> Result<()> {
        fs::create_dir_all(self.input_dir())?;
        fs::create_dir_all(self.analysis_dir())?;
        fs::create_dir_all(self.stage_dir(stage))?;
        Ok(())
    }
}
