pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod layer;
pub mod pipeline;
pub mod prov;
pub mod recorder;
pub mod table;
pub mod tools;
pub mod workspace;

pub use config::{ExportFormat, LayerSpec, StageConfig, StageKind};
pub use error::{Error, Result};
pub use export::{Exported, Exporter, FailedExport};
pub use fetch::{HttpLayerSource, LayerSource};
pub use layer::LayerKind;
pub use pipeline::{BaseDocument, Dispatcher, RunReport};
pub use prov::{merge, Document, QualifiedName};
pub use recorder::{Recorder, StageDocument};
pub use tools::{Geoprocessing, SagaGdal};
pub use workspace::Workspace;
