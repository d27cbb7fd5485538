use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to retrieve layer '{layer}': {reason}")]
    Retrieval { layer: String, reason: String },

    #[error("{tool} failed: {diagnostic}")]
    ToolInvocation { tool: String, diagnostic: String },

    #[error("{tool} reported success but did not produce {}", path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unrecognized layer kind for '{0}'")]
    UnrecognizedLayerKind(String),

    #[error("layer '{layer}' cannot be used for {stage}: {reason}")]
    UnsupportedLayer {
        layer: String,
        stage: String,
        reason: String,
    },

    #[error("malformed table {}: {reason}", path.display())]
    Table { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Gdal(#[from] gdal::errors::GdalError),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn tool(tool: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Error::ToolInvocation {
            tool: tool.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub(crate) fn retrieval(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Retrieval {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}
