use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = AssemblyError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("template does not exist: {}", .0.display())]
    TemplateMissing(PathBuf),

    #[error("container cannot be opened as a zip archive: {}", path.display())]
    ArchiveCorrupt {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// A part recorded at unpack time is gone from the working tree.
    #[error("container part missing from working tree: {0}")]
    PartMissing(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("xml part {part} could not be processed")]
    Xml {
        part: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("heading not found: {0}")]
    HeadingNotFound(String),

    #[error("document not accessible ({reason}): {}", path.display())]
    DocumentNotAccessible { path: PathBuf, reason: String },

    #[error("office automation unavailable: {0}")]
    ExternalServiceUnavailable(String),

    #[error("office automation failed: {0}")]
    ExternalOperationFailed(String),

    #[error("required field `{field}` has no data and section `{heading}` cannot be pruned")]
    PartialDataError { field: String, heading: String },
}

impl AssemblyError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn xml(part: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Xml {
            part: part.into(),
            source: source.into(),
        }
    }
}
