use std::path::PathBuf;

use thiserror::Error;
use wasmparser::BinaryReaderError;

/// Failure categories of a translation run.
///
/// Every variant is terminal: the first one raised aborts the run.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("malformed module at offset {offset:#x}: {message}")]
    MalformedModule { offset: usize, message: String },
    #[error("unsupported feature at offset {offset:#x}: {feature}")]
    UnsupportedFeature { offset: usize, feature: String },
    #[error("operand stack imbalance in function {func} at offset {offset:#x}: {detail}")]
    StackImbalance {
        func: u32,
        offset: usize,
        detail: String,
    },
    #[error("call signature mismatch in function {func} at offset {offset:#x}: {detail}")]
    CallSignatureMismatch {
        func: u32,
        offset: usize,
        detail: String,
    },
    #[error("unresolved import: {module}.{name}")]
    UnresolvedImport { module: String, name: String },
    #[error("failed to write {}", path.display())]
    EmissionIoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TranslateError {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        TranslateError::MalformedModule {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(offset: usize, feature: impl Into<String>) -> Self {
        TranslateError::UnsupportedFeature {
            offset,
            feature: feature.into(),
        }
    }
}

impl From<BinaryReaderError> for TranslateError {
    fn from(error: BinaryReaderError) -> Self {
        TranslateError::MalformedModule {
            offset: error.offset(),
            message: error.message().to_string(),
        }
    }
}

/// Finds the [`TranslateError`] behind an error returned by this crate.
pub fn kind_of(error: &anyhow::Error) -> Option<&TranslateError> {
    error.downcast_ref::<TranslateError>()
}
