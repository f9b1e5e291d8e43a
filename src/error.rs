use thiserror::Error;

/// Failure to generate metadata for one function.
///
/// Carries the byte offset into the function body where generation stopped.
/// There is no partial success: the caller discards the whole attempt and is
/// free to fall back to a different execution strategy.
#[derive(Debug, Error)]
#[error("metadata generation failed at offset {offset}: {message}")]
pub struct CompileFailure {
    /// Byte offset into the function body (or module, for module-level
    /// parse errors) at which the failing input was encountered.
    pub offset: usize,
    pub message: String,
}

impl CompileFailure {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        CompileFailure {
            offset,
            message: message.into(),
        }
    }
}

impl From<wasmparser::BinaryReaderError> for CompileFailure {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        CompileFailure {
            offset: err.offset(),
            message: err.message().to_string(),
        }
    }
}
