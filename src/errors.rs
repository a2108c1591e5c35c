use thiserror::Error;

/// Errors surfaced by the public API of this crate.
///
/// Construction/load failures return `Err`; mis-configuration that has a
/// safe fallback is instead reported through `tracing::warn!` (see
/// DESIGN.md) and does not appear here.
#[derive(Error, Debug)]
pub enum GPError {
    #[error("invalid layer dimensions: n_in={n_in}, n_out={n_out} (both must be >= 1)")]
    InvalidDimensions { n_in: usize, n_out: usize },

    #[error("layer chain broken: layer {layer} expects n_in={expected} but previous layer produced n_out={found}")]
    ShapeMismatch {
        layer: usize,
        expected: usize,
        found: usize,
    },

    #[error("gradient/parameter buffer has wrong length: expected {expected}, found {found}")]
    BufferLengthMismatch { expected: usize, found: usize },

    #[error("failed to read model file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model archive '{path}': {reason}")]
    Archive { path: String, reason: String },

    #[error("array '{name}' in model file '{path}' has dtype '{dtype}', expected float32 ('f') or ascii string ('S')")]
    UnsupportedDtype {
        path: String,
        name: String,
        dtype: char,
    },

    #[error("array '{name}' in model file '{path}' is Fortran-ordered, which is not supported")]
    FortranOrderUnsupported { path: String, name: String },

    #[error("model file '{path}' has an odd number of float32 arrays ({count}); weights and biases must pair up")]
    OddArrayCount { path: String, count: usize },

    #[error("unknown loss function '{0}'")]
    UnknownLoss(String),

    #[error("failed to load dynamic activation '{symbol}' from '{library}': {reason}")]
    DynamicActivation {
        symbol: String,
        library: String,
        reason: String,
    },

    #[error("batch size must be >= 1")]
    InvalidBatchSize,
}

pub type GPResult<T> = Result<T, GPError>;
