use thiserror::Error;

/// Errors raised by the partition / classification / scheduling layers.
///
/// "Not enough training signal" and "tile ran past its deadline" are not
/// errors: they surface as `TileOutcome::Skipped` and `TileState::TimedOut`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("unsupported pixel type: {0}")]
    UnsupportedPixelType(String),

    #[error("footprint mismatch: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}")]
    FootprintMismatch {
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("external step `{program}` failed: {reason}")]
    ExternalStep { program: String, reason: String },

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid tile state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
