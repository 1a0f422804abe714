use thiserror::Error;

/// Errors raised by the capacity-test computations.
///
/// File loading reports through `anyhow` with context instead; these are the
/// failures a caller may want to match on.
#[derive(Error, Debug)]
pub enum CapTestError {
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("column group not found: {0}")]
    GroupNotFound(String),

    #[error("regression variable '{0}' is not mapped to a column or group")]
    RegressionColumnMissing(String),

    #[error("{count} columns in '{name}'; aggregate the group or name a single column")]
    AmbiguousColumn { name: String, count: usize },

    #[error("length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    #[error("invalid tolerance '{0}': expected '+/- x', '-/+ x' or '- x'")]
    InvalidTolerance(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("regression has not been fit for '{0}'")]
    NotFitted(String),

    #[error("reporting conditions: {0}")]
    ReportingConditions(String),

    #[error("regression formulas differ: '{sim}' vs '{das}'")]
    FormulaMismatch { sim: String, das: String },

    #[error("statistics error: {0}")]
    Statistics(String),
}

pub type Result<T> = std::result::Result<T, CapTestError>;
