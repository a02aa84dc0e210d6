use thiserror::Error;

/// Crate-level error type.
///
/// Signal producers inside [`crate::engine::RiskEngine::evaluate`] never
/// surface errors: a producer that cannot compute a score degrades to a
/// sentinel value and the fuser drops its weight. These variants cover the
/// explicit fallible surfaces only (construction, state import).
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state import failed: {0}")]
    Import(String),
}
