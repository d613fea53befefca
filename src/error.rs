//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// A denied request is not an error: it is reported through
/// [`crate::ratelimit::Decision`].
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fill rate must be a finite number of tokens per second above zero
    #[error("Invalid fill rate {0}: must be finite and greater than zero")]
    InvalidFillRate(f64),

    /// Capacity must hold at least one token
    #[error("Invalid capacity {0}: must be greater than zero")]
    InvalidCapacity(u64),

    /// The configured algorithm has no implementation
    #[error("Unsupported rate limiting algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Bucket store backing failures
    #[error("Bucket store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Check a fill rate before it reaches bucket arithmetic.
pub fn validate_fill_rate(fill_rate: f64) -> Result<()> {
    if fill_rate.is_finite() && fill_rate > 0.0 {
        Ok(())
    } else {
        Err(TollgateError::InvalidFillRate(fill_rate))
    }
}

/// Check a capacity before it reaches bucket arithmetic.
pub fn validate_capacity(capacity: u64) -> Result<()> {
    if capacity > 0 {
        Ok(())
    } else {
        Err(TollgateError::InvalidCapacity(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fill_rate() {
        assert!(validate_fill_rate(5.0).is_ok());
        assert!(validate_fill_rate(0.001).is_ok());
        assert!(matches!(validate_fill_rate(0.0), Err(TollgateError::InvalidFillRate(_))));
        assert!(matches!(validate_fill_rate(-1.0), Err(TollgateError::InvalidFillRate(_))));
        assert!(validate_fill_rate(f64::NAN).is_err());
        assert!(validate_fill_rate(f64::INFINITY).is_err());
    }

    #[test]
    fn test_validate_capacity() {
        assert!(validate_capacity(1).is_ok());
        assert!(matches!(validate_capacity(0), Err(TollgateError::InvalidCapacity(0))));
    }

    #[test]
    fn test_error_messages() {
        let err = TollgateError::UnsupportedAlgorithm("leaky_bucket".to_string());
        assert_eq!(err.to_string(), "Unsupported rate limiting algorithm: leaky_bucket");
    }
}
