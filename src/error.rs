//! Typed errors for the active-learning loop.
//!
//! Library contracts return [`OtfError`] (or [`OracleError`] from a
//! calculator) so callers can tell a fatal oracle failure apart from a
//! recoverable mapping miss or a configuration mistake caught before the run.

/// Failures of the ground-truth calculator. Every variant is fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("failed to launch oracle `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("oracle exited with {status}: {stderr}")]
    Process { status: String, stderr: String },

    #[error("oracle timed out after {secs:.1}s")]
    Timeout { secs: f64 },

    #[error("oracle timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("malformed oracle output: {0}")]
    Malformed(String),

    #[error("oracle returned {got} forces for {expected} atoms")]
    AtomCount { expected: usize, got: usize },

    #[error("oracle transport failed: {0}")]
    Transport(String),
}

/// Errors raised by the loop controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum OtfError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid structure: {0}")]
    Structure(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(
        "{body_order}-body mapping queried at {value:.4}, outside [{min:.4}, {max:.4}]"
    )]
    DomainViolation {
        body_order: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("mapping has no table for species {0}")]
    UnmappedSpecies(String),

    #[error("linear algebra failure: {0}")]
    Linalg(String),

    #[error("training batch of {batch} points exceeds active set cap {cap}")]
    BatchExceedsCap { batch: usize, cap: usize },

    #[error("duplicate training provenance: step {step}, atom {atom}")]
    DuplicateProvenance { step: usize, atom: usize },
}

impl OtfError {
    /// Whether the error should end the run (everything but a mapping miss).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::DomainViolation { .. } | Self::UnmappedSpecies(_)
        )
    }
}

/// Result alias for library operations.
pub type OtfResult<T> = std::result::Result<T, OtfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_error_converts_and_stays_fatal() {
        let err: OtfError = OracleError::Timeout { secs: 2.0 }.into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "oracle timed out after 2.0s");
    }

    #[test]
    fn test_domain_violation_is_recoverable() {
        let err = OtfError::DomainViolation {
            body_order: 2,
            value: 0.1,
            min: 0.5,
            max: 4.0,
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("2-body"));
    }

    #[test]
    fn test_atom_count_message() {
        let err = OracleError::AtomCount {
            expected: 4,
            got: 3,
        };
        assert_eq!(err.to_string(), "oracle returned 3 forces for 4 atoms");
    }
}
