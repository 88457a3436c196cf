//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file, or the merged document, is not valid settings JSON.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but breaks a constraint.
    #[error("{key} {reason}")]
    Invalid {
        /// Dotted camelCase path of the offending key.
        key: &'static str,
        /// What the value must satisfy.
        reason: &'static str,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/crossline.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.contains("/etc/crossline.json"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn invalid_reads_as_sentence() {
        let err = SettingsError::Invalid {
            key: "control.historyLimit",
            reason: "must be positive",
        };
        assert_eq!(err.to_string(), "control.historyLimit must be positive");
    }
}
