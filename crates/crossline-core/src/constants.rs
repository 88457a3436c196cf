//! Package-level constants.

/// Protocol stack version reported in `SysInfo`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on a flow-lock duration in seconds.
pub const MAX_LOCK_DURATION_SECS: u32 = 3600;

/// Default number of control-mode history entries kept per cross.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_has_three_numeric_parts() {
        let parts: Vec<u32> = VERSION.split('.').map(|p| p.parse().unwrap()).collect();
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn lock_ceiling_is_one_hour() {
        assert_eq!(MAX_LOCK_DURATION_SECS, 60 * 60);
    }
}
