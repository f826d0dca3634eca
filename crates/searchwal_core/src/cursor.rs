//! Replay cursor.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use serde::{Deserialize, Serialize};

/// A consumer's persisted replay position.
///
/// - `applied_lsn`: every record at or below it has been processed; every
///   transaction that committed at or below it is reflected in storage
/// - `restart_lsn`: where reading must resume; the start of the oldest
///   record of a transaction still open at `applied_lsn`, or `applied_lsn`
///   itself when none is open
///
/// Both positions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCursor {
    /// Last fully processed position.
    pub applied_lsn: Lsn,
    /// Position to resume reading from.
    pub restart_lsn: Lsn,
}

impl ReplayCursor {
    /// Creates a cursor. `restart_lsn` is clamped to `applied_lsn`.
    #[must_use]
    pub fn new(applied_lsn: Lsn, restart_lsn: Lsn) -> Self {
        Self {
            applied_lsn,
            restart_lsn: restart_lsn.min(applied_lsn),
        }
    }

    /// Creates a cursor with no open transactions at `lsn`.
    #[must_use]
    pub const fn at(lsn: Lsn) -> Self {
        Self {
            applied_lsn: lsn,
            restart_lsn: lsn,
        }
    }

    /// Moves the cursor forward to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OrderingViolation`] if either position would
    /// move backwards.
    pub fn advance_to(&mut self, next: ReplayCursor) -> CoreResult<()> {
        if next.applied_lsn < self.applied_lsn || next.restart_lsn < self.restart_lsn {
            return Err(CoreError::ordering_violation(format!(
                "cursor cannot move back from applied {} / restart {} to applied {} / restart {}",
                self.applied_lsn, self.restart_lsn, next.applied_lsn, next.restart_lsn
            )));
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_never_exceeds_applied() {
        let cursor = ReplayCursor::new(Lsn::new(10), Lsn::new(50));
        assert_eq!(cursor.restart_lsn, Lsn::new(10));
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut cursor = ReplayCursor::at(Lsn::new(100));
        cursor
            .advance_to(ReplayCursor::new(Lsn::new(200), Lsn::new(150)))
            .unwrap();

        let err = cursor.advance_to(ReplayCursor::at(Lsn::new(120))).unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
        assert_eq!(cursor.applied_lsn, Lsn::new(200));

        let err = cursor
            .advance_to(ReplayCursor::new(Lsn::new(300), Lsn::new(140)))
            .unwrap_err();
        assert!(matches!(err, CoreError::OrderingViolation { .. }));
    }

    #[test]
    fn json_shape_is_stable() {
        let cursor = ReplayCursor::new(Lsn::new(64), Lsn::new(32));
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(json, r#"{"applied_lsn":64,"restart_lsn":32}"#);
        assert_eq!(serde_json::from_str::<ReplayCursor>(&json).unwrap(), cursor);
    }
}
