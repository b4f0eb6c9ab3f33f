// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The serialization point for concurrent edits.
//!
//! The [`Engine`] owns the authoritative document together with the
//! append-only log of every accepted operation. The current *revision* is the
//! length of that log. An incoming edit carries the revision it was authored
//! against; everything committed since then is concurrent to it, so the edit
//! is rebased across those operations before it is applied and appended:
//!
//! ```text
//!            op (authored at revision r)
//!         * ----> *
//!     c_r |       |
//!         v  op'  v
//!         * ----> *
//!     ... |       |            The left column is the revision log;
//!         v       v            the bottom-right corner is the new
//!         * ----> *            document state everyone converges on.
//! ```
//!
//! The returned rebased operation is what the rest of the session has to
//! apply. Committed operations keep their position on insert ties, so the
//! outcome only depends on the order in which the engine accepted the edits.

use crate::ot::{OperationError, TextOperation};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("operation was authored against revision {revision}, but the current revision is {current}")]
    RevisionOutOfRange { revision: usize, current: usize },
    #[error(transparent)]
    Operation(#[from] OperationError),
}

#[derive(Debug, Default)]
pub struct Engine {
    document: String,
    operations: Vec<TextOperation>,
}

impl Engine {
    #[must_use]
    pub fn revision(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Accepts an operation authored against `revision`, rebases it across
    /// all operations committed since, applies it to the document and appends
    /// it to the log. Returns the rebased operation.
    pub fn receive_operation(
        &mut self,
        revision: usize,
        mut operation: TextOperation,
    ) -> Result<TextOperation, EngineError> {
        if revision > self.revision() {
            return Err(EngineError::RevisionOutOfRange {
                revision,
                current: self.revision(),
            });
        }

        for committed in &self.operations[revision..] {
            // The committed side of the pair is already in the document and
            // is not needed again.
            operation = committed.transform(&operation)?.1;
        }

        let doc_len = self.document.chars().count();
        if operation.base_len() != doc_len {
            return Err(OperationError::LengthMismatch {
                expected: operation.base_len(),
                actual: doc_len,
            }
            .into());
        }

        self.document = operation.apply(&self.document)?;
        self.operations.push(operation.clone());
        debug!(
            revision = self.revision(),
            length = doc_len,
            "Accepted operation"
        );
        Ok(operation)
    }

    /// Drops the revision history. The document itself survives; the next
    /// state snapshot sent to the peers becomes their revision-0 baseline.
    pub fn clear_history(&mut self) {
        self.operations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::*;
    use crate::ot::OpStep;
    use pretty_assertions::assert_eq;

    fn engine_with(document: &str) -> Engine {
        let mut engine = Engine::default();
        if !document.is_empty() {
            engine
                .receive_operation(0, insert(0, document))
                .expect("seeding the engine failed");
        }
        engine
    }

    #[test]
    fn committed_insert_keeps_its_position_on_ties() {
        // Two peers edit "hi" concurrently, both at revision 0.
        let mut engine = engine_with("hi");
        let a = pad(insert(1, "X"), 2);
        let b = pad(insert(1, "Y"), 2);

        let a_committed = engine.receive_operation(1, a.clone()).unwrap();
        assert_eq!(a_committed, a);
        assert_eq!(engine.document(), "hXi");

        let b_rebased = engine.receive_operation(1, b).unwrap();
        assert_eq!(
            b_rebased,
            {
                let mut expected = TextOperation::default();
                expected.retain(2);
                expected.insert("Y");
                expected.retain(1);
                expected
            }
        );
        assert_eq!(engine.document(), "hXYi");
    }

    #[test]
    fn delete_against_concurrent_insert() {
        let mut engine = engine_with("abc");
        let a = pad(delete(1, 1), 3);
        let b = pad(insert(2, "Z"), 3);

        engine.receive_operation(1, a).unwrap();
        assert_eq!(engine.document(), "ac");

        let b_rebased = engine.receive_operation(1, b).unwrap();
        assert_eq!(engine.document(), "aZc");
        assert_eq!(
            b_rebased.0,
            vec![
                OpStep::Retain(1),
                OpStep::Insert("Z".to_string()),
                OpStep::Retain(1)
            ]
        );
    }

    #[test]
    fn revision_grows_by_one_per_accepted_operation() {
        let mut engine = engine_with("x");
        assert_eq!(engine.revision(), 1);
        let accepted = engine.receive_operation(0, insert(0, "y")).unwrap();
        assert_eq!(engine.revision(), 2);
        assert_eq!(engine.document().chars().count(), accepted.target_len());
    }

    #[test]
    fn revision_from_the_future_is_rejected() {
        let mut engine = engine_with("x");
        assert_eq!(
            engine.receive_operation(5, pad(insert(0, "y"), 1)),
            Err(EngineError::RevisionOutOfRange {
                revision: 5,
                current: 1
            })
        );
    }

    #[test]
    fn incompatible_length_is_rejected_and_leaves_state_intact() {
        let mut engine = engine_with("abc");
        let too_short = insert(1, "y"); // base length 1, document has 3
        assert!(matches!(
            engine.receive_operation(1, too_short),
            Err(EngineError::Operation(OperationError::LengthMismatch { .. }))
        ));
        assert_eq!(engine.document(), "abc");
        assert_eq!(engine.revision(), 1);
    }

    #[test]
    fn clear_history_resets_revision_but_not_the_document() {
        let mut engine = engine_with("keep me");
        engine.clear_history();
        assert_eq!(engine.revision(), 0);
        assert_eq!(engine.document(), "keep me");

        // The next operation is authored against the fresh baseline.
        engine
            .receive_operation(0, pad(insert(0, "do "), 7))
            .unwrap();
        assert_eq!(engine.document(), "do keep me");
    }
}
