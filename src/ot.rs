// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The text-operation algebra used throughout the server.
//!
//! A [`TextOperation`] describes one edit as a run of steps that walk the
//! document from left to right: retain some characters, insert a string,
//! delete some characters. Two derived lengths matter everywhere:
//!
//! - the *base length* (retains + deletes) is the length a document must have
//!   for the operation to apply,
//! - the *target length* (retains + inserts) is the length it has afterwards.
//!
//! All counting is in Unicode code points, not bytes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("operation applies to a document of length {expected}, but it has length {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("operations have incompatible lengths")]
    IncompatibleOperation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStep {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// On the wire, a step is a bare JSON value: a positive integer retains that
/// many characters, a negative integer deletes, and a string inserts itself.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireStep {
    Count(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextOperation(pub Vec<OpStep>);

impl IntoIterator for TextOperation {
    type Item = OpStep;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl TextOperation {
    /// Appends a retain step, coalescing with a trailing retain.
    /// Zero-sized steps are dropped, here and in the other push methods.
    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(OpStep::Retain(last)) = self.0.last_mut() {
            *last += n;
        } else {
            self.0.push(OpStep::Retain(n));
        }
    }

    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(OpStep::Insert(last)) = self.0.last_mut() {
            last.push_str(s);
        } else {
            self.0.push(OpStep::Insert(s.to_string()));
        }
    }

    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(OpStep::Delete(last)) = self.0.last_mut() {
            *last += n;
        } else {
            self.0.push(OpStep::Delete(n));
        }
    }

    #[must_use]
    pub fn base_len(&self) -> usize {
        self.0
            .iter()
            .map(|step| match step {
                OpStep::Retain(n) | OpStep::Delete(n) => *n,
                OpStep::Insert(_) => 0,
            })
            .sum()
    }

    #[must_use]
    pub fn target_len(&self) -> usize {
        self.0
            .iter()
            .map(|step| match step {
                OpStep::Retain(n) => *n,
                OpStep::Insert(s) => s.chars().count(),
                OpStep::Delete(_) => 0,
            })
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Runs the operation against a document.
    pub fn apply(&self, document: &str) -> Result<String, OperationError> {
        let doc_len = document.chars().count();
        if self.base_len() != doc_len {
            return Err(OperationError::LengthMismatch {
                expected: self.base_len(),
                actual: doc_len,
            });
        }
        let mut chars = document.chars();
        let mut result = String::with_capacity(document.len());
        for step in &self.0 {
            match step {
                OpStep::Retain(n) => {
                    result.extend(chars.by_ref().take(*n));
                }
                OpStep::Insert(s) => {
                    result.push_str(s);
                }
                OpStep::Delete(n) => {
                    for _ in chars.by_ref().take(*n) {}
                }
            }
        }
        Ok(result)
    }

    /// Merges two sequential operations into one, such that applying the
    /// result equals applying `self` and then `other`.
    pub fn compose(&self, other: &Self) -> Result<Self, OperationError> {
        if self.target_len() != other.base_len() {
            return Err(OperationError::IncompatibleOperation);
        }

        let mut composed = Self::default();
        let mut steps_a = self.0.iter().cloned();
        let mut steps_b = other.0.iter().cloned();
        let mut head_a = steps_a.next();
        let mut head_b = steps_b.next();

        loop {
            match (head_a.take(), head_b.take()) {
                (None, None) => break,
                // Deletes of the first operation happen on text the second
                // operation never sees.
                (Some(OpStep::Delete(n)), b_step) => {
                    composed.delete(n);
                    head_a = steps_a.next();
                    head_b = b_step;
                }
                // Inserts of the second operation land in the final document
                // unconditionally.
                (a_step, Some(OpStep::Insert(s))) => {
                    composed.insert(&s);
                    head_a = a_step;
                    head_b = steps_b.next();
                }
                (Some(OpStep::Retain(n)), Some(OpStep::Retain(m))) => match n.cmp(&m) {
                    Ordering::Less => {
                        composed.retain(n);
                        head_a = steps_a.next();
                        head_b = Some(OpStep::Retain(m - n));
                    }
                    Ordering::Equal => {
                        composed.retain(n);
                        head_a = steps_a.next();
                        head_b = steps_b.next();
                    }
                    Ordering::Greater => {
                        composed.retain(m);
                        head_a = Some(OpStep::Retain(n - m));
                        head_b = steps_b.next();
                    }
                },
                (Some(OpStep::Insert(s)), Some(OpStep::Retain(m))) => {
                    let len = s.chars().count();
                    match len.cmp(&m) {
                        Ordering::Less => {
                            composed.insert(&s);
                            head_a = steps_a.next();
                            head_b = Some(OpStep::Retain(m - len));
                        }
                        Ordering::Equal => {
                            composed.insert(&s);
                            head_a = steps_a.next();
                            head_b = steps_b.next();
                        }
                        Ordering::Greater => {
                            let boundary = char_boundary(&s, m);
                            composed.insert(&s[..boundary]);
                            head_a = Some(OpStep::Insert(s[boundary..].to_string()));
                            head_b = steps_b.next();
                        }
                    }
                }
                (Some(OpStep::Insert(s)), Some(OpStep::Delete(m))) => {
                    let len = s.chars().count();
                    match len.cmp(&m) {
                        Ordering::Less => {
                            head_a = steps_a.next();
                            head_b = Some(OpStep::Delete(m - len));
                        }
                        Ordering::Equal => {
                            head_a = steps_a.next();
                            head_b = steps_b.next();
                        }
                        Ordering::Greater => {
                            let boundary = char_boundary(&s, m);
                            head_a = Some(OpStep::Insert(s[boundary..].to_string()));
                            head_b = steps_b.next();
                        }
                    }
                }
                (Some(OpStep::Retain(n)), Some(OpStep::Delete(m))) => match n.cmp(&m) {
                    Ordering::Less => {
                        composed.delete(n);
                        head_a = steps_a.next();
                        head_b = Some(OpStep::Delete(m - n));
                    }
                    Ordering::Equal => {
                        composed.delete(n);
                        head_a = steps_a.next();
                        head_b = steps_b.next();
                    }
                    Ordering::Greater => {
                        composed.delete(m);
                        head_a = Some(OpStep::Retain(n - m));
                        head_b = steps_b.next();
                    }
                },
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OperationError::IncompatibleOperation)
                }
            }
        }

        Ok(composed)
    }

    /// Rebases two concurrent operations across each other, producing
    /// `(a', b')` with `compose(a, b') == compose(b, a')`.
    ///
    /// When both sides insert at the same position, `self`'s insert is
    /// ordered before `other`'s. This priority is fixed; applying it
    /// inconsistently would make peers diverge.
    pub fn transform(&self, other: &Self) -> Result<(Self, Self), OperationError> {
        if self.base_len() != other.base_len() {
            return Err(OperationError::IncompatibleOperation);
        }

        let mut a_prime = Self::default();
        let mut b_prime = Self::default();
        let mut steps_a = self.0.iter().cloned();
        let mut steps_b = other.0.iter().cloned();
        let mut head_a = steps_a.next();
        let mut head_b = steps_b.next();

        loop {
            match (head_a.take(), head_b.take()) {
                (None, None) => break,
                (Some(OpStep::Insert(s)), b_step) => {
                    b_prime.retain(s.chars().count());
                    a_prime.insert(&s);
                    head_a = steps_a.next();
                    head_b = b_step;
                }
                (a_step, Some(OpStep::Insert(s))) => {
                    a_prime.retain(s.chars().count());
                    b_prime.insert(&s);
                    head_a = a_step;
                    head_b = steps_b.next();
                }
                (Some(OpStep::Retain(n)), Some(OpStep::Retain(m))) => {
                    let (consumed, rest_a, rest_b) = split_counts(n, m);
                    a_prime.retain(consumed);
                    b_prime.retain(consumed);
                    head_a = rest_a.map(OpStep::Retain).or_else(|| steps_a.next());
                    head_b = rest_b.map(OpStep::Retain).or_else(|| steps_b.next());
                }
                // Both sides delete the same text; it is gone either way.
                (Some(OpStep::Delete(n)), Some(OpStep::Delete(m))) => {
                    let (_, rest_a, rest_b) = split_counts(n, m);
                    head_a = rest_a.map(OpStep::Delete).or_else(|| steps_a.next());
                    head_b = rest_b.map(OpStep::Delete).or_else(|| steps_b.next());
                }
                (Some(OpStep::Delete(n)), Some(OpStep::Retain(m))) => {
                    let (consumed, rest_a, rest_b) = split_counts(n, m);
                    a_prime.delete(consumed);
                    head_a = rest_a.map(OpStep::Delete).or_else(|| steps_a.next());
                    head_b = rest_b.map(OpStep::Retain).or_else(|| steps_b.next());
                }
                (Some(OpStep::Retain(n)), Some(OpStep::Delete(m))) => {
                    let (consumed, rest_a, rest_b) = split_counts(n, m);
                    b_prime.delete(consumed);
                    head_a = rest_a.map(OpStep::Retain).or_else(|| steps_a.next());
                    head_b = rest_b.map(OpStep::Delete).or_else(|| steps_b.next());
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OperationError::IncompatibleOperation)
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

/// Consumes the overlap of two step counts, returning the leftovers.
fn split_counts(n: usize, m: usize) -> (usize, Option<usize>, Option<usize>) {
    match n.cmp(&m) {
        Ordering::Less => (n, None, Some(m - n)),
        Ordering::Equal => (n, None, None),
        Ordering::Greater => (m, Some(n - m), None),
    }
}

/// Byte index of the `n`-th character of `s`.
fn char_boundary(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(index, _)| index)
}

impl Serialize for TextOperation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|step| match step {
            OpStep::Retain(n) => WireStep::Count(*n as i64),
            OpStep::Delete(n) => WireStep::Count(-(*n as i64)),
            OpStep::Insert(s) => WireStep::Text(s.clone()),
        }))
    }
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let steps = Vec::<WireStep>::deserialize(deserializer)?;
        let mut operation = Self::default();
        for step in steps {
            match step {
                WireStep::Count(n) if n >= 0 => operation.retain(n as usize),
                WireStep::Count(n) => operation.delete(n.unsigned_abs() as usize),
                WireStep::Text(s) => operation.insert(&s),
            }
        }
        Ok(operation)
    }
}

pub mod factories {
    use super::TextOperation;

    pub fn insert(at: usize, s: &str) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(at);
        operation.insert(s);
        operation
    }

    pub fn delete(from: usize, length: usize) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(from);
        operation.delete(length);
        operation
    }

    pub fn replace(from: usize, length: usize, s: &str) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(from);
        operation.delete(length);
        operation.insert(s);
        operation
    }

    /// Pads an operation with a trailing retain so it applies to `base_len`.
    pub fn pad(mut operation: TextOperation, base_len: usize) -> TextOperation {
        let missing = base_len - operation.base_len();
        operation.retain(missing);
        operation
    }
}
