// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracks, for every character of the document, which peer typed it last.
//!
//! The bookkeeping piggybacks on the accepted operations: each edit is
//! mirrored by a parallel operation that inserts the author's tag character
//! instead of the inserted text, so the tag string always stays aligned with
//! the document. Surviving retained characters keep their earlier tag.

use crate::ot::{OpStep, OperationError, TextOperation};

/// The tag alphabet. Index 0 marks text without an author; peer id `i` maps
/// to index `i + 1`. Its size bounds how many peers a session can hold.
pub const PEER_TAGS: &str =
    "~ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Number of assignable peer ids.
pub const MAX_PEERS: usize = PEER_TAGS.len() - 1;

#[must_use]
pub fn peer_tag(id: i64) -> char {
    usize::try_from(id + 1)
        .ok()
        .and_then(|index| PEER_TAGS.chars().nth(index))
        .unwrap_or_else(|| PEER_TAGS.chars().next().expect("alphabet is not empty"))
}

/// Inverse of [`peer_tag`]; the reserved tag maps back to -1.
#[must_use]
pub fn peer_id(tag: char) -> i64 {
    PEER_TAGS
        .chars()
        .position(|candidate| candidate == tag)
        .map_or(-1, |index| index as i64 - 1)
}

#[derive(Debug, Default)]
pub struct AuthorMap {
    tags: String,
}

impl AuthorMap {
    /// Mirrors an accepted operation: retains and deletes are copied, each
    /// insert becomes a run of the author's tag of the same length.
    pub fn record(&mut self, operation: &TextOperation, src_id: i64) -> Result<(), OperationError> {
        let tag = peer_tag(src_id);
        let mut parallel = TextOperation::default();
        for step in &operation.0 {
            match step {
                OpStep::Retain(n) => parallel.retain(*n),
                OpStep::Delete(n) => parallel.delete(*n),
                OpStep::Insert(s) => {
                    let run: String = std::iter::repeat(tag).take(s.chars().count()).collect();
                    parallel.insert(&run);
                }
            }
        }
        self.tags = parallel.apply(&self.tags)?;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.chars().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Compresses the tag string into `(peer_id, run_length)` pairs covering
    /// the whole document, adjacent runs of the same author merged.
    #[must_use]
    pub fn ranges(&self) -> Vec<(i64, usize)> {
        let mut ranges: Vec<(i64, usize)> = Vec::new();
        for tag in self.tags.chars() {
            let id = peer_id(tag);
            match ranges.last_mut() {
                Some((last_id, count)) if *last_id == id => *count += 1,
                _ => ranges.push((id, 1)),
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tag_alphabet_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        assert!(PEER_TAGS.chars().all(|tag| seen.insert(tag)));
    }

    #[test]
    fn ids_map_to_tags_and_back() {
        for id in 0..MAX_PEERS as i64 {
            assert_eq!(peer_id(peer_tag(id)), id);
        }
        // Out-of-range authors fall back to the reserved tag.
        assert_eq!(peer_tag(-1), PEER_TAGS.chars().next().unwrap());
        assert_eq!(peer_tag(MAX_PEERS as i64 + 7), peer_tag(-1));
    }

    #[test]
    fn inserts_take_the_tag_of_their_author() {
        let mut authors = AuthorMap::default();
        authors.record(&insert(0, "hi"), 0).unwrap();
        authors.record(&pad(insert(2, "!"), 2), 1).unwrap();

        assert_eq!(authors.len(), 3);
        assert_eq!(authors.ranges(), vec![(0, 2), (1, 1)]);
    }

    #[test]
    fn overwrites_replace_the_previous_author() {
        let mut authors = AuthorMap::default();
        authors.record(&insert(0, "abcd"), 0).unwrap();
        authors.record(&pad(replace(1, 2, "XY"), 4), 1).unwrap();

        assert_eq!(authors.ranges(), vec![(0, 1), (1, 2), (0, 1)]);
    }

    #[test]
    fn deletes_shrink_the_map() {
        let mut authors = AuthorMap::default();
        authors.record(&insert(0, "abcd"), 2).unwrap();
        authors.record(&pad(delete(0, 3), 4), 0).unwrap();

        assert_eq!(authors.len(), 1);
        assert_eq!(authors.ranges(), vec![(2, 1)]);
    }

    #[test]
    fn length_stays_aligned_with_the_document() {
        let mut authors = AuthorMap::default();
        let mut document = String::new();
        let edits = [
            (0, insert(0, "hello")),
            (1, pad(insert(5, " world"), 5)),
            (0, pad(delete(0, 4), 11)),
            (2, pad(replace(3, 2, "🥕"), 7)),
        ];
        for (author, operation) in edits {
            document = operation.apply(&document).unwrap();
            authors.record(&operation, author).unwrap();
            assert_eq!(authors.len(), document.chars().count());
        }
    }

    #[test]
    fn empty_map_has_no_ranges() {
        assert_eq!(AuthorMap::default().ranges(), vec![]);
    }
}
