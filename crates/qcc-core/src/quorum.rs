//! The quorum comparator.
//!
//! Comparison is on raw wire bytes: two replies that are semantically
//! equal but serialized differently are deliberately not coalesced. Peers
//! are assumed to serialize identically; if that assumption ever breaks,
//! quorum will under-count rather than silently disagree on meaning.

use std::collections::HashMap;

/// Returns the size of the largest group of byte-identical, present
/// payloads. Absent slots (`None`) never contribute to any group.
///
/// Ties are broken unobservably: only the maximum count is returned, not
/// which payload achieved it — callers that need the winning payload scan
/// `slots` again for the first entry matching that count.
pub fn quorum_size(slots: &[Option<Vec<u8>>]) -> usize {
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    let mut best = 0usize;
    for slot in slots.iter().flatten() {
        let c = counts.entry(slot.as_slice()).or_insert(0);
        *c += 1;
        best = best.max(*c);
    }
    best
}

/// Returns the first present payload belonging to the largest group, or
/// `None` if every slot is empty.
pub fn quorum_payload(slots: &[Option<Vec<u8>>]) -> Option<&[u8]> {
    let target = quorum_size(slots);
    if target == 0 {
        return None;
    }
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for slot in slots.iter().flatten() {
        let c = counts.entry(slot.as_slice()).or_insert(0);
        *c += 1;
        if *c == target {
            return Some(slot.as_slice());
        }
    }
    None
}

/// Returns the slot index of the first payload belonging to the largest
/// group, so callers can recover whatever richer value that slot stands
/// for (e.g. the parsed reply, not just its raw bytes).
pub fn quorum_index(slots: &[Option<Vec<u8>>]) -> Option<usize> {
    let target = quorum_size(slots);
    if target == 0 {
        return None;
    }
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for (idx, slot) in slots.iter().enumerate() {
        let Some(bytes) = slot else { continue };
        let c = counts.entry(bytes.as_slice()).or_insert(0);
        *c += 1;
        if *c == target {
            return Some(idx);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(vals: &[Option<&[u8]>]) -> Vec<Option<Vec<u8>>> {
        vals.iter().map(|v| v.map(|b| b.to_vec())).collect()
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(quorum_size(&[None, None, None]), 0);
    }

    #[test]
    fn unanimous_three() {
        let s = slots(&[Some(b"x"), Some(b"x"), Some(b"x")]);
        assert_eq!(quorum_size(&s), 3);
    }

    #[test]
    fn majority_two_of_three() {
        let s = slots(&[Some(b"x"), Some(b"x"), Some(b"y")]);
        assert_eq!(quorum_size(&s), 2);
    }

    #[test]
    fn no_agreement() {
        let s = slots(&[Some(b"x"), Some(b"y"), Some(b"z")]);
        assert_eq!(quorum_size(&s), 1);
    }

    #[test]
    fn partial_absence_still_counts_present() {
        let s = slots(&[Some(b"x"), None, Some(b"x")]);
        assert_eq!(quorum_size(&s), 2);
    }

    proptest::proptest! {
        #[test]
        fn quorum_equals_mode_multiplicity(vals in proptest::collection::vec(0u8..4, 0..8)) {
            let s: Vec<Option<Vec<u8>>> = vals.iter().map(|v| Some(vec![*v])).collect();
            let mut counts = std::collections::HashMap::new();
            for v in &vals {
                *counts.entry(*v).or_insert(0usize) += 1;
            }
            let expected = counts.values().copied().max().unwrap_or(0);
            assert_eq!(quorum_size(&s), expected);
        }
    }
}
