//! Array-key expansion and multiset diffing.

use super::{push_field, split_fields, CodecError};

/// Expands a composite key whose slot at `array_pos` holds an array into
/// one composite entry per distinct element, with multiplicities.
///
/// The input key must be in canonical (uncollated) form. Each produced
/// entry is the full composite key with the array slot replaced by a single
/// element. Element order follows first occurrence. When `distinct` is set,
/// duplicate elements collapse to a single entry with count 1.
pub fn array_index_items(
    key: &[u8],
    array_pos: usize,
    distinct: bool,
    max_entry_len: Option<usize>,
) -> Result<(Vec<Vec<u8>>, Vec<u16>), CodecError> {
    let fields = split_fields(key)?;
    let slot = fields
        .get(array_pos)
        .copied()
        .ok_or(CodecError::Malformed("array position out of bounds"))?;
    let elements = split_fields(slot)?;
    if elements.is_empty() {
        return Err(CodecError::Malformed("empty array slot"));
    }

    let mut entries: Vec<Vec<u8>> = Vec::new();
    let mut element_keys: Vec<&[u8]> = Vec::new();
    let mut counts: Vec<u16> = Vec::new();

    for elem in elements {
        if let Some(at) = element_keys.iter().position(|e| *e == elem) {
            if !distinct {
                counts[at] = counts[at].saturating_add(1);
            }
            continue;
        }

        let mut entry = Vec::with_capacity(key.len());
        for (i, field) in fields.iter().enumerate() {
            if i == array_pos {
                push_field(&mut entry, elem);
            } else {
                push_field(&mut entry, field);
            }
        }
        if let Some(max) = max_entry_len {
            if entry.len() > max {
                return Err(CodecError::KeyTooLong {
                    len: entry.len(),
                    max,
                });
            }
        }
        element_keys.push(elem);
        entries.push(entry);
        counts.push(1);
    }

    Ok((entries, counts))
}

/// Diffs two expanded entry multisets.
///
/// Entries equal in both bytes and count are blanked out of both sides.
/// Returns `(to_add, to_delete)` aligned with `new_counts` / `old_counts`;
/// `None` slots must be skipped by the caller.
pub fn compare_array_entries_with_count(
    new_entries: Vec<Vec<u8>>,
    old_entries: Vec<Vec<u8>>,
    new_counts: &[u16],
    old_counts: &[u16],
) -> (Vec<Option<Vec<u8>>>, Vec<Option<Vec<u8>>>) {
    let mut to_add: Vec<Option<Vec<u8>>> = new_entries.into_iter().map(Some).collect();
    let mut to_delete: Vec<Option<Vec<u8>>> = old_entries.into_iter().map(Some).collect();

    for (i, add) in to_add.iter_mut().enumerate() {
        let Some(new_entry) = add.as_ref() else {
            continue;
        };
        let matched = to_delete.iter().position(|del| {
            del.as_ref().is_some_and(|old_entry| old_entry == new_entry)
        });
        if let Some(j) = matched {
            if new_counts[i] == old_counts[j] {
                *add = None;
                to_delete[j] = None;
            }
        }
    }

    (to_add, to_delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_key(scalar: &[u8], elems: &[&[u8]]) -> Vec<u8> {
        let mut slot = Vec::new();
        for e in elems {
            push_field(&mut slot, e);
        }
        let mut key = Vec::new();
        push_field(&mut key, scalar);
        push_field(&mut key, &slot);
        key
    }

    #[test]
    fn expansion_counts_duplicates() {
        let key = array_key(b"s", &[b"1", b"2", b"2", b"3"]);
        let (entries, counts) = array_index_items(&key, 1, false, None).expect("items");

        assert_eq!(entries.len(), 3);
        assert_eq!(counts, vec![1, 2, 1]);
        for e in &entries {
            let fields = split_fields(e).expect("fields");
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[0], b"s");
        }
    }

    #[test]
    fn distinct_collapses_duplicates() {
        let key = array_key(b"s", &[b"x", b"x", b"y"]);
        let (entries, counts) = array_index_items(&key, 1, true, None).expect("items");
        assert_eq!(entries.len(), 2);
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn diff_moves_count_changed_entries() {
        // prior [1,2,2,3] -> new [2,3,3,4]: "1" only deletes, "4" only
        // adds, and the count changes on "2" and "3" rewrite those rows.
        let old = array_key(b"s", &[b"1", b"2", b"2", b"3"]);
        let new = array_key(b"s", &[b"2", b"3", b"3", b"4"]);
        let (old_entries, old_counts) = array_index_items(&old, 1, false, None).expect("old");
        let (new_entries, new_counts) = array_index_items(&new, 1, false, None).expect("new");

        let (to_add, to_delete) =
            compare_array_entries_with_count(new_entries, old_entries, &new_counts, &old_counts);

        let adds: Vec<_> = to_add.iter().flatten().collect();
        let dels: Vec<_> = to_delete.iter().flatten().collect();
        assert_eq!(adds.len(), 3);
        assert_eq!(dels.len(), 3);
    }

    #[test]
    fn diff_blanks_unchanged_entries() {
        let key = array_key(b"s", &[b"a", b"b"]);
        let (entries, counts) = array_index_items(&key, 1, false, None).expect("items");
        let (to_add, to_delete) = compare_array_entries_with_count(
            entries.clone(),
            entries,
            &counts,
            &counts,
        );
        assert!(to_add.iter().all(Option::is_none));
        assert!(to_delete.iter().all(Option::is_none));
    }

    #[test]
    fn oversize_entry_rejected() {
        let key = array_key(b"scalar", &[&[7u8; 100][..]]);
        let err = array_index_items(&key, 1, false, Some(64));
        assert!(matches!(err, Err(CodecError::KeyTooLong { .. })));
    }
}
