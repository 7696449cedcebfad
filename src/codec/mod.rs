//! Index entry codec.
//!
//! Composite secondary keys are a sequence of fields, each framed as
//! `[u16 BE len][bytes]`. An array-valued slot is a regular field whose
//! payload is itself a sequence of length-prefixed elements.
//!
//! A forward (mainstore) entry is
//! `key + docid + (count u16 LE when count > 1) + flags u8 + docid_len u16 BE`
//! so entries sort by raw key bytes first and can be parsed from the tail.
//! A back (backstore) entry is `key + count u16 LE`, count 0 meaning the
//! forward entry carries no count field.

mod array;

pub use array::{array_index_items, compare_array_entries_with_count};

const FLAG_COUNT: u8 = 0x01;

/// Fixed per-entry overhead: flags byte plus the docid length footer.
const ENTRY_TRAILER: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoded key too long ({len} > {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("malformed entry: {0}")]
    Malformed(&'static str),
}

/// Builds a primary index entry. The entry is the docid itself.
pub fn primary_entry(docid: &[u8], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    if docid.is_empty() {
        return Err(CodecError::Malformed("empty primary key"));
    }
    buf.clear();
    buf.extend_from_slice(docid);
    Ok(())
}

/// Builds a forward entry into `buf`.
///
/// `desc` holds one flag per leading field; descending fields are stored
/// reverse-collated. `max_len`, when set, bounds the raw key length.
pub fn secondary_entry(
    key: &[u8],
    docid: &[u8],
    count: u16,
    desc: &[bool],
    max_len: Option<usize>,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if key.is_empty() {
        return Err(CodecError::Malformed("empty secondary key"));
    }
    if let Some(max) = max_len {
        if key.len() > max {
            return Err(CodecError::KeyTooLong {
                len: key.len(),
                max,
            });
        }
    }
    if docid.len() > u16::MAX as usize {
        return Err(CodecError::Malformed("docid too long"));
    }

    buf.clear();
    buf.extend_from_slice(key);
    reverse_collate(buf, desc)?;
    buf.extend_from_slice(docid);

    let mut flags = 0u8;
    if count > 1 {
        flags |= FLAG_COUNT;
        buf.extend_from_slice(&count.to_le_bytes());
    }
    buf.push(flags);
    buf.extend_from_slice(&(docid.len() as u16).to_be_bytes());
    Ok(())
}

/// Parsed view over a forward entry's raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct SecEntry<'a> {
    buf: &'a [u8],
    key_len: usize,
    docid_len: usize,
    count: u16,
    count_encoded: bool,
}

impl<'a> SecEntry<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < ENTRY_TRAILER {
            return Err(CodecError::Malformed("entry shorter than trailer"));
        }
        let docid_len =
            u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]) as usize;
        let flags = buf[buf.len() - 3];
        let count_encoded = flags & FLAG_COUNT != 0;

        let mut fixed = ENTRY_TRAILER + docid_len;
        let mut count = 1u16;
        if count_encoded {
            fixed += 2;
            if buf.len() < fixed {
                return Err(CodecError::Malformed("entry shorter than count field"));
            }
            let at = buf.len() - ENTRY_TRAILER - 2;
            count = u16::from_le_bytes([buf[at], buf[at + 1]]);
        }
        if buf.len() <= fixed {
            return Err(CodecError::Malformed("entry missing key bytes"));
        }

        Ok(Self {
            buf,
            key_len: buf.len() - fixed,
            docid_len,
            count,
            count_encoded,
        })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn key(&self) -> &'a [u8] {
        &self.buf[..self.key_len]
    }

    pub fn docid(&self) -> &'a [u8] {
        &self.buf[self.key_len..self.key_len + self.docid_len]
    }

    pub fn len_key(&self) -> usize {
        self.key_len
    }

    pub fn len_docid(&self) -> usize {
        self.docid_len
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn is_count_encoded(&self) -> bool {
        self.count_encoded
    }
}

/// Extracts the back-index value for a forward entry: key bytes followed by
/// the count field (0 when the entry carries none).
pub fn entry_to_back_entry(entry: &[u8], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let e = SecEntry::parse(entry)?;
    buf.clear();
    buf.extend_from_slice(e.key());
    let count = if e.is_count_encoded() { e.count() } else { 0 };
    buf.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

/// Rebuilds the forward entry a back entry refers to.
pub fn back_entry_to_entry(
    docid: &[u8],
    bentry: &[u8],
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let key = back_entry_key(bentry)?;
    let count = back_entry_count(bentry)?;
    // The key is already in storage (collated) form.
    secondary_entry(key, docid, count.max(1), &[], None, buf)
}

pub fn back_entry_key(bentry: &[u8]) -> Result<&[u8], CodecError> {
    if bentry.len() < 2 {
        return Err(CodecError::Malformed("back entry shorter than count"));
    }
    Ok(&bentry[..bentry.len() - 2])
}

pub fn back_entry_count(bentry: &[u8]) -> Result<u16, CodecError> {
    if bentry.len() < 2 {
        return Err(CodecError::Malformed("back entry shorter than count"));
    }
    Ok(u16::from_le_bytes([
        bentry[bentry.len() - 2],
        bentry[bentry.len() - 1],
    ]))
}

/// True when `key` matches the key portion of an existing back entry, in
/// which case the forward index already holds the target state.
pub fn has_equal_back_entry(key: &[u8], bentry: &[u8]) -> bool {
    if key.is_empty() || bentry.len() < 2 {
        return false;
    }
    key == &bentry[..bentry.len() - 2]
}

/// Reverse-collates `key` in place: fields whose desc flag is set are
/// bitwise-complemented, flipping their sort order. The transform is an
/// involution; applying it twice restores the original bytes.
pub fn reverse_collate(key: &mut [u8], desc: &[bool]) -> Result<(), CodecError> {
    if desc.iter().all(|d| !d) {
        return Ok(());
    }

    let mut at = 0usize;
    let mut field = 0usize;
    while at < key.len() {
        if at + 2 > key.len() {
            return Err(CodecError::Malformed("truncated field length"));
        }
        let len = u16::from_be_bytes([key[at], key[at + 1]]) as usize;
        at += 2;
        if at + len > key.len() {
            return Err(CodecError::Malformed("truncated field payload"));
        }
        if desc.get(field).copied().unwrap_or(false) {
            for b in &mut key[at..at + len] {
                *b = !*b;
            }
        }
        at += len;
        field += 1;
    }
    Ok(())
}

/// Splits a composite key into its raw field payloads.
pub fn split_fields(key: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut fields = Vec::new();
    let mut at = 0usize;
    while at < key.len() {
        if at + 2 > key.len() {
            return Err(CodecError::Malformed("truncated field length"));
        }
        let len = u16::from_be_bytes([key[at], key[at + 1]]) as usize;
        at += 2;
        if at + len > key.len() {
            return Err(CodecError::Malformed("truncated field payload"));
        }
        fields.push(&key[at..at + len]);
        at += len;
    }
    Ok(fields)
}

/// Appends one length-prefixed field to a composite key under construction.
pub fn push_field(buf: &mut Vec<u8>, payload: &[u8]) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Smallest byte string greater than every string with prefix `key`.
///
/// Primary entries are exact docids, so appending a zero byte suffices.
/// Secondary entries extend the key with docid and trailer bytes, so the
/// successor must increment. Returns empty when no successor exists; the
/// caller treats that as an unbounded scan.
pub fn gen_next_bigger_key(key: &[u8], is_primary: bool) -> Vec<u8> {
    if is_primary {
        let mut next = Vec::with_capacity(key.len() + 1);
        next.extend_from_slice(key);
        next.push(0);
        return next;
    }

    let mut next = key.to_vec();
    while let Some(&last) = next.last() {
        if last < 0xff {
            let end = next.len() - 1;
            next[end] = last + 1;
            return next;
        }
        next.pop();
    }
    Vec::new()
}
