//! User-supplied key ordering and record codec.
//!
//! Grounded on `vector_buffers::encoding::{Encodable, FixedEncodable}`: a
//! small trait surface over `bytes::{Buf, BufMut}` rather than anything
//! tied to a specific serialization framework, so the engine stays agnostic
//! to what a "record" actually looks like.

use std::cmp::Ordering;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Orders two keys in their wire form.
///
/// Implementations may declare themselves raw-byte comparators via
/// [`Comparator::is_raw_byte_order`] to let [`crate::merge_driver`] take the
/// fast path described in spec §4.D (comparing the encoded key bytes
/// directly instead of invoking user code per comparison).
pub trait Comparator: Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// When `true`, `compare` is guaranteed equivalent to
    /// `a.cmp(b)` on the raw wire bytes, and callers may skip invoking it.
    fn is_raw_byte_order(&self) -> bool {
        false
    }
}

/// Byte-lexicographic comparator; the common case, and the raw-bytes fast
/// path target.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawByteComparator;

impl Comparator for RawByteComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn is_raw_byte_order(&self) -> bool {
        true
    }
}

/// Reads and writes one (key, value) record from/to a byte stream.
///
/// This is intentionally narrower than `vector_buffers::Encodable`: the
/// merge engine only ever needs "read one record" / "write one record", it
/// never needs metadata-gated schema evolution, so there is no
/// `Metadata`/`can_decode` machinery to carry around.
pub trait Serializer: Send + Sync + 'static {
    /// Writes one record's key and value to `out`, returning the number of
    /// bytes written.
    fn write_record(&self, key: &[u8], value: &[u8], out: &mut BytesMut) -> io::Result<usize>;

    /// Reads one record's key and value from `buf`, advancing it past the
    /// record. Returns `None` if `buf` does not contain a complete record
    /// (the caller should read more bytes and retry).
    fn read_record(&self, buf: &mut Bytes) -> io::Result<Option<(Bytes, Bytes)>>;
}

/// Length-prefixed `(u32 key_len, key, u32 value_len, value)` codec; the
/// simplest serializer satisfying the trait, used by tests and the demo
/// binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedSerializer;

impl Serializer for LengthPrefixedSerializer {
    fn write_record(&self, key: &[u8], value: &[u8], out: &mut BytesMut) -> io::Result<usize> {
        let start = out.len();
        out.put_u32(key.len() as u32);
        out.put_slice(key);
        out.put_u32(value.len() as u32);
        out.put_slice(value);
        Ok(out.len() - start)
    }

    fn read_record(&self, buf: &mut Bytes) -> io::Result<Option<(Bytes, Bytes)>> {
        let mut probe = buf.clone();
        if probe.remaining() < 4 {
            return Ok(None);
        }
        let key_len = probe.get_u32() as usize;
        if probe.remaining() < key_len + 4 {
            return Ok(None);
        }
        let key = probe.copy_to_bytes(key_len);
        let value_len = probe.get_u32() as usize;
        if probe.remaining() < value_len {
            return Ok(None);
        }
        let value = probe.copy_to_bytes(value_len);

        *buf = probe;
        Ok(Some((key, value)))
    }
}
