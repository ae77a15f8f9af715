//! Bucket attribute codec: delta-varint offsets plus Gorilla XOR values, decoded as a stream.
//!
//! One encoded attribute is a self-contained blob:
//!
//! ```text
//! varint(count) varint(offsets_len) offsets values
//! offsets := varint(delta) * count          (non-decreasing offsets, first delta from 0)
//! values  := u64 LE first value bits, then the XOR bit stream of the remaining values
//! ```
//!
//! An empty blob encodes zero points. Decoders are seeded with an anchor that is added to every
//! decoded offset, so the same blob can be read as relative offsets (anchor 0) or as absolute
//! positions (anchor = window start).

use crate::error::DbError;
use crate::types::Value;

use std::io::Read;

/// A decoded `(anchor + offset, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPoint {
    pub offset: i64,
    pub value: Value,
}

/// Encodes `(offset, value)` pairs into one attribute blob. Offsets must be non-decreasing.
pub fn encode_attribute(points: &[(u64, Value)]) -> Result<Vec<u8>, DbError> {
    if points.is_empty() {
        return Ok(Vec::new());
    }
    let count: u32 = points
        .len()
        .try_into()
        .map_err(|_| DbError::Internal("Attribute stream too large".to_string()))?;

    let mut offsets: Vec<u8> = Vec::with_capacity(points.len());
    let mut prev = 0u64;
    for &(offset, _) in points {
        if offset < prev {
            return Err(DbError::Internal(
                "Offsets must be sorted for delta encoding".to_string(),
            ));
        }
        write_var_u64(&mut offsets, offset - prev);
        prev = offset;
    }

    let mut buf = Vec::with_capacity(16 + offsets.len() + points.len() * 2);
    write_var_u32(&mut buf, count);
    write_var_u64(&mut buf, offsets.len() as u64);
    buf.extend_from_slice(&offsets);

    let values: Vec<u64> = points.iter().map(|&(_, v)| v.to_bits()).collect();
    encode_gorilla_xor_u64(&values, &mut buf);
    Ok(buf)
}

/// Decodes a whole attribute blob. Used by the write path when merging into an existing bucket.
pub fn decode_attribute(anchor: i64, data: &[u8]) -> Result<Vec<DecodedPoint>, DbError> {
    let mut dec = BucketDecoder::new(anchor, data)?;
    let mut out = Vec::with_capacity(dec.remaining().min(data.len()));
    while let Some(p) = dec.next_point()? {
        out.push(p);
    }
    Ok(out)
}

/// Streaming decoder over one attribute blob.
///
/// Nothing is materialised up front: each call to [`BucketDecoder::next_point`] consumes one
/// offset varint and one value from the XOR bit stream.
#[derive(Debug)]
pub struct BucketDecoder<'a> {
    anchor: i64,
    remaining: usize,
    offsets: &'a [u8],
    bits: BitReader<&'a [u8]>,
    first_value: Option<u64>,
    prev_offset: u64,
    prev_value: u64,
    window: XorWindow,
}

#[derive(Debug, Default, Clone, Copy)]
struct XorWindow {
    leading: u8,
    trailing: u8,
    sigbits: u8,
}

impl<'a> BucketDecoder<'a> {
    /// Parses the blob header. The returned decoder yields `anchor + offset` for every point.
    pub fn new(anchor: i64, data: &'a [u8]) -> Result<Self, DbError> {
        let mut cur = data;
        let (count, offsets, mut values) = if cur.is_empty() {
            (0usize, cur, cur)
        } else {
            let count = read_var_u32(&mut cur).map_err(DbError::corruption)? as usize;
            let offsets_len = read_var_u64(&mut cur).map_err(DbError::corruption)? as usize;
            if offsets_len > cur.len() {
                return Err(DbError::corruption("Truncated offset section"));
            }
            if count > offsets_len {
                return Err(DbError::corruption(format!(
                    "Point count {} exceeds offset section of {} bytes",
                    count, offsets_len
                )));
            }
            let (offsets, values) = cur.split_at(offsets_len);
            (count, offsets, values)
        };

        let first_value = if count > 0 {
            Some(read_u64(&mut values).map_err(|_| DbError::corruption("Truncated first value"))?)
        } else {
            None
        };

        Ok(BucketDecoder {
            anchor,
            remaining: count,
            offsets,
            bits: BitReader::new(values),
            first_value,
            prev_offset: 0,
            prev_value: 0,
            window: XorWindow::default(),
        })
    }

    /// Number of points not yet decoded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Decodes the next point, or `None` once the stream is exhausted.
    pub fn next_point(&mut self) -> Result<Option<DecodedPoint>, DbError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let delta = read_var_u64(&mut self.offsets).map_err(DbError::corruption)?;
        let offset = self
            .prev_offset
            .checked_add(delta)
            .ok_or_else(|| DbError::corruption("Offset delta overflow"))?;
        let absolute = i64::try_from(offset)
            .ok()
            .and_then(|o| self.anchor.checked_add(o))
            .ok_or_else(|| DbError::corruption("Offset does not fit the anchor"))?;

        let bits = match self.first_value.take() {
            Some(first) => first,
            None => self.next_xor_value()?,
        };

        self.prev_offset = offset;
        self.prev_value = bits;
        self.remaining -= 1;
        Ok(Some(DecodedPoint {
            offset: absolute,
            value: f64::from_bits(bits),
        }))
    }

    fn next_xor_value(&mut self) -> Result<u64, DbError> {
        let br = &mut self.bits;
        if !br.read_bit()? {
            return Ok(self.prev_value);
        }
        let (sigbits, trailing) = if !br.read_bit()? {
            if self.window.sigbits == 0 {
                return Err(DbError::corruption(
                    "Gorilla reuse window before initialization",
                ));
            }
            (self.window.sigbits, self.window.trailing)
        } else {
            let leading = br.read_bits(6)? as u8;
            let sigbits = (br.read_bits(6)? as u8).saturating_add(1);
            if u32::from(leading) + u32::from(sigbits) > 64 {
                return Err(DbError::corruption("Invalid Gorilla bit widths"));
            }
            let trailing = 64u8 - leading - sigbits;
            self.window = XorWindow {
                leading,
                trailing,
                sigbits,
            };
            (sigbits, trailing)
        };
        let significant = br.read_bits(sigbits)?;
        Ok(self.prev_value ^ (significant << trailing))
    }
}

// --- Helpers (binary, varint, gorilla) ---

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, DbError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn write_var_u32(buf: &mut Vec<u8>, v: u32) {
    write_var_u64(buf, v as u64);
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

pub(crate) fn read_var_u32<R: Read>(r: &mut R) -> Result<u32, String> {
    let v = read_var_u64(r)?;
    if v > u32::MAX as u64 {
        return Err("Varint does not fit in u32".to_string());
    }
    Ok(v as u32)
}

struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    cur: u8,
    used: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            cur: 0,
            used: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        let b = if bit { 1u8 } else { 0u8 };
        self.cur |= b << (7 - self.used);
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.used = 0;
        }
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }

    fn finish(self) {
        if self.used > 0 {
            self.out.push(self.cur);
        }
    }
}

#[derive(Debug)]
struct BitReader<R: Read> {
    r: R,
    cur: u8,
    left: u8,
}

impl<R: Read> BitReader<R> {
    fn new(r: R) -> Self {
        Self { r, cur: 0, left: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, DbError> {
        if self.left == 0 {
            let mut b = [0u8; 1];
            self.r
                .read_exact(&mut b)
                .map_err(|_| DbError::corruption("Truncated value bit stream"))?;
            self.cur = b[0];
            self.left = 8;
        }
        let bit = (self.cur & (1u8 << (self.left - 1))) != 0;
        self.left -= 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, DbError> {
        let mut out = 0u64;
        for _ in 0..count {
            out <<= 1;
            out |= if self.read_bit()? { 1 } else { 0 };
        }
        Ok(out)
    }
}

fn encode_gorilla_xor_u64(values: &[u64], out: &mut Vec<u8>) {
    let Some((&first, rest)) = values.split_first() else {
        return;
    };
    write_u64(out, first);
    let mut bw = BitWriter::new(out);

    let mut prev = first;
    let mut prev_leading: u8 = 0;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for &cur in rest {
        let x = prev ^ cur;
        if x == 0 {
            bw.push_bit(false);
        } else {
            bw.push_bit(true);
            let leading = (x.leading_zeros() as u8).min(63);
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 64 - leading - trailing;

            if prev_sigbits != 0 && leading >= prev_leading && trailing >= prev_trailing {
                bw.push_bit(false);
                bw.push_bits(x >> prev_trailing, prev_sigbits);
            } else {
                bw.push_bit(true);
                bw.push_bits(leading as u64, 6);
                bw.push_bits((sigbits - 1) as u64, 6);
                bw.push_bits(x >> trailing, sigbits);
                prev_leading = leading;
                prev_trailing = trailing;
                prev_sigbits = sigbits;
            }
        }
        prev = cur;
    }
    bw.finish();
}
