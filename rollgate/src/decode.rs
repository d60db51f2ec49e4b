//! Streaming decoder for the storage engine's binary row format.
//!
//! A response is a sequence of self-delimiting rows with no separators:
//!
//! ```text
//! row := name times values [timestamps]
//! name := uvarint(len) byte*len
//! times := uvarint(n) u32le*n
//! values := uvarint(n) f64le*n
//! timestamps := uvarint(n) u32le*n        (unaggregated rows only)
//! ```
//!
//! Lengths are LEB128 varints: 7 data bits per byte, high bit set on every
//! byte but the last.
//!
//! # Partial input
//!
//! Bytes arrive in arbitrary chunks. [`RowDecoder::next_row`] distinguishes
//! "not enough bytes yet" (returns `Ok(None)`, caller feeds more and retries
//! the same row) from "cannot ever decode" (returns
//! [`DecodeError::Malformed`]). A short row is only malformed once the input
//! has ended; an array length mismatch or an over-long varint is malformed
//! immediately.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, FetchError};
use crate::transport::ChunkStream;

/// Longest valid encoding of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Cap on the raw bytes attached to a malformed-row error.
const MAX_ERROR_ROW_BYTES: usize = 4096;

/// Which arrays each row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowShape {
    /// Storage downsampled: `name, times, values`.
    Aggregated,
    /// Raw points: `name, times, values, timestamps`.
    Unaggregated,
}

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Metric path as stored (may be reversed).
    pub name: Bytes,
    /// Point times, epoch seconds.
    pub times: Vec<u32>,
    /// Point values, parallel to `times`.
    pub values: Vec<f64>,
    /// Ingest versions, parallel to `times`; empty for aggregated rows.
    pub timestamps: Vec<u32>,
}

impl RawRow {
    /// Number of points in the row.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns `true` if the row has no points.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Ingest version of point `i`; aggregated rows use the point time.
    pub fn timestamp(&self, i: usize) -> u32 {
        self.timestamps.get(i).copied().unwrap_or(self.times[i])
    }
}

/// Result of one parse attempt over the buffered bytes.
enum Parse<T> {
    Ready(T),
    Short,
    Invalid(String),
}

/// Propagates `Short` and `Invalid` out of a parse step.
macro_rules! ready {
    ($e:expr) => {
        match $e {
            Parse::Ready(v) => v,
            Parse::Short => return Parse::Short,
            Parse::Invalid(reason) => return Parse::Invalid(reason),
        }
    };
}

/// Bounds-checked reader over a byte slice.
#[derive(Debug)]
pub struct RowCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RowCursor<'a> {
    /// Starts reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn varint(&mut self) -> Parse<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.buf.get(self.pos + i) else {
                return Parse::Short;
            };
            let bits = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Parse::Invalid("varint overflows u64".to_string());
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                self.pos += i + 1;
                return Parse::Ready(value);
            }
        }
        Parse::Invalid("varint longer than 10 bytes".to_string())
    }

    fn length(&mut self, what: &str) -> Parse<usize> {
        let raw = ready!(self.varint());
        match usize::try_from(raw) {
            Ok(n) => Parse::Ready(n),
            Err(_) => Parse::Invalid(format!("{what} length {raw} does not fit in memory")),
        }
    }

    fn take(&mut self, n: usize) -> Parse<&'a [u8]> {
        if self.remaining() < n {
            return Parse::Short;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Parse::Ready(slice)
    }

    fn array_bytes(&mut self, count: usize, width: usize, what: &str) -> Parse<&'a [u8]> {
        match count.checked_mul(width) {
            Some(n) => self.take(n),
            None => Parse::Invalid(format!("{what} count {count} overflows")),
        }
    }
}

fn u32_array(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| {
            let mut le = [0u8; 4];
            le.copy_from_slice(c);
            u32::from_le_bytes(le)
        })
        .collect()
}

fn f64_array(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut le = [0u8; 8];
            le.copy_from_slice(c);
            f64::from_le_bytes(le)
        })
        .collect()
}

/// Byte ranges of a fully buffered row.
struct RowLayout {
    name: std::ops::Range<usize>,
    times: std::ops::Range<usize>,
    values: std::ops::Range<usize>,
    timestamps: Option<std::ops::Range<usize>>,
    end: usize,
}

fn parse_layout(buf: &[u8], shape: RowShape) -> (Parse<RowLayout>, usize) {
    let mut cursor = RowCursor::new(buf);
    let parsed = layout(&mut cursor, shape);
    (parsed, cursor.position())
}

fn layout(cursor: &mut RowCursor<'_>, shape: RowShape) -> Parse<RowLayout> {
    let name_len = ready!(cursor.length("name"));
    let name_start = cursor.position();
    ready!(cursor.take(name_len));
    let name = name_start..cursor.position();

    let times_count = ready!(cursor.length("times"));
    let times_start = cursor.position();
    ready!(cursor.array_bytes(times_count, 4, "times"));
    let times = times_start..cursor.position();

    let values_count = ready!(cursor.length("values"));
    if values_count != times_count {
        return Parse::Invalid(format!(
            "times/values length mismatch: {times_count} != {values_count}"
        ));
    }
    let values_start = cursor.position();
    ready!(cursor.array_bytes(values_count, 8, "values"));
    let values = values_start..cursor.position();

    let timestamps = match shape {
        RowShape::Aggregated => None,
        RowShape::Unaggregated => {
            let ts_count = ready!(cursor.length("timestamps"));
            if ts_count != times_count {
                return Parse::Invalid(format!(
                    "times/timestamps length mismatch: {times_count} != {ts_count}"
                ));
            }
            let ts_start = cursor.position();
            ready!(cursor.array_bytes(ts_count, 4, "timestamps"));
            Some(ts_start..cursor.position())
        }
    };

    Parse::Ready(RowLayout {
        name,
        times,
        values,
        timestamps,
        end: cursor.position(),
    })
}

/// Incremental row decoder.
///
/// Feed chunks with [`feed`](Self::feed) and drain rows with
/// [`next_row`](Self::next_row). Only the unconsumed tail of the input is
/// kept in memory.
///
/// # Examples
///
/// ```rust
/// use rollgate::decode::{encode_row, RowDecoder, RowShape};
///
/// let mut body = Vec::new();
/// encode_row(&mut body, b"a.b", &[60, 120], &[1.0, 2.0], None);
///
/// let mut decoder = RowDecoder::new(RowShape::Aggregated);
/// decoder.feed(&body[..3]);
/// assert!(decoder.next_row(false).unwrap().is_none()); // need more input
///
/// decoder.feed(&body[3..]);
/// let row = decoder.next_row(true).unwrap().unwrap();
/// assert_eq!(&row.name[..], b"a.b");
/// assert_eq!(row.values, vec![1.0, 2.0]);
/// ```
#[derive(Debug)]
pub struct RowDecoder {
    buf: BytesMut,
    shape: RowShape,
    rows: usize,
}

impl RowDecoder {
    /// Creates a decoder for rows of `shape`.
    pub fn new(shape: RowShape) -> Self {
        Self {
            buf: BytesMut::new(),
            shape,
            rows: 0,
        }
    }

    /// Appends input bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Rows decoded so far.
    pub fn rows_decoded(&self) -> usize {
        self.rows
    }

    /// Decodes the next row.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete row and the input
    /// may still grow (`at_eof == false`), or when the input ended cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] if the row can never be decoded:
    /// array lengths disagree, a varint is invalid, or the input ended inside
    /// the row.
    pub fn next_row(&mut self, at_eof: bool) -> Result<Option<RawRow>, DecodeError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (parsed, reached) = parse_layout(&self.buf, self.shape);
        match parsed {
            Parse::Ready(layout) => {
                let row = self.buf.split_to(layout.end).freeze();
                self.rows += 1;
                Ok(Some(RawRow {
                    name: row.slice(layout.name),
                    times: u32_array(&row[layout.times]),
                    values: f64_array(&row[layout.values]),
                    timestamps: layout
                        .timestamps
                        .map(|r| u32_array(&row[r]))
                        .unwrap_or_default(),
                }))
            }
            Parse::Short if !at_eof => Ok(None),
            Parse::Short => Err(self.malformed(
                format!(
                    "row {} truncated: input ended with {} byte(s) buffered",
                    self.rows,
                    self.buf.len()
                ),
                self.buf.len(),
            )),
            Parse::Invalid(reason) => Err(self.malformed(
                format!("row {}: {reason}", self.rows),
                reached.max(1),
            )),
        }
    }

    fn malformed(&self, reason: String, row_len: usize) -> DecodeError {
        let end = row_len.min(self.buf.len()).min(MAX_ERROR_ROW_BYTES);
        DecodeError::Malformed {
            reason,
            row: self.buf[..end].to_vec(),
        }
    }
}

/// Counters for one decoded response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Rows decoded.
    pub rows: usize,
    /// Points across all rows.
    pub points: usize,
    /// Response bytes read.
    pub bytes: usize,
}

/// Decodes a whole response stream, handing each row to `on_row`.
///
/// # Errors
///
/// Returns [`FetchError::Transport`] if reading the stream fails and
/// [`FetchError::Decode`] if the body is malformed. Rows already passed to
/// `on_row` stay with the caller.
pub async fn decode_stream<S, F>(
    stream: &mut S,
    shape: RowShape,
    mut on_row: F,
) -> Result<DecodeStats, FetchError>
where
    S: ChunkStream + ?Sized,
    F: FnMut(RawRow),
{
    let mut decoder = RowDecoder::new(shape);
    let mut stats = DecodeStats::default();

    loop {
        let chunk = stream.next_chunk().await?;
        let at_eof = chunk.is_none();
        if let Some(chunk) = chunk {
            stats.bytes += chunk.len();
            decoder.feed(&chunk);
        }

        while let Some(row) = decoder.next_row(at_eof)? {
            stats.rows += 1;
            stats.points += row.len();
            on_row(row);
        }

        if at_eof {
            return Ok(stats);
        }
    }
}

/// Writes `value` as a LEB128 varint.
#[allow(clippy::cast_possible_truncation)] // masked to seven bits
pub fn put_uvarint<B: BufMut>(out: &mut B, mut value: u64) {
    while value >= 0x80 {
        // low seven bits, continuation flag set
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

/// Encodes one row in the storage wire format.
///
/// Pass `timestamps` for unaggregated rows. Array lengths are written as
/// given, so mismatched inputs produce a malformed row.
pub fn encode_row<B: BufMut>(
    out: &mut B,
    name: &[u8],
    times: &[u32],
    values: &[f64],
    timestamps: Option<&[u32]>,
) {
    put_uvarint(out, name.len() as u64);
    out.put_slice(name);
    put_uvarint(out, times.len() as u64);
    for &t in times {
        out.put_u32_le(t);
    }
    put_uvarint(out, values.len() as u64);
    for &v in values {
        out.put_f64_le(v);
    }
    if let Some(timestamps) = timestamps {
        put_uvarint(out, timestamps.len() as u64);
        for &t in timestamps {
            out.put_u32_le(t);
        }
    }
}

/// Reads a single varint from the front of `buf`, advancing it.
///
/// Returns `None` if `buf` ends inside the varint or the varint is invalid.
pub fn get_uvarint<B: Buf>(buf: &mut B) -> Option<u64> {
    let mut cursor = RowCursor::new(buf.chunk());
    match cursor.varint() {
        Parse::Ready(value) => {
            let used = cursor.position();
            buf.advance(used);
            Some(value)
        }
        Parse::Short | Parse::Invalid(_) => None,
    }
}
