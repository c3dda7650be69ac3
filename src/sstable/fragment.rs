//! Keyspans: range deletions and range keys.
//!
//! Both live in their own blocks (restart interval 1) as fragments: spans that
//! never partially overlap. A fragment is stored as one entry per key, all with the
//! fragment's start as user key:
//!
//! ```text
//! Range deletion:  key = (start, seq, RANGEDEL)   value = end
//! Range key:       key = (start, seq, kind)       value = [len(end): uvarint] [end] payload
//!   RANGEKEYSET:   payload = ([len(suffix): uvarint] [suffix] [len(value): uvarint] [value])*
//!   RANGEKEYUNSET: payload = ([len(suffix): uvarint] [suffix])*
//!   RANGEKEYDEL:   payload is empty
//! ```

use crate::comparer::Comparer;
use crate::error::{Error, Result};
use crate::sstable::block::BlockIter;
use crate::sstable::coding::{decode_uvarint, put_uvarint};
use crate::sstable::internal_key::{trailer_kind, trailer_seq_num, InternalKeyKind, SeqNum};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One key of a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanKey {
    /// Packed sequence number and kind.
    pub trailer: u64,
    /// Range-key suffix; empty for range deletions and range-key deletes.
    pub suffix: Bytes,
    /// Range-key value; empty unless the kind is RANGEKEYSET.
    pub value: Bytes,
}

impl SpanKey {
    /// A key with neither suffix nor value.
    pub fn new(trailer: u64) -> Self {
        Self { trailer, suffix: Bytes::new(), value: Bytes::new() }
    }

    /// Sequence number.
    pub fn seq_num(&self) -> SeqNum {
        trailer_seq_num(self.trailer)
    }

    /// Key kind.
    pub fn kind(&self) -> InternalKeyKind {
        trailer_kind(self.trailer)
    }
}

/// The keys covering `[start, end)`, ordered by trailer descending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Span {
    /// Inclusive start user key.
    pub start: Bytes,
    /// Exclusive end user key.
    pub end: Bytes,
    /// Keys applying to the whole span.
    pub keys: Vec<SpanKey>,
}

impl Span {
    /// True if the span carries no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True if `key` lies in `[start, end)`.
    pub fn contains(&self, cmp: &dyn Comparer, key: &[u8]) -> bool {
        cmp.compare(&self.start, key).is_le() && cmp.compare(key, &self.end).is_lt()
    }

    /// True if some key of the span is visible at `snapshot`.
    pub fn covers_at(&self, snapshot: SeqNum) -> bool {
        self.keys.iter().any(|k| k.seq_num() < snapshot)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{{", String::from_utf8_lossy(&self.start), String::from_utf8_lossy(&self.end))?;
        for (i, k) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "(#{},{}", k.seq_num(), k.kind())?;
            if !k.suffix.is_empty() {
                write!(f, ",{}", String::from_utf8_lossy(&k.suffix))?;
            }
            if !k.value.is_empty() {
                write!(f, ",{}", String::from_utf8_lossy(&k.value))?;
            }
            f.write_str(")")?;
        }
        f.write_str("}")
    }
}

/// Encodes the value of a range-key entry. `suffix_values` pairs are written in
/// order; values are ignored for UNSET and both are ignored for DEL.
pub fn encode_range_key_value(kind: InternalKeyKind, end: &[u8], suffix_values: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_uvarint(&mut buf, end.len() as u64);
    buf.extend_from_slice(end);
    match kind {
        InternalKeyKind::RangeKeySet => {
            for (suffix, value) in suffix_values {
                put_uvarint(&mut buf, suffix.len() as u64);
                buf.extend_from_slice(suffix);
                put_uvarint(&mut buf, value.len() as u64);
                buf.extend_from_slice(value);
            }
        }
        InternalKeyKind::RangeKeyUnset => {
            for (suffix, _) in suffix_values {
                put_uvarint(&mut buf, suffix.len() as u64);
                buf.extend_from_slice(suffix);
            }
        }
        _ => {}
    }
    buf
}

fn take_len_prefixed(v: &Bytes, pos: &mut usize) -> Option<Bytes> {
    let (len, n) = decode_uvarint(&v[*pos..])?;
    let start = *pos + n;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    if end > v.len() {
        return None;
    }
    *pos = end;
    Some(v.slice(start..end))
}

/// Decodes the value of a range-key entry into its end key and keys.
pub fn decode_range_key_value(trailer: u64, value: &Bytes) -> Result<(Bytes, Vec<SpanKey>)> {
    let bad = || Error::corruption(format!("invalid range key value of length {}", value.len()));
    let mut pos = 0;
    let end = take_len_prefixed(value, &mut pos).ok_or_else(bad)?;
    let mut keys = Vec::new();
    match trailer_kind(trailer) {
        InternalKeyKind::RangeKeySet => {
            while pos < value.len() {
                let suffix = take_len_prefixed(value, &mut pos).ok_or_else(bad)?;
                let v = take_len_prefixed(value, &mut pos).ok_or_else(bad)?;
                keys.push(SpanKey { trailer, suffix, value: v });
            }
        }
        InternalKeyKind::RangeKeyUnset => {
            while pos < value.len() {
                let suffix = take_len_prefixed(value, &mut pos).ok_or_else(bad)?;
                keys.push(SpanKey { trailer, suffix, value: Bytes::new() });
            }
        }
        InternalKeyKind::RangeKeyDelete => {
            if pos != value.len() {
                return Err(bad());
            }
            keys.push(SpanKey::new(trailer));
        }
        kind => return Err(Error::corruption(format!("unexpected range key kind {kind}"))),
    }
    Ok((end, keys))
}

/// Kind of keyspan block a [`FragmentBlockIter`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanBlockKind {
    /// Range deletions; keys with equal sequence numbers are elided.
    RangeDel,
    /// Range keys.
    RangeKey,
}

#[derive(Debug, Clone, Copy)]
enum Position {
    BeforeStart,
    AfterEnd,
    // Forward: the block sits on the first entry of the next span.
    // Backward: the block sits on the last entry of the previous span.
    At { forward: bool },
}

/// Iterator over the spans of a range-deletion or range-key block.
#[derive(Debug)]
pub struct FragmentBlockIter {
    block: BlockIter,
    cmp: Arc<dyn Comparer>,
    kind: SpanBlockKind,
    span: Span,
    pos: Position,
    err: Option<Error>,
}

impl FragmentBlockIter {
    /// Creates an iterator over a keyspan block.
    pub fn new(block: BlockIter, cmp: Arc<dyn Comparer>, kind: SpanBlockKind) -> Self {
        Self { block, cmp, kind, span: Span::default(), pos: Position::BeforeStart, err: None }
    }

    /// The error that stopped iteration, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Moves to the first span.
    pub fn first(&mut self) -> Result<Option<&Span>> {
        self.err = None;
        if !self.block.first() {
            return self.exhausted(Position::BeforeStart);
        }
        self.gather_forward()
    }

    /// Moves to the last span.
    pub fn last(&mut self) -> Result<Option<&Span>> {
        self.err = None;
        if !self.block.last() {
            return self.exhausted(Position::AfterEnd);
        }
        self.gather_backward()
    }

    /// Moves to the next span.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<&Span>> {
        if let Some(e) = &self.err {
            return Err(e.duplicate());
        }
        match self.pos {
            Position::BeforeStart => self.first(),
            Position::AfterEnd => Ok(None),
            Position::At { forward: true } => {
                if !self.block.is_valid() {
                    return self.exhausted(Position::AfterEnd);
                }
                self.gather_forward()
            }
            Position::At { forward: false } => {
                let start = self.span.start.clone();
                let mut ok = self.block.seek_ge(&start);
                while ok && self.block_key_equals(&start) {
                    ok = self.block.next();
                }
                if !ok {
                    return self.exhausted(Position::AfterEnd);
                }
                self.gather_forward()
            }
        }
    }

    /// Moves to the previous span.
    pub fn prev(&mut self) -> Result<Option<&Span>> {
        if let Some(e) = &self.err {
            return Err(e.duplicate());
        }
        match self.pos {
            Position::BeforeStart => Ok(None),
            Position::AfterEnd => self.last(),
            Position::At { forward: false } => {
                if !self.block.is_valid() {
                    return self.exhausted(Position::BeforeStart);
                }
                self.gather_backward()
            }
            Position::At { forward: true } => {
                let start = self.span.start.clone();
                if !self.block.seek_lt(&start) {
                    return self.exhausted(Position::BeforeStart);
                }
                self.gather_backward()
            }
        }
    }

    /// Moves to the first span whose end is > `key`.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<Option<&Span>> {
        self.err = None;
        if !self.block.seek_lt(key) {
            return self.first();
        }
        self.gather_backward()?;
        if self.cmp.compare(&self.span.end, key) == Ordering::Greater {
            return Ok(Some(&self.span));
        }
        self.next()
    }

    /// Moves to the last span whose start is < `key`.
    pub fn seek_lt(&mut self, key: &[u8]) -> Result<Option<&Span>> {
        self.err = None;
        if !self.block.seek_lt(key) {
            return self.exhausted(Position::BeforeStart);
        }
        self.gather_backward()
    }

    /// The current span.
    pub fn span(&self) -> Option<&Span> {
        match self.pos {
            Position::At { .. } if self.err.is_none() => Some(&self.span),
            _ => None,
        }
    }

    /// Releases the block.
    pub fn close(&mut self) -> Result<()> {
        self.block.close()?;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn exhausted(&mut self, pos: Position) -> Result<Option<&Span>> {
        if let Some(e) = self.block.error().map(Error::duplicate) {
            return self.fail(e);
        }
        self.pos = pos;
        Ok(None)
    }

    fn fail(&mut self, e: Error) -> Result<Option<&Span>> {
        let dup = e.duplicate();
        self.err = Some(e);
        Err(dup)
    }

    fn block_key_equals(&self, start: &[u8]) -> bool {
        self.block.key().is_some_and(|k| self.cmp.equal(k.user_key, start))
    }

    /// Decodes the entry under the block iterator into its end key and keys.
    fn decode_entry(&self) -> Result<(Bytes, Vec<SpanKey>)> {
        let trailer = self.block.key().map(|k| k.trailer).unwrap_or_default();
        let value = self.block.value_bytes();
        match self.kind {
            SpanBlockKind::RangeDel => Ok((value, vec![SpanKey::new(trailer)])),
            SpanBlockKind::RangeKey => decode_range_key_value(trailer, &value),
        }
    }

    fn gather_forward(&mut self) -> Result<Option<&Span>> {
        let start = self.block.user_key_bytes();
        let mut span = Span { start, ..Span::default() };
        let mut first = true;
        loop {
            let (end, keys) = match self.decode_entry() {
                Ok(d) => d,
                Err(e) => return self.fail(e),
            };
            if first {
                span.end = end;
                first = false;
            } else if !self.cmp.equal(&span.end, &end) {
                return self.fail(corrupt_fragmentation(&span.start, &span.end, &end));
            }
            span.keys.extend(keys);
            if !self.block.next() || !self.block_key_equals(&span.start) {
                break;
            }
        }
        if let Some(e) = self.block.error().map(Error::duplicate) {
            return self.fail(e);
        }
        self.finish_span(span, true)
    }

    fn gather_backward(&mut self) -> Result<Option<&Span>> {
        let start = self.block.user_key_bytes();
        let mut span = Span { start, ..Span::default() };
        let mut groups: Vec<Vec<SpanKey>> = Vec::new();
        loop {
            let (end, keys) = match self.decode_entry() {
                Ok(d) => d,
                Err(e) => return self.fail(e),
            };
            if groups.is_empty() {
                span.end = end;
            } else if !self.cmp.equal(&span.end, &end) {
                return self.fail(corrupt_fragmentation(&span.start, &span.end, &end));
            }
            groups.push(keys);
            if !self.block.prev() || !self.block_key_equals(&span.start) {
                break;
            }
        }
        if let Some(e) = self.block.error().map(Error::duplicate) {
            return self.fail(e);
        }
        span.keys = groups.into_iter().rev().flatten().collect();
        self.finish_span(span, false)
    }

    fn finish_span(&mut self, mut span: Span, forward: bool) -> Result<Option<&Span>> {
        if self.kind == SpanBlockKind::RangeDel {
            span.keys.dedup_by(|b, a| a.seq_num() == b.seq_num());
        }
        self.span = span;
        self.pos = Position::At { forward };
        Ok(Some(&self.span))
    }
}

fn corrupt_fragmentation(start: &[u8], end: &[u8], other: &[u8]) -> Error {
    Error::corruption(format!(
        "corrupt keyspan fragmentation: span {} has end keys {} and {}",
        String::from_utf8_lossy(start),
        String::from_utf8_lossy(end),
        String::from_utf8_lossy(other)
    ))
}

/// Splits possibly overlapping spans into fragments.
///
/// Spans must be added in non-decreasing start order. Fragments are returned in
/// order and never partially overlap; each fragment carries the keys of every
/// added span covering it, ordered by trailer descending.
#[derive(Debug)]
pub struct Fragmenter {
    cmp: Arc<dyn Comparer>,
    // Spans sharing the start of the first one.
    pending: Vec<Span>,
    out: Vec<Span>,
}

impl Fragmenter {
    /// Creates a fragmenter.
    pub fn new(cmp: Arc<dyn Comparer>) -> Self {
        Self { cmp, pending: Vec::new(), out: Vec::new() }
    }

    /// Start key of the last added span.
    pub fn last_start(&self) -> Option<&[u8]> {
        self.pending.first().map(|s| &s.start[..])
    }

    /// Adds a span.
    pub fn add(&mut self, span: Span) -> Result<()> {
        if self.cmp.compare(&span.start, &span.end) != Ordering::Less {
            return Err(Error::invalid_argument(format!("span {span} is empty")));
        }
        if let Some(start) = self.last_start() {
            match self.cmp.compare(start, &span.start) {
                Ordering::Greater => {
                    return Err(Error::invalid_argument(format!(
                        "span {} added out of order after start {}",
                        span,
                        String::from_utf8_lossy(start)
                    )));
                }
                Ordering::Less => self.flush(Some(span.start.clone())),
                Ordering::Equal => {}
            }
        }
        self.pending.push(span);
        Ok(())
    }

    /// Emits every fragment ending at or before `limit`, truncating the rest to
    /// start at `limit`.
    fn flush(&mut self, limit: Option<Bytes>) {
        let cmp = Arc::clone(&self.cmp);
        self.pending.sort_by(|a, b| cmp.compare(&a.end, &b.end));
        let Some(first) = self.pending.first() else {
            return;
        };
        let mut cur = first.start.clone();
        while let Some(end) = self.pending.first().map(|s| s.end.clone()) {
            if let Some(limit) = &limit {
                if cmp.compare(&end, limit) == Ordering::Greater {
                    break;
                }
            }
            self.emit(cur, end.clone());
            self.pending.retain(|s| !cmp.equal(&s.end, &end));
            cur = end;
        }
        if let Some(limit) = limit {
            if !self.pending.is_empty() {
                if cmp.compare(&cur, &limit) == Ordering::Less {
                    self.emit(cur, limit.clone());
                }
                for s in &mut self.pending {
                    s.start = limit.clone();
                }
            }
        }
    }

    fn emit(&mut self, start: Bytes, end: Bytes) {
        let mut keys: Vec<SpanKey> = self.pending.iter().flat_map(|s| s.keys.iter().cloned()).collect();
        keys.sort_by(|a, b| b.trailer.cmp(&a.trailer));
        self.out.push(Span { start, end, keys });
    }

    /// Flushes pending spans and returns every fragment.
    pub fn finish(mut self) -> Vec<Span> {
        self.flush(None);
        self.out
    }

    /// Returns the fragments completed so far, which no later span can affect.
    pub fn take_completed(&mut self) -> Vec<Span> {
        std::mem::take(&mut self.out)
    }
}
