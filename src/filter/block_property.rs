//! Block properties: per-block summaries that let iterators skip data blocks.
//!
//! A [`BlockPropertyCollector`] sees every point key written and emits an opaque
//! property for each data block, each index block and the whole table. Data block
//! properties are stored after the block handle in the index entry:
//!
//! ```text
//! ([short id: u8] [len: uvarint] [prop bytes])*    sorted by short id
//! ```
//!
//! The table-level property is stored in the properties block under the collector
//! name, as `[short id] [prop bytes]`. At read time a [`BlockPropertyFilter`] with
//! the same name decides from a property whether a block may contain interesting
//! keys.

use crate::error::{Error, Result};
use crate::sstable::coding::{decode_uvarint, put_uvarint};
use crate::sstable::internal_key::InternalKeyRef;
use crate::comparer::Comparer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Per-table identifier of a collector, assigned in registration order.
pub type ShortId = u8;

/// Name of the collector and filter tracking obsolete keys.
pub const OBSOLETE_KEY_PROPERTY_NAME: &str = "obsolete-key";

/// Collects a property over the keys of blocks and tables.
pub trait BlockPropertyCollector: Send {
    /// Name matching the filter that reads the property.
    fn name(&self) -> &str;

    /// Observes a point key of the current data block.
    fn add(&mut self, key: InternalKeyRef<'_>, value: &[u8]) -> Result<()>;

    /// Finishes the current data block and returns its property.
    fn finish_data_block(&mut self) -> Result<Vec<u8>>;

    /// Folds the last finished data block into the current index block.
    fn add_prev_data_block_to_index_block(&mut self);

    /// Finishes the current index block and returns its property.
    fn finish_index_block(&mut self) -> Result<Vec<u8>>;

    /// Returns the table-level property.
    fn finish_table(&mut self) -> Result<Vec<u8>>;
}

/// Decides from a property whether a block or table may hold interesting keys.
pub trait BlockPropertyFilter: Send + Sync {
    /// Name of the collector whose property is read.
    fn name(&self) -> &str;

    /// False if the block or table can be skipped.
    fn intersects(&self, prop: &[u8]) -> Result<bool>;
}

/// A filter that only applies to keys within some bounds.
///
/// When such a filter rejects a block, the block is skipped only if all its keys
/// are known to lie within the filter's bounds.
pub trait BoundLimitedBlockPropertyFilter: BlockPropertyFilter {
    /// True if `key` is at or above the filter's lower bound.
    fn key_is_within_lower_bound(&self, key: &[u8]) -> bool;

    /// True if `key` is at or below the filter's upper bound.
    fn key_is_within_upper_bound(&self, key: &[u8]) -> bool;
}

/// Encodes the properties of one block.
#[derive(Debug, Default)]
pub struct BlockPropertiesEncoder {
    buf: Vec<u8>,
}

impl BlockPropertiesEncoder {
    /// Appends a property. Ids must be added in increasing order.
    pub fn add_prop(&mut self, id: ShortId, prop: &[u8]) {
        self.buf.push(id);
        put_uvarint(&mut self.buf, prop.len() as u64);
        self.buf.extend_from_slice(prop);
    }

    /// Returns the encoding and resets the encoder.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Iterates the `(short id, property)` pairs of an encoded block property set.
#[derive(Debug)]
pub struct BlockPropertiesDecoder<'a> {
    props: &'a [u8],
}

impl<'a> BlockPropertiesDecoder<'a> {
    /// Creates a decoder.
    pub fn new(props: &'a [u8]) -> Self {
        Self { props }
    }
}

impl<'a> Iterator for BlockPropertiesDecoder<'a> {
    type Item = Result<(ShortId, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&id, rest) = self.props.split_first()?;
        let decoded = decode_uvarint(rest).and_then(|(len, n)| {
            let end = n.checked_add(usize::try_from(len).ok()?)?;
            Some((n, end)).filter(|&(_, end)| end <= rest.len())
        });
        match decoded {
            Some((n, end)) => {
                self.props = &rest[end..];
                Some(Ok((id, &rest[n..end])))
            }
            None => {
                self.props = &[];
                Some(Err(Error::corruption("invalid block properties encoding")))
            }
        }
    }
}

/// Result of checking a block's properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectsResult {
    /// The block must be read.
    Intersects,
    /// The block can be skipped.
    Excluded,
    /// Only the bound-limited filter rejected the block; whether it can be skipped
    /// depends on where the block's keys lie.
    MaybeExcluded,
}

/// Applies a set of block-property filters to one table.
///
/// A filterer is built once per iterator configuration and bound to a table with
/// [`intersects_user_props_and_finish_init`](Self::intersects_user_props_and_finish_init).
#[derive(Clone, Default)]
pub struct BlockPropertiesFilterer {
    filters: Vec<Arc<dyn BlockPropertyFilter>>,
    bound_limited: Option<Arc<dyn BoundLimitedBlockPropertyFilter>>,
    // (short id, index into `filters`) of the filters the table has properties for,
    // sorted by short id.
    short_ids: Vec<(ShortId, usize)>,
    bound_limited_short_id: Option<ShortId>,
}

impl fmt::Debug for BlockPropertiesFilterer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPropertiesFilterer")
            .field("filters", &self.filters.iter().map(|f| f.name().to_string()).collect::<Vec<_>>())
            .field("bound_limited", &self.bound_limited.as_ref().map(|f| f.name().to_string()))
            .field("short_ids", &self.short_ids)
            .finish()
    }
}

impl BlockPropertiesFilterer {
    /// Creates a filterer.
    pub fn new(
        filters: Vec<Arc<dyn BlockPropertyFilter>>,
        bound_limited: Option<Arc<dyn BoundLimitedBlockPropertyFilter>>,
    ) -> Self {
        Self { filters, bound_limited, short_ids: Vec::new(), bound_limited_short_id: None }
    }

    /// Checks the table-level properties and binds the filters to the table's short
    /// ids. Returns `None` if the whole table is excluded.
    ///
    /// Filters whose collector the table lacks are not applied. The bound-limited
    /// filter never excludes a whole table.
    pub fn intersects_user_props_and_finish_init(
        &self,
        user_props: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Option<Self>> {
        let mut bound = Self::new(self.filters.clone(), self.bound_limited.clone());
        for (i, filter) in self.filters.iter().enumerate() {
            let Some(prop) = user_props.get(filter.name()) else {
                continue;
            };
            let (&id, table_prop) = prop.split_first().ok_or_else(|| {
                Error::corruption(format!("block property {} is empty", filter.name()))
            })?;
            if !filter.intersects(table_prop)? {
                return Ok(None);
            }
            bound.short_ids.push((id, i));
        }
        bound.short_ids.sort_unstable();
        if let Some(limited) = &self.bound_limited {
            if let Some(prop) = user_props.get(limited.name()) {
                let &id = prop.first().ok_or_else(|| {
                    Error::corruption(format!("block property {} is empty", limited.name()))
                })?;
                bound.bound_limited_short_id = Some(id);
            }
        }
        Ok(Some(bound))
    }

    /// True if no filter applies to the bound table.
    pub fn is_empty(&self) -> bool {
        self.short_ids.is_empty() && self.bound_limited_short_id.is_none()
    }

    /// The bound-limited filter, if it applies to the bound table.
    pub fn bound_limited_filter(&self) -> Option<&dyn BoundLimitedBlockPropertyFilter> {
        self.bound_limited_short_id.and(self.bound_limited.as_deref())
    }

    /// Checks the encoded properties of a block.
    pub fn intersects(&self, props: &[u8]) -> Result<IntersectsResult> {
        let decoded = BlockPropertiesDecoder::new(props).collect::<Result<Vec<_>>>()?;
        let lookup = |id: ShortId| decoded.iter().find(|(d, _)| *d == id).map_or(&[][..], |(_, p)| p);
        for &(id, i) in &self.short_ids {
            if !self.filters[i].intersects(lookup(id))? {
                return Ok(IntersectsResult::Excluded);
            }
        }
        if let (Some(id), Some(limited)) = (self.bound_limited_short_id, &self.bound_limited) {
            if !limited.intersects(lookup(id))? {
                return Ok(IntersectsResult::MaybeExcluded);
            }
        }
        Ok(IntersectsResult::Intersects)
    }
}

/// A half-open interval `[lower, upper)` of u64 values. Empty when
/// `lower >= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    /// Inclusive lower end.
    pub lower: u64,
    /// Exclusive upper end.
    pub upper: u64,
}

impl Interval {
    /// Creates an interval.
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// True if the interval holds no value.
    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    /// Grows the interval to cover `other`.
    pub fn union(&mut self, other: Interval) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        self.lower = self.lower.min(other.lower);
        self.upper = self.upper.max(other.upper);
    }

    /// True if the intervals share a value.
    pub fn intersects(&self, other: &Interval) -> bool {
        !self.is_empty() && !other.is_empty() && self.lower < other.upper && other.lower < self.upper
    }

    /// Encodes as `uvarint(lower) uvarint(upper - lower)`; empty for an empty
    /// interval.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if !self.is_empty() {
            put_uvarint(&mut buf, self.lower);
            put_uvarint(&mut buf, self.upper - self.lower);
        }
        buf
    }

    /// Decodes an encoded interval.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        let bad = || Error::corruption(format!("invalid interval encoding {buf:02x?}"));
        let (lower, n) = decode_uvarint(buf).ok_or_else(bad)?;
        let (delta, m) = decode_uvarint(&buf[n..]).ok_or_else(bad)?;
        if n + m != buf.len() {
            return Err(bad());
        }
        Ok(Self { lower, upper: lower.checked_add(delta).ok_or_else(bad)? })
    }
}

/// Maps a point key to the interval it contributes, if any.
pub type IntervalMapper = Arc<dyn Fn(InternalKeyRef<'_>, &[u8]) -> Result<Option<Interval>> + Send + Sync>;

/// Collects the union of the intervals of the keys of each block.
pub struct IntervalCollector {
    name: String,
    mapper: IntervalMapper,
    block: Interval,
    prev_block: Interval,
    index: Interval,
    table: Interval,
}

impl fmt::Debug for IntervalCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalCollector")
            .field("name", &self.name)
            .field("block", &self.block)
            .field("table", &self.table)
            .finish()
    }
}

impl IntervalCollector {
    /// Creates a collector.
    pub fn new(name: impl Into<String>, mapper: IntervalMapper) -> Self {
        Self {
            name: name.into(),
            mapper,
            block: Interval::default(),
            prev_block: Interval::default(),
            index: Interval::default(),
            table: Interval::default(),
        }
    }
}

impl BlockPropertyCollector for IntervalCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&mut self, key: InternalKeyRef<'_>, value: &[u8]) -> Result<()> {
        if let Some(i) = (self.mapper)(key, value)? {
            self.block.union(i);
        }
        Ok(())
    }

    fn finish_data_block(&mut self) -> Result<Vec<u8>> {
        let encoded = self.block.encode();
        self.table.union(self.block);
        self.prev_block = std::mem::take(&mut self.block);
        Ok(encoded)
    }

    fn add_prev_data_block_to_index_block(&mut self) {
        self.index.union(self.prev_block);
        self.prev_block = Interval::default();
    }

    fn finish_index_block(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.index).encode())
    }

    fn finish_table(&mut self) -> Result<Vec<u8>> {
        Ok(self.table.encode())
    }
}

/// Passes blocks whose interval intersects `[lower, upper)`.
#[derive(Debug, Clone)]
pub struct IntervalFilter {
    name: String,
    interval: Interval,
}

impl IntervalFilter {
    /// Creates a filter.
    pub fn new(name: impl Into<String>, lower: u64, upper: u64) -> Self {
        Self { name: name.into(), interval: Interval::new(lower, upper) }
    }
}

impl BlockPropertyFilter for IntervalFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn intersects(&self, prop: &[u8]) -> Result<bool> {
        Ok(Interval::decode(prop)?.intersects(&self.interval))
    }
}

/// An [`IntervalFilter`] that only applies to user keys within `[lower, upper]`.
pub struct KeyBoundedIntervalFilter {
    inner: IntervalFilter,
    cmp: Arc<dyn Comparer>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

impl KeyBoundedIntervalFilter {
    /// Creates a filter. `None` leaves a side unbounded.
    pub fn new(
        inner: IntervalFilter,
        cmp: Arc<dyn Comparer>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Self {
        Self { inner, cmp, lower, upper }
    }
}

impl BlockPropertyFilter for KeyBoundedIntervalFilter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn intersects(&self, prop: &[u8]) -> Result<bool> {
        self.inner.intersects(prop)
    }
}

impl BoundLimitedBlockPropertyFilter for KeyBoundedIntervalFilter {
    fn key_is_within_lower_bound(&self, key: &[u8]) -> bool {
        self.lower.as_deref().map_or(true, |l| self.cmp.compare(key, l).is_ge())
    }

    fn key_is_within_upper_bound(&self, key: &[u8]) -> bool {
        self.upper.as_deref().map_or(true, |u| self.cmp.compare(key, u).is_le())
    }
}

fn encode_obsolete(is_obsolete: bool) -> Vec<u8> {
    if is_obsolete {
        vec![b't']
    } else {
        Vec::new()
    }
}

fn decode_obsolete(prop: &[u8]) -> Result<bool> {
    match prop {
        [] => Ok(false),
        [b't'] => Ok(true),
        _ => Err(Error::corruption(format!("invalid obsolete-key property {prop:02x?}"))),
    }
}

/// Records whether every point key of a block is obsolete.
///
/// The writer feeds it with [`add_point`](Self::add_point) since the obsolete
/// decision is made while writing, not derivable from the key.
#[derive(Debug, Default)]
pub struct ObsoleteKeyCollector {
    block_is_non_obsolete: bool,
    index_is_non_obsolete: bool,
    table_is_non_obsolete: bool,
    prev_block_is_non_obsolete: bool,
}

impl ObsoleteKeyCollector {
    /// Observes a point key.
    pub fn add_point(&mut self, is_obsolete: bool) {
        self.block_is_non_obsolete |= !is_obsolete;
    }
}

impl BlockPropertyCollector for ObsoleteKeyCollector {
    fn name(&self) -> &str {
        OBSOLETE_KEY_PROPERTY_NAME
    }

    fn add(&mut self, _key: InternalKeyRef<'_>, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish_data_block(&mut self) -> Result<Vec<u8>> {
        self.table_is_non_obsolete |= self.block_is_non_obsolete;
        self.prev_block_is_non_obsolete = std::mem::take(&mut self.block_is_non_obsolete);
        Ok(encode_obsolete(!self.prev_block_is_non_obsolete))
    }

    fn add_prev_data_block_to_index_block(&mut self) {
        self.index_is_non_obsolete |= std::mem::take(&mut self.prev_block_is_non_obsolete);
    }

    fn finish_index_block(&mut self) -> Result<Vec<u8>> {
        Ok(encode_obsolete(!std::mem::take(&mut self.index_is_non_obsolete)))
    }

    fn finish_table(&mut self) -> Result<Vec<u8>> {
        Ok(encode_obsolete(!self.table_is_non_obsolete))
    }
}

/// Skips blocks in which every point key is obsolete.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObsoleteKeyFilter;

impl BlockPropertyFilter for ObsoleteKeyFilter {
    fn name(&self) -> &str {
        OBSOLETE_KEY_PROPERTY_NAME
    }

    fn intersects(&self, prop: &[u8]) -> Result<bool> {
        Ok(!decode_obsolete(prop)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;
    use crate::sstable::internal_key::{make_trailer, InternalKeyKind};

    fn key(k: &[u8]) -> InternalKeyRef<'_> {
        InternalKeyRef { user_key: k, trailer: make_trailer(1, InternalKeyKind::Set) }
    }

    // Maps "k<digits>" to the interval [n, n+1).
    fn digit_mapper() -> IntervalMapper {
        Arc::new(|k: InternalKeyRef<'_>, _v: &[u8]| {
            let n: Option<u64> = std::str::from_utf8(&k.user_key[1..]).ok().and_then(|s| s.parse().ok());
            Ok(n.map(|n| Interval::new(n, n + 1)))
        })
    }

    #[test]
    fn test_interval_ops() {
        let mut a = Interval::default();
        assert!(a.is_empty());
        a.union(Interval::new(5, 7));
        a.union(Interval::new(2, 3));
        assert_eq!(a, Interval::new(2, 7));
        assert!(a.intersects(&Interval::new(6, 10)));
        assert!(!a.intersects(&Interval::new(7, 10)));
        assert!(!a.intersects(&Interval::default()));

        assert_eq!(Interval::decode(&a.encode()).unwrap(), a);
        assert!(Interval::default().encode().is_empty());
        assert!(Interval::decode(&[0x80]).is_err());
    }

    #[test]
    fn test_properties_encoding() {
        let mut enc = BlockPropertiesEncoder::default();
        enc.add_prop(0, b"abc");
        enc.add_prop(2, b"");
        enc.add_prop(3, &[9; 200]);
        let encoded = enc.finish();
        let decoded: Vec<_> = BlockPropertiesDecoder::new(&encoded).map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], (0, &b"abc"[..]));
        assert_eq!(decoded[1], (2, &b""[..]));
        assert_eq!(decoded[2].1.len(), 200);

        let truncated = &encoded[..encoded.len() - 1];
        assert!(BlockPropertiesDecoder::new(truncated).any(|r| r.is_err()));
    }

    #[test]
    fn test_interval_collector() {
        let mut c = IntervalCollector::new("digits", digit_mapper());
        c.add(key(b"k3"), b"").unwrap();
        c.add(key(b"k9"), b"").unwrap();
        c.add(key(b"x"), b"").unwrap();
        let b1 = c.finish_data_block().unwrap();
        assert_eq!(Interval::decode(&b1).unwrap(), Interval::new(3, 10));
        c.add_prev_data_block_to_index_block();

        c.add(key(b"k20"), b"").unwrap();
        let b2 = c.finish_data_block().unwrap();
        assert_eq!(Interval::decode(&b2).unwrap(), Interval::new(20, 21));
        c.add_prev_data_block_to_index_block();

        let idx = c.finish_index_block().unwrap();
        assert_eq!(Interval::decode(&idx).unwrap(), Interval::new(3, 21));
        assert!(c.finish_index_block().unwrap().is_empty());
        assert_eq!(Interval::decode(&c.finish_table().unwrap()).unwrap(), Interval::new(3, 21));
    }

    fn user_props(entries: &[(&str, ShortId, Vec<u8>)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(name, id, prop)| {
                let mut v = vec![*id];
                v.extend_from_slice(prop);
                (name.to_string(), v)
            })
            .collect()
    }

    #[test]
    fn test_filterer_table_level() {
        let filterer = BlockPropertiesFilterer::new(vec![Arc::new(IntervalFilter::new("digits", 50, 60))], None);
        let props = user_props(&[("digits", 0, Interval::new(0, 10).encode())]);
        assert!(filterer.intersects_user_props_and_finish_init(&props).unwrap().is_none());

        let props = user_props(&[("digits", 0, Interval::new(0, 100).encode())]);
        let bound = filterer.intersects_user_props_and_finish_init(&props).unwrap().unwrap();
        assert!(!bound.is_empty());

        // A table without the property is not filtered.
        let bound = filterer.intersects_user_props_and_finish_init(&BTreeMap::new()).unwrap().unwrap();
        assert!(bound.is_empty());
        assert_eq!(bound.intersects(b"").unwrap(), IntersectsResult::Intersects);
    }

    #[test]
    fn test_filterer_blocks() {
        let filters: Vec<Arc<dyn BlockPropertyFilter>> =
            vec![Arc::new(IntervalFilter::new("digits", 50, 60)), Arc::new(ObsoleteKeyFilter)];
        let limited = KeyBoundedIntervalFilter::new(
            IntervalFilter::new("other", 0, 5),
            Arc::new(BytewiseComparer),
            Some(b"b".to_vec()),
            Some(b"m".to_vec()),
        );
        let filterer = BlockPropertiesFilterer::new(filters, Some(Arc::new(limited)));
        let props = user_props(&[
            ("digits", 1, Interval::new(0, 100).encode()),
            (OBSOLETE_KEY_PROPERTY_NAME, 0, Vec::new()),
            ("other", 2, Interval::new(0, 100).encode()),
        ]);
        let f = filterer.intersects_user_props_and_finish_init(&props).unwrap().unwrap();

        let block = |digits: Interval, obsolete: bool, other: Interval| {
            let mut enc = BlockPropertiesEncoder::default();
            enc.add_prop(0, &encode_obsolete(obsolete));
            enc.add_prop(1, &digits.encode());
            enc.add_prop(2, &other.encode());
            enc.finish()
        };
        let hit = block(Interval::new(55, 56), false, Interval::new(1, 2));
        assert_eq!(f.intersects(&hit).unwrap(), IntersectsResult::Intersects);
        let miss = block(Interval::new(10, 20), false, Interval::new(1, 2));
        assert_eq!(f.intersects(&miss).unwrap(), IntersectsResult::Excluded);
        let obsolete = block(Interval::new(55, 56), true, Interval::new(1, 2));
        assert_eq!(f.intersects(&obsolete).unwrap(), IntersectsResult::Excluded);
        let maybe = block(Interval::new(55, 56), false, Interval::new(30, 40));
        assert_eq!(f.intersects(&maybe).unwrap(), IntersectsResult::MaybeExcluded);

        let limited = f.bound_limited_filter().unwrap();
        assert!(limited.key_is_within_lower_bound(b"c"));
        assert!(!limited.key_is_within_lower_bound(b"a"));
        assert!(limited.key_is_within_upper_bound(b"m"));
        assert!(!limited.key_is_within_upper_bound(b"n"));
    }

    #[test]
    fn test_obsolete_collector() {
        let mut c = ObsoleteKeyCollector::default();
        c.add_point(true);
        c.add_point(true);
        assert_eq!(c.finish_data_block().unwrap(), b"t");
        c.add_prev_data_block_to_index_block();
        c.add_point(true);
        c.add_point(false);
        assert!(c.finish_data_block().unwrap().is_empty());
        c.add_prev_data_block_to_index_block();
        assert!(c.finish_index_block().unwrap().is_empty());
        assert!(c.finish_table().unwrap().is_empty());

        assert!(!ObsoleteKeyFilter.intersects(b"t").unwrap());
        assert!(ObsoleteKeyFilter.intersects(b"").unwrap());
        assert!(ObsoleteKeyFilter.intersects(b"x").is_err());
    }
}
