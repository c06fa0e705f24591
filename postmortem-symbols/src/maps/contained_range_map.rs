//! Nested-interval lookup, used for inlined-call chains.
//!
//! Both an in-memory builder ([`ContainedRangeMap`]) and a serialized
//! view ([`StaticContainedRangeMap`]) live here; the builder also knows
//! how to emit the serialized form.

use super::{u32_at, writer::StaticRangeMapWriter, MapFormatError, StaticRangeMap};

/// An in-memory map of properly nested intervals.
///
/// Sibling intervals are disjoint; a newly inserted interval must either
/// be disjoint from every existing sibling or lie entirely within one,
/// in which case it descends into that sibling's children. Inserting in
/// outermost-first order (e.g. sorted by inline depth) keeps this
/// invariant trivially satisfiable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainedRangeMap<V> {
    entries: Vec<ContainedEntry<V>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ContainedEntry<V> {
    base: u64,
    high: u64,
    value: V,
    children: ContainedRangeMap<V>,
}

impl<V> ContainedRangeMap<V> {
    pub fn new() -> ContainedRangeMap<V> {
        ContainedRangeMap { entries: vec![] }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `[base, high]` (inclusive). Fails on an interval that
    /// straddles an existing one without containing or being contained.
    pub fn insert(&mut self, base: u64, high: u64, value: V) -> Result<(), ()> {
        if base > high {
            return Err(());
        }
        // Find the first sibling not entirely below the new interval.
        let pos = self.entries.partition_point(|e| e.high < base);
        if let Some(entry) = self.entries.get_mut(pos) {
            if base >= entry.base && high <= entry.high {
                return entry.children.insert(base, high, value);
            }
            if entry.base <= high {
                // Overlaps but is not contained. The proper-nesting
                // precondition does not hold; refuse the record.
                return Err(());
            }
        }
        self.entries.insert(
            pos,
            ContainedEntry {
                base,
                high,
                value,
                children: ContainedRangeMap::new(),
            },
        );
        Ok(())
    }

    /// All values whose intervals contain `addr`, outermost first, as
    /// `(value, base, size)`.
    pub fn retrieve_ranges(&self, addr: u64) -> Vec<(&V, u64, u64)> {
        let mut out = vec![];
        self.retrieve_into(addr, &mut out);
        out
    }

    fn retrieve_into<'s>(&'s self, addr: u64, out: &mut Vec<(&'s V, u64, u64)>) {
        let pos = self.entries.partition_point(|e| e.high < addr);
        if let Some(entry) = self.entries.get(pos) {
            if addr >= entry.base {
                out.push((&entry.value, entry.base, entry.high - entry.base + 1));
                entry.children.retrieve_into(addr, out);
            }
        }
    }

    /// Serialize, encoding each value with `encode`.
    pub fn serialize(&self, encode: &impl Fn(&V, &mut Vec<u8>)) -> Vec<u8> {
        let mut writer = StaticRangeMapWriter::new();
        for entry in &self.entries {
            let mut entry_bytes = Vec::new();
            encode(&entry.value, &mut entry_bytes);
            let child_bytes = entry.children.serialize(encode);
            let mut payload = Vec::with_capacity(4 + entry_bytes.len() + child_bytes.len());
            payload.extend_from_slice(&(entry_bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(&entry_bytes);
            payload.extend_from_slice(&child_bytes);
            writer.insert(entry.base, entry.high, &payload);
        }
        writer.finish()
    }
}

/// The serialized counterpart of [`ContainedRangeMap`]: a
/// [`StaticRangeMap`] whose payloads are
/// `[entry_len: u32][entry][child map bytes]` nodes.
#[derive(Clone, Copy, Debug)]
pub struct StaticContainedRangeMap<'a> {
    ranges: StaticRangeMap<'a>,
}

impl<'a> StaticContainedRangeMap<'a> {
    /// Construct and validate the whole tree.
    pub fn new(buffer: &'a [u8]) -> Result<StaticContainedRangeMap<'a>, MapFormatError> {
        let ranges = StaticRangeMap::new(buffer)?;
        for (payload, _, _) in ranges.iter() {
            let (_, child) = Self::split_node(payload)?;
            StaticContainedRangeMap::new(child)?;
        }
        Ok(StaticContainedRangeMap { ranges })
    }

    fn split_node(payload: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), MapFormatError> {
        if payload.len() < 4 {
            return Err(MapFormatError::Truncated);
        }
        let entry_len = u32_at(payload, 0) as usize;
        if payload.len() < 4 + entry_len {
            return Err(MapFormatError::Truncated);
        }
        Ok((&payload[4..4 + entry_len], &payload[4 + entry_len..]))
    }

    /// All entries whose intervals contain `addr`, outermost first, as
    /// `(entry, base, size)`.
    pub fn retrieve_ranges(&self, addr: u64) -> Vec<(&'a [u8], u64, u64)> {
        let mut out = vec![];
        self.retrieve_into(addr, &mut out);
        out
    }

    fn retrieve_into(&self, addr: u64, out: &mut Vec<(&'a [u8], u64, u64)>) {
        let Some((payload, base, size)) = self.ranges.retrieve_range(addr) else {
            return;
        };
        // The tree was validated at construction, so these cannot fail.
        let Ok((entry, child)) = Self::split_node(payload) else {
            return;
        };
        out.push((entry, base, size));
        if let Ok(child_map) = StaticContainedRangeMap::new(child) {
            child_map.retrieve_into(addr, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(v: &u32, out: &mut Vec<u8>) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn build() -> ContainedRangeMap<u32> {
        let mut map = ContainedRangeMap::new();
        map.insert(0x1000, 0x1fff, 1).unwrap();
        map.insert(0x1100, 0x11ff, 2).unwrap();
        map.insert(0x1140, 0x117f, 3).unwrap();
        map.insert(0x1800, 0x18ff, 4).unwrap();
        map.insert(0x3000, 0x3fff, 5).unwrap();
        map
    }

    #[test]
    fn test_in_memory_retrieve() {
        let map = build();
        let found: Vec<u32> = map
            .retrieve_ranges(0x1150)
            .iter()
            .map(|(v, _, _)| **v)
            .collect();
        assert_eq!(found, vec![1, 2, 3]);

        let found: Vec<u32> = map
            .retrieve_ranges(0x1850)
            .iter()
            .map(|(v, _, _)| **v)
            .collect();
        assert_eq!(found, vec![1, 4]);

        assert!(map.retrieve_ranges(0x2000).is_empty());
        assert_eq!(map.retrieve_ranges(0x3000).len(), 1);
    }

    #[test]
    fn test_rejects_straddle() {
        let mut map = build();
        assert!(map.insert(0x1f00, 0x20ff, 9).is_err());
    }

    #[test]
    fn test_equal_ranges_nest() {
        // An inline whose body is exactly one call produces equal ranges
        // at successive depths.
        let mut map = ContainedRangeMap::new();
        map.insert(0x100, 0x1ff, 1).unwrap();
        map.insert(0x100, 0x1ff, 2).unwrap();
        map.insert(0x100, 0x1ff, 3).unwrap();
        let found: Vec<u32> = map
            .retrieve_ranges(0x180)
            .iter()
            .map(|(v, _, _)| **v)
            .collect();
        assert_eq!(found, vec![1, 2, 3]);
    }

    #[test]
    fn test_serialized_matches_builder() {
        let map = build();
        let bytes = map.serialize(&encode);
        let view = StaticContainedRangeMap::new(&bytes).unwrap();

        for addr in [0x1000u64, 0x1150, 0x1850, 0x2000, 0x3000, 0x30ff, 0xffff] {
            let built: Vec<(u32, u64, u64)> = map
                .retrieve_ranges(addr)
                .iter()
                .map(|(v, b, s)| (**v, *b, *s))
                .collect();
            let loaded: Vec<(u32, u64, u64)> = view
                .retrieve_ranges(addr)
                .iter()
                .map(|(e, b, s)| (u32_at(e, 0), *b, *s))
                .collect();
            assert_eq!(built, loaded, "mismatch at {addr:#x}");
        }
    }
}
