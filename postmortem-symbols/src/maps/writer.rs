//! Builders that emit the serialized form of the static maps.

use super::static_map::MapKey;

/// Accumulates `(key, value)` pairs and emits [`StaticMap`] bytes.
///
/// Entries may be inserted in any order; `finish` sorts them. Duplicate
/// keys are kept (and will fail validation on load), callers are
/// expected to have deduplicated already.
///
/// [`StaticMap`]: super::StaticMap
pub struct StaticMapWriter<K: MapKey> {
    entries: Vec<(K, Vec<u8>)>,
}

impl<K: MapKey> StaticMapWriter<K> {
    pub fn new() -> StaticMapWriter<K> {
        StaticMapWriter { entries: vec![] }
    }

    pub fn insert(&mut self, key: K, value: &[u8]) {
        self.entries.push((key, value.to_vec()));
    }

    pub fn insert_owned(&mut self, key: K, value: Vec<u8>) {
        self.entries.push((key, value));
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        let count = self.entries.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(count as u32).to_le_bytes());
        let mut offset = 0u32;
        for (_, value) in &self.entries {
            out.extend_from_slice(&offset.to_le_bytes());
            offset += value.len() as u32;
        }
        out.extend_from_slice(&offset.to_le_bytes());
        for (key, _) in &self.entries {
            key.write(&mut out);
        }
        for (_, value) in &self.entries {
            out.extend_from_slice(value);
        }
        out
    }
}

impl<K: MapKey> Default for StaticMapWriter<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits [`StaticRangeMap`] bytes: a `StaticMap` keyed by each interval's
/// inclusive high endpoint whose values are prefixed with the base.
///
/// [`StaticRangeMap`]: super::StaticRangeMap
pub struct StaticRangeMapWriter {
    inner: StaticMapWriter<u64>,
}

impl StaticRangeMapWriter {
    pub fn new() -> StaticRangeMapWriter {
        StaticRangeMapWriter {
            inner: StaticMapWriter::new(),
        }
    }

    /// Insert the interval `[base, high]` (inclusive) with `payload`.
    pub fn insert(&mut self, base: u64, high: u64, payload: &[u8]) {
        let mut value = Vec::with_capacity(8 + payload.len());
        value.extend_from_slice(&base.to_le_bytes());
        value.extend_from_slice(payload);
        self.inner.insert_owned(high, value);
    }

    pub fn finish(self) -> Vec<u8> {
        self.inner.finish()
    }
}

impl Default for StaticRangeMapWriter {
    fn default() -> Self {
        Self::new()
    }
}
