//! The flat sorted map every other static container is built from.

use std::marker::PhantomData;

use super::{u32_at, u64_at, MapFormatError};

/// A key type usable in a [`StaticMap`].
pub trait MapKey: Copy + Ord {
    const SIZE: usize;
    fn read(bytes: &[u8], offset: usize) -> Self;
    fn write(self, out: &mut Vec<u8>);
}

impl MapKey for u32 {
    const SIZE: usize = 4;
    fn read(bytes: &[u8], offset: usize) -> Self {
        u32_at(bytes, offset)
    }
    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl MapKey for u64 {
    const SIZE: usize = 8;
    fn read(bytes: &[u8], offset: usize) -> Self {
        u64_at(bytes, offset)
    }
    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// A read-only sorted map over a byte buffer.
///
/// Layout:
///
/// ```text
/// [count: u32][offset[count + 1]: u32][key[count]: K][values blob]
/// ```
///
/// `offset[i]` is the start of value `i` within the blob and
/// `offset[count]` equals the blob's length, so every value's extent is
/// `offset[i]..offset[i + 1]`.
#[derive(Clone, Copy, Debug)]
pub struct StaticMap<'a, K: MapKey> {
    count: usize,
    offsets: &'a [u8],
    keys: &'a [u8],
    values: &'a [u8],
    _key: PhantomData<K>,
}

impl<'a, K: MapKey> StaticMap<'a, K> {
    /// Construct a view over `buffer`, validating the entire layout.
    ///
    /// `buffer` must be exactly the serialized map, nothing more.
    pub fn new(buffer: &'a [u8]) -> Result<StaticMap<'a, K>, MapFormatError> {
        if buffer.len() < 4 {
            return Err(MapFormatError::Truncated);
        }
        let count = u32_at(buffer, 0) as usize;
        let offsets_len = (count + 1).checked_mul(4).ok_or(MapFormatError::Truncated)?;
        let keys_len = count.checked_mul(K::SIZE).ok_or(MapFormatError::Truncated)?;
        let header_len = 4usize
            .checked_add(offsets_len)
            .and_then(|n| n.checked_add(keys_len))
            .ok_or(MapFormatError::Truncated)?;
        if buffer.len() < header_len {
            return Err(MapFormatError::Truncated);
        }
        let offsets = &buffer[4..4 + offsets_len];
        let keys = &buffer[4 + offsets_len..header_len];
        let values = &buffer[header_len..];

        let mut prev_offset = 0u32;
        for i in 0..=count {
            let offset = u32_at(offsets, i * 4);
            if i > 0 && offset < prev_offset {
                return Err(MapFormatError::BadOffsets);
            }
            prev_offset = offset;
        }
        if prev_offset as usize != values.len() {
            return Err(MapFormatError::BadOffsets);
        }
        for i in 1..count {
            if K::read(keys, i * K::SIZE) <= K::read(keys, (i - 1) * K::SIZE) {
                return Err(MapFormatError::UnsortedKeys);
            }
        }

        Ok(StaticMap {
            count,
            offsets,
            keys,
            values,
            _key: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn key_at(&self, index: usize) -> K {
        K::read(self.keys, index * K::SIZE)
    }

    pub fn value_at(&self, index: usize) -> &'a [u8] {
        let start = u32_at(self.offsets, index * 4) as usize;
        let end = u32_at(self.offsets, (index + 1) * 4) as usize;
        &self.values[start..end]
    }

    /// The number of entries whose key is strictly less than `key`, which
    /// is also the index of the first entry with `key_at(i) >= key`.
    pub fn lower_bound(&self, key: K) -> usize {
        let mut lo = 0;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The number of entries whose key is less than or equal to `key`.
    pub fn upper_bound(&self, key: K) -> usize {
        let mut lo = 0;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Exact-key lookup.
    pub fn get(&self, key: K) -> Option<&'a [u8]> {
        let i = self.lower_bound(key);
        if i < self.count && self.key_at(i) == key {
            Some(self.value_at(i))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &'a [u8])> + '_ {
        (0..self.count).map(move |i| (self.key_at(i), self.value_at(i)))
    }
}
