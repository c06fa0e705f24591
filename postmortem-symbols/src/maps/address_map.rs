//! Nearest-predecessor point lookup over a serialized buffer.

use super::{MapFormatError, StaticMap};

/// A read-only map from addresses to byte payloads with
/// greatest-point-at-or-below retrieval. Used for public symbols, whose
/// extent implicitly runs to the next symbol.
#[derive(Clone, Copy, Debug)]
pub struct StaticAddressMap<'a> {
    inner: StaticMap<'a, u64>,
}

impl<'a> StaticAddressMap<'a> {
    pub fn new(buffer: &'a [u8]) -> Result<StaticAddressMap<'a>, MapFormatError> {
        Ok(StaticAddressMap {
            inner: StaticMap::new(buffer)?,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The payload and point of the greatest entry at or below `addr`.
    pub fn retrieve(&self, addr: u64) -> Option<(&'a [u8], u64)> {
        let i = self.inner.upper_bound(addr);
        if i == 0 {
            return None;
        }
        Some((self.inner.value_at(i - 1), self.inner.key_at(i - 1)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &'a [u8])> + '_ {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::writer::StaticMapWriter;

    #[test]
    fn test_retrieve() {
        let mut w = StaticMapWriter::<u64>::new();
        w.insert(0x100, b"low");
        w.insert(0x500, b"mid");
        w.insert(0x900, b"high");
        let bytes = w.finish();
        let map = StaticAddressMap::new(&bytes).unwrap();

        assert_eq!(map.retrieve(0xff), None);
        assert_eq!(map.retrieve(0x100), Some((&b"low"[..], 0x100)));
        assert_eq!(map.retrieve(0x4ff), Some((&b"low"[..], 0x100)));
        assert_eq!(map.retrieve(0x500), Some((&b"mid"[..], 0x500)));
        assert_eq!(map.retrieve(u64::MAX), Some((&b"high"[..], 0x900)));
    }
}
