use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent with existence filters.
///
/// Each probe hashes the name with MD5, splits the digest into two
/// little-endian `u64`s and tests bits `(h1 + i * h2) mod bit_count` for
/// `i in 0..hash_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Builds a filter sized for `bit_count` bits holding `values`.
    pub fn create<'a>(bit_count: u64, hash_count: i32, values: impl IntoIterator<Item = &'a str>) -> FirestoreResult<Self> {
        let padding = if bit_count % 8 == 0 { 0 } else { 8 - (bit_count % 8) as i32 };
        let bitmap = vec![0u8; bit_count.div_ceil(8) as usize];
        let mut filter = Self::new(bitmap, padding, hash_count)?;
        for value in values {
            filter.insert(value);
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> i32 {
        (self.bitmap.len() as u64 * 8 - self.bit_count) as i32
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = hash_pair(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(hash1, hash2, i)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (hash1, hash2) = hash_pair(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(hash1, hash2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, hash1: u64, hash2: u64, hash_index: u32) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(u64::from(hash_index))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_shapes() {
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], -1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![1], 0, -1).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("a"));
    }

    #[test]
    fn inserted_values_are_found() {
        let names: Vec<String> = (0..50)
            .map(|i| format!("projects/p/databases/(default)/documents/rooms/{i}"))
            .collect();
        let filter = BloomFilter::create(1_000, 7, names.iter().map(String::as_str)).unwrap();
        assert_eq!(filter.padding(), 0);
        for name in &names {
            assert!(filter.might_contain(name));
        }
        let false_positives = (50..1_050)
            .filter(|i| filter.might_contain(&format!("projects/p/databases/(default)/documents/rooms/{i}")))
            .count();
        assert!(false_positives < 100, "too many false positives: {false_positives}");
    }

    #[test]
    fn padding_trims_the_bit_count() {
        let filter = BloomFilter::create(13, 2, ["a"]).unwrap();
        assert_eq!(filter.bitmap().len(), 2);
        assert_eq!(filter.padding(), 3);
        assert_eq!(filter.bit_count(), 13);
        assert!(filter.might_contain("a"));
    }
}
