use crate::err::Error;
use bit_vec::BitVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::hash_map::DefaultHasher,
    hash::Hasher,
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

/// Bloom filter over partition keys. Guarantees no false negatives; the
/// false positive rate is configured at construction.
#[derive(Debug)]
pub struct BloomFilter {
    pub no_of_hash_func: usize,
    pub no_of_elements: AtomicU32,
    pub bit_vec: Arc<Mutex<BitVec>>,
}

impl Clone for BloomFilter {
    fn clone(&self) -> Self {
        Self {
            no_of_hash_func: self.no_of_hash_func,
            no_of_elements: AtomicU32::new(self.no_of_elements.load(Ordering::Relaxed)),
            bit_vec: Arc::clone(&self.bit_vec),
        }
    }
}

impl BloomFilter {
    pub fn new(false_positive_rate: f64, no_of_elements: usize) -> Self {
        assert!(
            false_positive_rate > 0.0,
            "False positive rate can not be less than or equal to zero"
        );
        let no_of_elements = no_of_elements.max(1);
        let no_of_bits = Self::calculate_no_of_bits(no_of_elements, false_positive_rate);
        let no_of_hash_func =
            Self::calculate_no_of_hash_function(no_of_bits, no_of_elements as u32) as usize;
        let bv = BitVec::from_elem(no_of_bits as usize, false);

        Self {
            no_of_elements: AtomicU32::new(0),
            no_of_hash_func,
            bit_vec: Arc::new(Mutex::new(bv)),
        }
    }

    pub(crate) fn set<K: AsRef<[u8]>>(&mut self, key: K) {
        let mut bits = self.bit_vec.lock().expect("Failed to lock bit vector");
        for i in 0..self.no_of_hash_func {
            let hash = self.calculate_hash(key.as_ref(), i);
            let index = (hash % bits.len() as u64) as usize;
            bits.set(index, true)
        }
        self.no_of_elements.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn contains<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let bits = self.bit_vec.lock().expect("Failed to lock bit vector");
        for i in 0..self.no_of_hash_func {
            let hash = self.calculate_hash(key.as_ref(), i);
            let index = (hash % bits.len() as u64) as usize;
            if !bits[index] {
                return false;
            }
        }
        true
    }

    /// Returns the current number of elements inserted into the Bloom filter.
    pub fn num_elements(&self) -> usize {
        self.no_of_elements.load(Ordering::Relaxed) as usize
    }

    pub fn num_bits(&self) -> usize {
        self.bit_vec.lock().expect("Failed to lock bit vector").len()
    }

    /// Serializes the filter into the on-disk Filter component layout:
    /// hash-function count, element count, bit length, then the raw bits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bits = self.bit_vec.lock().expect("Failed to lock bit vector");
        let mut out = Vec::with_capacity(12 + bits.len() / 8 + 1);
        out.write_u32::<BigEndian>(self.no_of_hash_func as u32)
            .expect("write to vec");
        out.write_u32::<BigEndian>(self.no_of_elements.load(Ordering::Relaxed))
            .expect("write to vec");
        out.write_u32::<BigEndian>(bits.len() as u32)
            .expect("write to vec");
        out.extend_from_slice(&bits.to_bytes());
        out
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(bytes);
        let mut read_u32 = |cursor: &mut Cursor<&[u8]>| {
            cursor.read_u32::<BigEndian>().map_err(|_| Error::MalformedSstable {
                path: path.to_path_buf(),
                reason: "truncated filter header".to_string(),
            })
        };
        let no_of_hash_func = read_u32(&mut cursor)? as usize;
        let no_of_elements = read_u32(&mut cursor)?;
        let bit_len = read_u32(&mut cursor)? as usize;
        let mut bits = BitVec::from_bytes(&bytes[12..]);
        if bits.len() < bit_len {
            return Err(Error::MalformedSstable {
                path: path.to_path_buf(),
                reason: "filter bit vector shorter than header claims".to_string(),
            });
        }
        bits.truncate(bit_len);
        Ok(Self {
            no_of_hash_func,
            no_of_elements: AtomicU32::new(no_of_elements),
            bit_vec: Arc::new(Mutex::new(bits)),
        })
    }

    fn calculate_hash(&self, key: &[u8], seed: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        hasher.write_usize(seed);
        hasher.finish()
    }

    fn calculate_no_of_bits(no_of_elements: usize, false_positive_rate: f64) -> u32 {
        let no_bits = -((no_of_elements as f64 * false_positive_rate.ln())
            / ((2_f64.ln()).powi(2)));
        no_bits.ceil().max(8.0) as u32
    }

    fn calculate_no_of_hash_function(no_of_bits: u32, no_of_elements: u32) -> u32 {
        let no_hash_func = (no_of_bits as f64 / no_of_elements as f64) * 2_f64.ln();
        no_hash_func.ceil().max(1.0) as u32
    }
}
