mod bf;

pub use bf::BloomFilter;
