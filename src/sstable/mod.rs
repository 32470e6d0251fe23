mod components;
mod filtering;
mod populate;
mod set;
mod sst;

pub use components::{Component, Descriptor};
pub use filtering::{filter_sstables_for_reader, QuerySlice};
pub use populate::{populate, ProbeOutcome};
pub use set::SstableSet;
pub use sst::{Sstable, StatsMetadata, Summary};
