//! Storage backends: the flat memory-mapped store for dense families
//! and the two inverted-index implementations for sparse families.

pub mod fixed;
pub mod inverted;

pub use fixed::FixedStore;
pub use inverted::{bucket::BucketIndex, disk::DiskIndex, InvertedIndex, PostingRecord};
