//! Allocation of uniquely named test resources.
//!
//! [`pattern`] turns pattern strings into candidate pools and [`allocator`]
//! picks free names from them, consulting a property store to skip names
//! that are already recorded as in use.

pub mod allocator;
pub mod pattern;

pub use allocator::{
    obtain_resources, AllocationRequest, FnLookup, ResourceAllocator, ResourceLookup, StoreLookup,
};
pub use pattern::{ResourcePool, ResourceString};
