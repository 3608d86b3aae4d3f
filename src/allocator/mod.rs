//! Bridge-internal allocators.
//!
//! Bookkeeping that describes foreign objects never goes through the host
//! allocator (which the foreign code may itself be interposing): the typed
//! region allocator backs fixed-size records and can write-protect them
//! between loads, and the block allocator serves the variable-size requests
//! the bridge makes on behalf of foreign runtime calls.

mod block;
mod region;

pub use block::BlockAllocator;
pub use region::{RegionAllocator, SlotAllocator};
