//! tunnelgrid-ipam: collision-avoiding subnet block allocation.
//!
//! A [`SubnetAllocator`] partitions a pool CIDR into equal-sized blocks
//! and hands them out one per request. Each request scans the partition
//! from a pseudo-random starting index derived from a seed key, so
//! different callers racing at the same instant tend to scan different
//! blocks first.
//!
//! # Architecture
//!
//! ```text
//! SubnetAllocator
//!   ├── pool (IpNet) + block prefix length
//!   ├── Mutex<HashSet<IpNet>>   allocated blocks
//!   └── SeedStrategy            seed key → u64 seed
//!         ├── IdentitySeed      SHA-256 of the key (clock for host blocks)
//!         └── FixedSeed         constant, for tests
//! ```
//!
//! The allocator is authoritative only within one process; callers must
//! make sure a single allocator instance owns a pool at a time.

pub mod allocator;
pub mod error;
pub mod seed;

pub use allocator::SubnetAllocator;
pub use error::{IpamError, IpamResult};
pub use seed::{FixedSeed, IdentitySeed, SeedStrategy};
