//! Subnet allocator: partitions a pool into equal blocks and hands them out.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::{IpamError, IpamResult};
use crate::seed::{IdentitySeed, SeedStrategy};

/// Allocates fixed-size blocks out of one pool.
///
/// The pool is viewed as `num_blocks` equal blocks indexed from the pool's
/// network address upwards. Allocation state lives only in memory; callers
/// rebuild it with [`SubnetAllocator::record`] on startup.
pub struct SubnetAllocator {
    /// The pool, truncated to its network address.
    pool: IpNet,
    /// Prefix length of every block.
    block_prefix: u8,
    /// Number of blocks in the pool, saturating at `u128::MAX`.
    num_blocks: u128,
    /// Addresses covered by one block.
    block_size: u128,
    /// Blocks currently handed out.
    allocated: Mutex<HashSet<IpNet>>,
    /// Source of the scan's starting index.
    seed: Arc<dyn SeedStrategy>,
}

impl SubnetAllocator {
    /// Create an allocator over `pool_cidr` handing out `/block_prefix` blocks.
    ///
    /// The block prefix must be strictly longer than the pool's and no
    /// longer than the family's maximum.
    pub fn new(pool_cidr: &str, block_prefix: u8) -> IpamResult<Self> {
        let pool = pool_cidr
            .trim()
            .parse::<IpNet>()
            .map_err(|_| IpamError::InvalidPool(pool_cidr.to_string()))?
            .trunc();

        if block_prefix <= pool.prefix_len() || block_prefix > pool.max_prefix_len() {
            return Err(IpamError::InvalidMaskSize {
                pool,
                requested: block_prefix,
            });
        }

        let split_bits = u32::from(block_prefix - pool.prefix_len());
        let num_blocks = if split_bits >= 128 {
            u128::MAX
        } else {
            1u128 << split_bits
        };
        let block_size = 1u128 << u32::from(pool.max_prefix_len() - block_prefix);

        debug!(%pool, block_prefix, %num_blocks, "subnet allocator created");

        Ok(Self {
            pool,
            block_prefix,
            num_blocks,
            block_size,
            allocated: Mutex::new(HashSet::new()),
            seed: Arc::new(IdentitySeed),
        })
    }

    /// Replace the seed source (tests inject a fixed seed).
    pub fn with_seed_strategy(mut self, seed: Arc<dyn SeedStrategy>) -> Self {
        self.seed = seed;
        self
    }

    pub fn pool(&self) -> IpNet {
        self.pool
    }

    pub fn block_prefix(&self) -> u8 {
        self.block_prefix
    }

    pub fn num_blocks(&self) -> u128 {
        self.num_blocks
    }

    /// Whether both the first and last address of `block` lie in the pool.
    pub fn contains(&self, block: &IpNet) -> bool {
        self.pool.contains(&block.network()) && self.pool.contains(&block.broadcast())
    }

    /// Mark `block` as allocated.
    ///
    /// Any in-range block is accepted, whether or not it lines up with the
    /// block partition.
    pub fn record(&self, block: &IpNet) -> IpamResult<()> {
        self.check_range(block)?;
        self.allocated.lock().insert(block.trunc());
        Ok(())
    }

    /// Release `block`. Releasing a block that is not allocated is a no-op.
    pub fn reclaim(&self, block: &IpNet) -> IpamResult<()> {
        self.check_range(block)?;
        self.allocated.lock().remove(&block.trunc());
        Ok(())
    }

    pub fn is_allocated(&self, block: &IpNet) -> bool {
        self.allocated.lock().contains(&block.trunc())
    }

    /// Number of blocks currently allocated.
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }

    /// Allocated blocks in address order.
    pub fn allocated_blocks(&self) -> Vec<IpNet> {
        let mut blocks: Vec<IpNet> = self.allocated.lock().iter().copied().collect();
        blocks.sort();
        blocks
    }

    /// Find, record, and return a free block.
    ///
    /// The scan starts at an index drawn from an RNG seeded by `seed_key`
    /// and walks forward one block at a time, wrapping after the last
    /// block, for at most one full circuit.
    pub fn get_free_subnet_block(&self, seed_key: &str) -> IpamResult<IpNet> {
        let host_granular = self.block_prefix == self.pool.max_prefix_len();
        let mut rng = StdRng::seed_from_u64(self.seed.seed(seed_key, host_granular));
        let mut index = rng.random_range(0..self.num_blocks);

        let mut allocated = self.allocated.lock();
        let mut steps = 0u128;
        while steps < self.num_blocks {
            let block = self.block_at(index)?;
            if allocated.insert(block) {
                debug!(pool = %self.pool, subnet = %block, key = seed_key, "subnet block allocated");
                return Ok(block);
            }

            index += 1;
            if index == self.num_blocks {
                index = 0;
            }
            steps += 1;
        }

        warn!(pool = %self.pool, key = seed_key, "subnet pool exhausted");
        Err(IpamError::NoAvailableSubnet { pool: self.pool })
    }

    fn check_range(&self, block: &IpNet) -> IpamResult<()> {
        if self.contains(block) {
            Ok(())
        } else {
            Err(IpamError::OutOfRange {
                block: *block,
                pool: self.pool,
            })
        }
    }

    /// The block at `index` of the partition.
    fn block_at(&self, index: u128) -> IpamResult<IpNet> {
        let offset = index * self.block_size;
        let invalid = || IpamError::InvalidMaskSize {
            pool: self.pool,
            requested: self.block_prefix,
        };

        match self.pool.network() {
            IpAddr::V4(base) => {
                let addr = Ipv4Addr::from((u128::from(u32::from(base)) + offset) as u32);
                Ipv4Net::new(addr, self.block_prefix)
                    .map(IpNet::V4)
                    .map_err(|_| invalid())
            }
            IpAddr::V6(base) => {
                let addr = Ipv6Addr::from(u128::from(base) + offset);
                Ipv6Net::new(addr, self.block_prefix)
                    .map(IpNet::V6)
                    .map_err(|_| invalid())
            }
        }
    }
}

impl std::fmt::Debug for SubnetAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetAllocator")
            .field("pool", &self.pool)
            .field("block_prefix", &self.block_prefix)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}
