//! Per-operator resource constants consumed by the generic planner.

use serde::{Deserialize, Serialize};

/// How blocks are spread over the cores that take part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPolicy {
    /// `blocks / used` per core, the first `blocks % used` cores take one more.
    EvenBlocks,
    /// Every core but the last takes `max(ceil(blocks / cores), min_blocks)`
    /// blocks and the last core takes what is left.
    LastCoreTail { min_blocks: u64 },
}

/// Resource profile of one operator variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperatorProfile {
    pub name: &'static str,
    /// Live buffers of the element width needed at once (stage buffers for
    /// every input and output plus intermediate scratch).
    pub buffers_per_element: u64,
    /// Chunk sizes are rounded down to a multiple of this many elements, on
    /// top of the DMA block size.
    pub min_align_granularity: u64,
    /// The kernel can stage unaligned core boundaries through scratch.
    pub supports_tail_merge_across_cores: bool,
    pub distribution: DistributionPolicy,
    /// Empty operands produce a no-op plan instead of an error.
    pub allow_empty: bool,
    /// UB bytes reserved by the kernel for its own bookkeeping.
    pub reserved_ub_bytes: u64,
    /// Depth of the copy-in/copy-out queues.
    pub buffer_num: u64,
}

impl OperatorProfile {
    pub const fn new(name: &'static str, buffers_per_element: u64) -> Self {
        Self {
            name,
            buffers_per_element,
            min_align_granularity: 1,
            supports_tail_merge_across_cores: false,
            distribution: DistributionPolicy::EvenBlocks,
            allow_empty: false,
            reserved_ub_bytes: 0,
            buffer_num: 2,
        }
    }

    #[must_use]
    pub const fn with_granularity(mut self, elems: u64) -> Self {
        self.min_align_granularity = elems;
        self
    }

    #[must_use]
    pub const fn with_tail_merge(mut self, supported: bool) -> Self {
        self.supports_tail_merge_across_cores = supported;
        self
    }

    #[must_use]
    pub const fn with_distribution(mut self, distribution: DistributionPolicy) -> Self {
        self.distribution = distribution;
        self
    }

    #[must_use]
    pub const fn with_empty_allowed(mut self, allowed: bool) -> Self {
        self.allow_empty = allowed;
        self
    }

    #[must_use]
    pub const fn with_reserved_ub(mut self, bytes: u64) -> Self {
        self.reserved_ub_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_buffer_num(mut self, depth: u64) -> Self {
        self.buffer_num = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let profile = OperatorProfile::new("relu", 4)
            .with_tail_merge(true)
            .with_distribution(DistributionPolicy::LastCoreTail { min_blocks: 2 })
            .with_reserved_ub(1024);
        assert_eq!(profile.buffers_per_element, 4);
        assert!(profile.supports_tail_merge_across_cores);
        assert_eq!(profile.distribution, DistributionPolicy::LastCoreTail { min_blocks: 2 });
        assert_eq!(profile.reserved_ub_bytes, 1024);
        assert_eq!(profile.buffer_num, 2);
        assert!(!profile.allow_empty);
    }
}
