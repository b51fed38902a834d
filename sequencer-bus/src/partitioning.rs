//! Partition-affine subject routing
//!
//! Every message for a key lands on the same subject, so one consumer per
//! partition sees a key's entries in append order and no two nodes ever
//! consume the same key.

use sequencer_core::PartitionKey;

/// Partitioning strategy
pub trait PartitioningStrategy: Send + Sync {
    /// Compute partition number for given key
    fn partition(&self, key: &PartitionKey) -> u32;

    /// Total number of partitions
    fn num_partitions(&self) -> u32;
}

/// Hash-based partitioning (default)
#[derive(Debug, Clone)]
pub struct HashPartitioning {
    num_partitions: u32,
}

impl HashPartitioning {
    /// Create new hash-based partitioning; zero is treated as one partition
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }
}

impl Default for HashPartitioning {
    fn default() -> Self {
        Self::new(32) // 32 partitions by default
    }
}

impl PartitioningStrategy for HashPartitioning {
    fn partition(&self, key: &PartitionKey) -> u32 {
        key.partition_number(self.num_partitions)
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}

/// Subject for one partition (`<prefix>.<partition>`)
pub fn partition_subject(prefix: &str, partition: u32) -> String {
    format!("{}.{}", prefix, partition)
}

/// Wildcard covering every partition under `prefix`
pub fn all_partitions(prefix: &str) -> String {
    format!("{}.*", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_partitioning() {
        let strategy = HashPartitioning::new(8);
        let key = PartitionKey::new("193270a9-c9cf-404a-8f83-838e71d9ae67");

        let p1 = strategy.partition(&key);
        let p2 = strategy.partition(&key);

        assert_eq!(p1, p2); // Same key -> same partition
        assert!(p1 < 8);
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let strategy = HashPartitioning::new(4);
        let used: std::collections::HashSet<u32> = (0..64)
            .map(|i| strategy.partition(&PartitionKey::new(format!("rocket-{}", i))))
            .collect();
        assert!(used.len() > 1);
    }

    #[test]
    fn test_subjects() {
        assert_eq!(partition_subject("lunar.incoming", 7), "lunar.incoming.7");
        assert_eq!(all_partitions("lunar.incoming"), "lunar.incoming.*");
        assert_eq!(HashPartitioning::new(0).num_partitions(), 1);
    }
}
