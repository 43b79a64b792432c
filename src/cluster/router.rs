//! Shard routing: key -> shard -> ordered replica group.

use crate::cluster::ServerIdx;
use crate::utils::ShardKvError;

/// Cluster-wide constants shared by every server and clerk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Total number of servers in the cluster.
    pub nservers: u8,

    /// Number of servers holding each key, primary included.
    pub nreplicas: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            nservers: 3,
            nreplicas: 2,
        }
    }
}

impl ClusterConfig {
    /// Parses a cluster config from an optional TOML string, falling back to
    /// defaults for absent fields, and validates it.
    pub fn parse(config_str: Option<&str>) -> Result<Self, ShardKvError> {
        let config =
            parsed_config!(config_str => ClusterConfig; nservers, nreplicas)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the replica group size fits the cluster.
    pub fn validate(&self) -> Result<(), ShardKvError> {
        if self.nservers == 0 {
            return Err(ShardKvError(format!(
                "invalid nservers {}",
                self.nservers
            )));
        }
        if self.nreplicas == 0 || self.nreplicas > self.nservers {
            return Err(ShardKvError(format!(
                "invalid nreplicas {} with nservers {}",
                self.nreplicas, self.nservers
            )));
        }
        Ok(())
    }
}

/// 64-bit FNV-1a over the key's bytes. Stable across builds and platforms,
/// unlike `std`'s `DefaultHasher`.
fn fnv1a_64(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    })
}

/// Floored remainder of a signed decimal integer string divided by `m`,
/// computed digit by digit. `None` if `num` is not such a string.
fn decimal_rem(num: &str, m: u64) -> Option<u64> {
    let (negative, digits) = match num.as_bytes().first() {
        Some(b'-') => (true, &num[1..]),
        Some(b'+') => (false, &num[1..]),
        _ => (false, num),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let rem = digits
        .bytes()
        .fold(0, |rem, b| (rem * 10 + (b - b'0') as u64) % m);
    if negative && rem != 0 {
        Some(m - rem)
    } else {
        Some(rem)
    }
}

/// Pure mapping from keys to shards and replica groups. Clerks and servers
/// construct it from the same `ClusterConfig` and therefore always agree on
/// ownership without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    nservers: u8,
    nreplicas: u8,
}

impl ShardRouter {
    /// Creates a router for the given config. Fails if the config does not
    /// validate.
    pub fn new(config: &ClusterConfig) -> Result<Self, ShardKvError> {
        config.validate()?;
        Ok(ShardRouter {
            nservers: config.nservers,
            nreplicas: config.nreplicas,
        })
    }

    #[inline]
    pub fn nservers(&self) -> u8 {
        self.nservers
    }

    #[inline]
    pub fn nreplicas(&self) -> u8 {
        self.nreplicas
    }

    /// Shard index of a key. Keys holding a decimal integer of any length
    /// map to that integer modulo `nservers` (floored, so negatives stay in
    /// range); any other key maps through its FNV-1a hash.
    pub fn shard_of(&self, key: &str) -> ServerIdx {
        match decimal_rem(key.trim(), self.nservers as u64) {
            Some(rem) => rem as ServerIdx,
            None => (fnv1a_64(key) % self.nservers as u64) as ServerIdx,
        }
    }

    /// Replica group of a shard: the shard's own index followed by the next
    /// `nreplicas - 1` servers in circular order. Index 0 is the primary.
    pub fn group_of_shard(&self, shard: ServerIdx) -> Vec<ServerIdx> {
        let nservers = self.nservers as u16;
        (0..self.nreplicas as u16)
            .map(|i| ((shard as u16 + i) % nservers) as ServerIdx)
            .collect()
    }

    /// Replica group responsible for a key.
    #[inline]
    pub fn replica_group(&self, key: &str) -> Vec<ServerIdx> {
        self.group_of_shard(self.shard_of(key))
    }

    /// Primary server of a key, which is always its shard index.
    #[inline]
    pub fn primary_of(&self, key: &str) -> ServerIdx {
        self.shard_of(key)
    }

    /// Whether the given server belongs to the key's replica group.
    pub fn in_group(&self, key: &str, server: ServerIdx) -> bool {
        let shard = self.shard_of(key) as u16;
        let offset = (server as u16 + self.nservers as u16 - shard)
            % self.nservers as u16;
        (server as u16) < self.nservers as u16
            && offset < self.nreplicas as u16
    }
}
