use crate::config::{ShardRange, ShardingMode};
use crate::handler::GatewayInfo;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

/// Shard owning a guild: `(guild_id >> 22) % total`.
pub fn shard_for_guild(guild_id: u64, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    ((guild_id >> 22) % u64::from(total)) as u32
}

/// `[min, max]` of the shards owning `guild_ids`, or `None` for no guilds.
pub fn guild_shard_range(guild_ids: &[u64], total: u32) -> Option<RangeInclusive<u32>> {
    let mut ids = guild_ids.iter().map(|&guild| shard_for_guild(guild, total));
    let first = ids.next()?;
    let (min, max) = ids.fold((first, first), |(min, max), id| (min.min(id), max.max(id)));
    Some(min..=max)
}

/// Group shard ids by `id % max_concurrency`.
///
/// Ids are deduplicated and every bucket is ascending. A concurrency of 0 is
/// treated as 1. Only buckets that hold an id exist.
pub fn bucketize(ids: impl IntoIterator<Item = u32>, max_concurrency: u32) -> Vec<Vec<u32>> {
    let concurrency = max_concurrency.max(1);
    let ids: BTreeSet<u32> = ids.into_iter().collect();
    let mut buckets: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for id in ids {
        buckets.entry(id % concurrency).or_default().push(id);
    }
    buckets.into_values().collect()
}

/// Shards to start, before bucketing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPlan {
    /// One connection without a shard descriptor
    Unsharded,
    /// Ids `range` out of `total`
    Sharded {
        total: u32,
        range: RangeInclusive<u32>,
        max_concurrency: u32,
    },
}

impl ShardPlan {
    /// Decide which shards to run.
    ///
    /// `guild_ids` is only consulted by modes that derive their range from the
    /// current user's guilds; it is `None` when it was never fetched.
    pub fn resolve(mode: &ShardingMode, info: &GatewayInfo, guild_ids: Option<&[u64]>) -> Self {
        let (total, range) = match *mode {
            ShardingMode::Disabled => return ShardPlan::Unsharded,
            ShardingMode::Auto => (info.shards.max(1), ShardRange::GuildDerived),
            ShardingMode::Manual { total, range } => (total.max(1), range),
        };

        let range = match range {
            ShardRange::All => 0..=total - 1,
            ShardRange::Explicit { first, last } => first..=last,
            ShardRange::GuildDerived => guild_ids
                .and_then(|ids| guild_shard_range(ids, total))
                .unwrap_or(0..=total - 1),
        };

        ShardPlan::Sharded {
            total,
            range,
            max_concurrency: info.max_concurrency,
        }
    }

    /// Whether resolving this mode needs the current user's guild ids
    pub fn needs_guilds(mode: &ShardingMode) -> bool {
        matches!(
            mode,
            ShardingMode::Auto
                | ShardingMode::Manual {
                    range: ShardRange::GuildDerived,
                    ..
                }
        )
    }

    /// Identify pipelines, one per non-empty bucket.
    pub fn buckets(&self) -> Vec<Vec<u32>> {
        match self {
            ShardPlan::Unsharded => vec![vec![0]],
            ShardPlan::Sharded {
                range,
                max_concurrency,
                ..
            } => bucketize(range.clone(), *max_concurrency),
        }
    }

    /// Total shard count sent with every Identify, `None` when unsharded.
    pub fn total(&self) -> Option<u32> {
        match self {
            ShardPlan::Unsharded => None,
            ShardPlan::Sharded { total, .. } => Some(*total),
        }
    }
}
