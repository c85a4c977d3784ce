//! Participant aggregation over a market's Prediction accounts.

use std::collections::HashSet;

use crate::onchain::types::{Market, Position, Pubkey, MAX_OPTIONS};

/// Number of distinct owners across `positions`. A user staking on several
/// options of the same market counts once.
pub fn count_distinct_holders<'a, I>(positions: I) -> usize
where
    I: IntoIterator<Item = &'a Position>,
{
    positions
        .into_iter()
        .map(|p| p.owner)
        .collect::<HashSet<Pubkey>>()
        .len()
}

/// Per-market rollup of positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolderSummary {
    pub distinct_holders: usize,
    pub positions: usize,
    pub claimed: usize,
    /// Sum of position amounts per option slot.
    pub staked_per_option: [u64; MAX_OPTIONS],
    /// Positions skipped because they reference another market or an option
    /// the market does not have.
    pub ignored: usize,
}

impl HolderSummary {
    pub fn total_staked(&self) -> u64 {
        self.staked_per_option
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(*s))
    }
}

/// Summarize the positions that belong to `market`.
pub fn summarize(market: &Market, positions: &[Position]) -> HolderSummary {
    let mut summary = HolderSummary::default();
    let relevant: Vec<&Position> = positions
        .iter()
        .filter(|p| {
            let ok = p.market == market.address && p.option_index < market.option_count;
            if !ok {
                summary.ignored += 1;
            }
            ok
        })
        .collect();

    for p in &relevant {
        let slot = &mut summary.staked_per_option[p.option_index as usize];
        *slot = slot.saturating_add(p.amount);
        if p.claimed {
            summary.claimed += 1;
        }
    }
    summary.positions = relevant.len();
    summary.distinct_holders = count_distinct_holders(relevant.iter().copied());
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{key, sample_market, sample_position};

    #[test]
    fn test_distinct_holders_counts_owner_once() {
        let market = key(1);
        let a = key(10);
        let b = key(11);
        let positions = vec![
            sample_position(market, a, 0, 10),
            sample_position(market, a, 1, 5),
            sample_position(market, b, 0, 3),
        ];
        assert_eq!(count_distinct_holders(&positions), 2);
    }

    #[test]
    fn test_distinct_holders_order_independent() {
        let market = key(1);
        let mut positions = vec![
            sample_position(market, key(10), 0, 10),
            sample_position(market, key(11), 1, 5),
            sample_position(market, key(10), 1, 3),
            sample_position(market, key(12), 0, 1),
        ];
        let forward = count_distinct_holders(&positions);
        positions.reverse();
        assert_eq!(count_distinct_holders(&positions), forward);
        assert_eq!(forward, 3);
        assert_eq!(count_distinct_holders(Vec::<Position>::new().iter()), 0);
    }

    #[test]
    fn test_summarize_ignores_foreign_positions() {
        let market = sample_market(1);
        let mut claimed = sample_position(market.address, key(11), 1, 40);
        claimed.claimed = true;
        let positions = vec![
            sample_position(market.address, key(10), 0, 60),
            claimed,
            sample_position(key(2), key(12), 0, 99),
            sample_position(market.address, key(13), 3, 7),
        ];

        let summary = summarize(&market, &positions);
        assert_eq!(summary.distinct_holders, 2);
        assert_eq!(summary.positions, 2);
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.ignored, 2);
        assert_eq!(summary.staked_per_option, [60, 40, 0, 0]);
        assert_eq!(summary.total_staked(), market.total_pool);
    }
}
