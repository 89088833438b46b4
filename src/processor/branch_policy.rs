//! Branch-ordering policy for the release "waterfall".
//!
//! Release branches are numeric (`X.Y` or `X.Y.Z`) and flow upward into
//! `master` and then `dev`; a pick travels from a newer branch down to older
//! ones. The ordering is used only for advisory gap detection (a change
//! picked to `6.2` but not `6.5` probably forgot an intermediate), never to
//! block processing. A branch name that does not match the expected shapes
//! has no position in the waterfall: it is passed through unordered and never
//! reported as a gap.

use std::cmp::Ordering;

use crate::types::Branch;

/// Position of a branch in the waterfall. `Numeric` sorts by version
/// components; `master` sits above every release branch and `dev` above
/// `master`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Numeric(Vec<u64>),
    Master,
    Dev,
}

/// Parses a branch name into its waterfall rank, or `None` for names outside
/// the expected shapes.
pub fn rank(branch: &Branch) -> Option<Rank> {
    match branch.as_str() {
        "dev" => Some(Rank::Dev),
        "master" => Some(Rank::Master),
        name => {
            let parts: Vec<&str> = name.split('.').collect();
            if !(2..=3).contains(&parts.len()) {
                return None;
            }
            let components = parts
                .iter()
                .map(|p| {
                    if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                        None
                    } else {
                        p.parse::<u64>().ok()
                    }
                })
                .collect::<Option<Vec<u64>>>()?;
            Some(Rank::Numeric(components))
        }
    }
}

/// Compares two branches in waterfall order. `None` when either has no rank.
pub fn compare(a: &Branch, b: &Branch) -> Option<Ordering> {
    Some(rank(a)?.cmp(&rank(b)?))
}

/// Advisory gap detection: branches the parent change reaches that lie
/// strictly between `source` and `target` in waterfall order, but that the
/// child change does not target itself. Unordered branch names never appear.
pub fn missing_intermediates(
    source: &Branch,
    target: &Branch,
    parent_reach: &[Branch],
    own_targets: &[Branch],
) -> Vec<Branch> {
    let (Some(source_rank), Some(target_rank)) = (rank(source), rank(target)) else {
        return Vec::new();
    };
    parent_reach
        .iter()
        .filter(|candidate| !own_targets.contains(candidate) && *candidate != source)
        .filter(|candidate| {
            rank(candidate).is_some_and(|r| r > target_rank && r < source_rank)
        })
        .cloned()
        .collect()
}
