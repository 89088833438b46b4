//! The immutable description of a merged change, and `Pick-to:` footer parsing.

use serde::{Deserialize, Serialize};

use super::ids::{Branch, ChangeId, ChangeKey, RevisionId};

/// Everything the engine needs to know about a change that merged.
///
/// A `MergeEvent` is never mutated after ingestion; it is persisted verbatim
/// inside the run's `ProcessingRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub project: String,

    /// The branch the change merged on.
    pub branch: Branch,

    /// The change's Change-Id footer value.
    pub change_id: ChangeId,

    /// The review system's numeric change number.
    pub number: u64,

    pub subject: String,

    pub url: String,

    /// The change owner (notification target for failures).
    pub owner: String,

    /// Full commit message, including trailers.
    pub commit_message: String,

    /// The revision that merged.
    pub revision: RevisionId,

    /// Who uploaded the merged revision.
    pub uploader: String,
}

impl MergeEvent {
    /// Fully-qualified key of the merged change.
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.project.clone(), self.branch.clone(), self.change_id.clone())
    }

    /// Branches named in the commit message's `Pick-to:` footer.
    pub fn pick_targets(&self) -> Vec<Branch> {
        parse_pick_to(&self.commit_message)
    }

}

/// Parses the `Pick-to:` trailer out of a commit message.
///
/// The footer lives in the last paragraph of the message alongside the other
/// trailers (`Change-Id:`, `Reviewed-by:`, ...). Multiple `Pick-to:` lines
/// accumulate; branch names on one line are whitespace-separated. Order of
/// first appearance is preserved and duplicates are dropped.
pub fn parse_pick_to(commit_message: &str) -> Vec<Branch> {
    let footer = last_paragraph(commit_message);

    let mut seen = Vec::new();
    for line in footer.lines() {
        let Some(rest) = line.trim().strip_prefix("Pick-to:") else {
            continue;
        };
        for name in rest.split_whitespace() {
            let branch = Branch::new(name);
            if !seen.contains(&branch) {
                seen.push(branch);
            }
        }
    }
    seen
}

/// Returns the last non-empty paragraph of a commit message.
fn last_paragraph(message: &str) -> &str {
    message
        .trim_end()
        .rsplit("\n\n")
        .next()
        .unwrap_or(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches(names: &[&str]) -> Vec<Branch> {
        names.iter().map(|n| Branch::new(*n)).collect()
    }

    #[test]
    fn parses_single_footer_line() {
        let msg = "Fix the frobnicator\n\nLong description here.\n\nPick-to: 6.5 6.2\nChange-Id: Iabc";
        assert_eq!(parse_pick_to(msg), branches(&["6.5", "6.2"]));
    }

    #[test]
    fn accumulates_multiple_footer_lines() {
        let msg = "Subject\n\nPick-to: 6.5\nPick-to: 6.2 5.15\nChange-Id: Iabc";
        assert_eq!(parse_pick_to(msg), branches(&["6.5", "6.2", "5.15"]));
    }

    #[test]
    fn drops_duplicate_targets() {
        let msg = "Subject\n\nPick-to: 6.5 6.5 6.2\nChange-Id: Iabc";
        assert_eq!(parse_pick_to(msg), branches(&["6.5", "6.2"]));
    }

    #[test]
    fn ignores_pick_to_outside_the_footer() {
        // A mention in the body must not be treated as a trailer.
        let msg = "Subject\n\nWe should Pick-to: 6.5 eventually.\n\nChange-Id: Iabc";
        assert!(parse_pick_to(msg).is_empty());
    }

    #[test]
    fn no_footer_means_no_targets() {
        assert!(parse_pick_to("Subject\n\nChange-Id: Iabc").is_empty());
        assert!(parse_pick_to("").is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parsed_targets_are_unique(
                names in proptest::collection::vec("[0-9]\\.[0-9]{1,2}", 0..6)
            ) {
                let msg = format!("Subject\n\nPick-to: {}\nChange-Id: I0", names.join(" "));
                let targets = parse_pick_to(&msg);
                let unique: std::collections::HashSet<_> = targets.iter().collect();
                prop_assert_eq!(unique.len(), targets.len());
            }
        }
    }
}
