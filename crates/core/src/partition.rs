use std::path::PathBuf;

use crate::scan::FileEntry;

/// Files assigned to one transfer task.
pub type Group = Vec<PathBuf>;

/// Splits `entries` into `group_count` groups of roughly equal total size.
///
/// Greedy longest-processing-time-first: entries are taken largest first and each one goes to
/// the group with the smallest running total (lowest index on ties). Every entry lands in exactly
/// one group; groups may be empty when there are fewer entries than groups.
pub fn split_by_capacity(entries: &[FileEntry], group_count: usize) -> Vec<Group> {
    let group_count = group_count.max(1);
    let mut groups: Vec<Group> = vec![Vec::new(); group_count];
    let mut totals = vec![0u64; group_count];

    let mut sorted: Vec<&FileEntry> = entries.iter().collect();
    // Stable sort keeps enumeration order among equal sizes.
    sorted.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

    for entry in sorted {
        let idx = lightest_group(&totals);
        groups[idx].push(entry.path.clone());
        totals[idx] += entry.size_bytes;
    }

    groups
}

fn lightest_group(totals: &[u64]) -> usize {
    let mut best = 0;
    for (idx, total) in totals.iter().enumerate().skip(1) {
        if *total < totals[best] {
            best = idx;
        }
    }
    best
}
