//! Three-way diff of application metadata, keyed by entry name.

use apiary_core::MetadataEntry;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataOp {
    Create(MetadataEntry),
    /// Carries the remote key of the matched actual entry.
    Update(MetadataEntry),
    Delete { name: String, key: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds + self.updates + self.removes == 0 }
}

/// Desired entries are visited in order; matching is exact and case-sensitive on `name`.
/// Actual entries with no desired counterpart are deleted afterwards.
pub fn plan_metadata(desired: &[MetadataEntry], actual: &[MetadataEntry], skip_unchanged: bool) -> Vec<MetadataOp> {
    let by_name: FxHashMap<&str, &MetadataEntry> = actual.iter().map(|m| (m.name.as_str(), m)).collect();
    let mut ops = Vec::with_capacity(desired.len() + actual.len());
    for want in desired {
        match by_name.get(want.name.as_str()) {
            Some(have) => {
                if skip_unchanged && have.same_content(want) { continue; }
                ops.push(MetadataOp::Update(MetadataEntry { remote_key: have.remote_key.clone(), ..want.clone() }));
            }
            None => ops.push(MetadataOp::Create(MetadataEntry { remote_key: None, ..want.clone() })),
        }
    }
    for have in actual {
        if desired.iter().any(|d| d.name == have.name) { continue; }
        if let Some(key) = &have.remote_key {
            ops.push(MetadataOp::Delete { name: have.name.clone(), key: key.clone() });
        }
    }
    ops
}

pub fn summarize(ops: &[MetadataOp]) -> DiffSummary {
    ops.iter().fold(DiffSummary::default(), |mut s, op| {
        match op {
            MetadataOp::Create(_) => s.adds += 1,
            MetadataOp::Update(_) => s.updates += 1,
            MetadataOp::Delete { .. } => s.removes += 1,
        }
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str, value: &str, key: &str) -> MetadataEntry {
        MetadataEntry { remote_key: Some(key.into()), ..MetadataEntry::new(name, value) }
    }

    #[test]
    fn three_way_diff_issues_one_of_each() {
        let desired = vec![MetadataEntry::new("A", "1"), MetadataEntry::new("B", "2")];
        let actual = vec![remote("A", "0", "k-a"), remote("C", "3", "k-c")];
        let ops = plan_metadata(&desired, &actual, false);
        assert_eq!(
            ops,
            vec![
                MetadataOp::Update(remote("A", "1", "k-a")),
                MetadataOp::Create(MetadataEntry::new("B", "2")),
                MetadataOp::Delete { name: "C".into(), key: "k-c".into() },
            ]
        );
        assert_eq!(summarize(&ops), DiffSummary { adds: 1, updates: 1, removes: 1 });
    }

    #[test]
    fn matching_is_case_sensitive() {
        let ops = plan_metadata(&[MetadataEntry::new("Owner", "x")], &[remote("owner", "x", "k")], false);
        assert_eq!(summarize(&ops), DiffSummary { adds: 1, updates: 0, removes: 1 });
    }

    #[test]
    fn unchanged_entries_can_be_skipped() {
        let actual = vec![remote("A", "1", "k-a")];
        assert_eq!(plan_metadata(&[MetadataEntry::new("A", "1")], &actual, false).len(), 1);
        assert!(plan_metadata(&[MetadataEntry::new("A", "1")], &actual, true).is_empty());
    }
}
