//! Fragment segmentation: ordered records → token-budget-respecting fragments.
//!
//! Records are walked in source order and grouped by a caller-supplied key
//! (e.g. parent-product identifier). Whole groups pack greedily into
//! fragments under the per-request ceiling; a group that cannot fit even
//! alone is split at record boundaries as a fallback, with the resulting
//! fragments flagged `context_incomplete` so downstream QA can discount
//! confidence.

use tracing::{debug, info, warn};

use fieldsmith_shared::{BudgetConfig, FieldsmithError, Fragment, Record, RejectedRecord};

/// Result of segmenting one record sequence.
#[derive(Debug)]
pub struct SegmentOutcome {
    /// Fragments in global processing order.
    pub fragments: Vec<Fragment>,
    /// Records rejected because they can never be submitted.
    pub rejected: Vec<RejectedRecord>,
}

/// Accumulates records into the fragment currently being built.
#[derive(Default)]
struct FragmentDraft {
    records: Vec<Record>,
    weight: u64,
    context_incomplete: bool,
}

impl FragmentDraft {
    fn close_into(&mut self, fragments: &mut Vec<Fragment>) {
        if self.records.is_empty() {
            return;
        }
        let draft = std::mem::take(self);
        fragments.push(Fragment {
            index: fragments.len(),
            records: draft.records,
            weight: draft.weight,
            context_incomplete: draft.context_incomplete,
        });
    }

    fn push(&mut self, record: Record) {
        self.weight += record.weight;
        self.records.push(record);
    }
}

/// Segment an ordered record sequence into fragments.
///
/// `key_fn` supplies the grouping key; consecutive records sharing a key
/// form one group and are kept together whenever the budget allows.
/// Output preserves the relative order of the source records.
pub fn segment<F>(records: &[Record], key_fn: F, budget: &BudgetConfig) -> SegmentOutcome
where
    F: Fn(&Record) -> &str,
{
    let ceiling = budget.per_request_ceiling;
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut rejected: Vec<RejectedRecord> = Vec::new();
    let mut current = FragmentDraft::default();

    for group in consecutive_groups(records, &key_fn) {
        // Records that can never be submitted within any window are
        // reported and skipped, never silently truncated.
        let mut group: Vec<&Record> = group
            .iter()
            .filter(|r| {
                if r.weight > budget.window_ceiling {
                    warn!(id = %r.id, weight = r.weight, "record exceeds window ceiling, rejecting");
                    rejected.push(RejectedRecord {
                        id: r.id.clone(),
                        reason: FieldsmithError::RecordTooLarge {
                            id: r.id.to_string(),
                            weight: r.weight,
                            ceiling: budget.window_ceiling,
                        }
                        .to_string(),
                    });
                    false
                } else {
                    true
                }
            })
            .copied()
            .collect();

        if group.is_empty() {
            continue;
        }

        let group_weight: u64 = group.iter().map(|r| r.weight).sum();

        if group_weight <= ceiling {
            // Whole group fits: pack into the current fragment or start fresh.
            if current.weight + group_weight > ceiling {
                current.close_into(&mut fragments);
            }
            for record in group.drain(..) {
                current.push(record.clone());
            }
        } else {
            // Fallback: split the group at record boundaries only, flagging
            // every resulting fragment as context-incomplete.
            debug!(
                key = key_fn(group[0]),
                weight = group_weight,
                "group exceeds per-request ceiling, splitting at record boundaries"
            );
            current.close_into(&mut fragments);

            let mut split = FragmentDraft {
                context_incomplete: true,
                ..Default::default()
            };
            for record in group.drain(..) {
                if !split.records.is_empty() && split.weight + record.weight > ceiling {
                    split.close_into(&mut fragments);
                    split.context_incomplete = true;
                }
                split.push(record.clone());
            }
            split.close_into(&mut fragments);
        }
    }

    current.close_into(&mut fragments);

    info!(
        records = records.len(),
        fragments = fragments.len(),
        rejected = rejected.len(),
        "segmentation complete"
    );

    SegmentOutcome {
        fragments,
        rejected,
    }
}

/// Split records into maximal runs of consecutive records sharing a key.
fn consecutive_groups<'a, F>(records: &'a [Record], key_fn: &F) -> Vec<Vec<&'a Record>>
where
    F: Fn(&Record) -> &str,
{
    let mut groups: Vec<Vec<&Record>> = Vec::new();
    for record in records {
        match groups.last_mut() {
            Some(group) if key_fn(group[0]) == key_fn(record) => group.push(record),
            _ => groups.push(vec![record]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use fieldsmith_shared::RecordId;

    fn budget(per_request: u64, window: u64) -> BudgetConfig {
        BudgetConfig {
            per_request_ceiling: per_request,
            per_batch_ceiling: window,
            window_ceiling: window,
            window: Duration::from_secs(3600),
            digest_budget: 10,
        }
    }

    fn record(id: &str, group: &str, weight: u64) -> Record {
        Record {
            id: RecordId::new(id),
            group_key: group.into(),
            fields: BTreeMap::new(),
            image_urls: vec![],
            weight,
        }
    }

    fn weights(fragments: &[Fragment]) -> Vec<Vec<u64>> {
        fragments
            .iter()
            .map(|f| f.records.iter().map(|r| r.weight).collect())
            .collect()
    }

    #[test]
    fn greedy_packing_and_oversized_fallback() {
        // Weights 10,10,10,30,10 with ceiling 25 and all distinct keys
        // → [{10,10},{10},{30 flagged},{10}].
        let records = vec![
            record("a", "g1", 10),
            record("b", "g2", 10),
            record("c", "g3", 10),
            record("d", "g4", 30),
            record("e", "g5", 10),
        ];
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(25, 1000));

        assert_eq!(
            weights(&outcome.fragments),
            vec![vec![10, 10], vec![10], vec![30], vec![10]]
        );
        let flags: Vec<bool> = outcome
            .fragments
            .iter()
            .map(|f| f.context_incomplete)
            .collect();
        assert_eq!(flags, vec![false, false, true, false]);
        assert!(outcome.rejected.is_empty());

        // Fragment indexes define global order.
        let indexes: Vec<usize> = outcome.fragments.iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn variant_groups_stay_together() {
        let records = vec![
            record("p1-a", "parent-1", 10),
            record("p1-b", "parent-1", 10),
            record("p2-a", "parent-2", 10),
            record("p2-b", "parent-2", 10),
        ];
        // Both groups fit individually but not together.
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(25, 1000));

        assert_eq!(outcome.fragments.len(), 2);
        let ids: Vec<&str> = outcome.fragments[0]
            .records
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p1-a", "p1-b"]);
    }

    #[test]
    fn oversized_group_splits_at_record_boundaries() {
        let records = vec![
            record("v1", "parent-1", 10),
            record("v2", "parent-1", 10),
            record("v3", "parent-1", 10),
        ];
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(25, 1000));

        assert_eq!(weights(&outcome.fragments), vec![vec![10, 10], vec![10]]);
        assert!(outcome.fragments.iter().all(|f| f.context_incomplete));
    }

    #[test]
    fn fragments_respect_ceiling_unless_flagged() {
        let records = vec![
            record("a", "g1", 12),
            record("b", "g1", 12),
            record("c", "g2", 40),
            record("d", "g3", 5),
        ];
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(25, 1000));

        for fragment in &outcome.fragments {
            assert!(
                fragment.weight <= 25 || fragment.context_incomplete,
                "unflagged fragment over ceiling: {fragment:?}"
            );
        }
    }

    #[test]
    fn record_over_window_ceiling_is_rejected_not_fragmented() {
        let records = vec![
            record("ok", "g1", 10),
            record("huge", "g2", 2000),
            record("also-ok", "g3", 10),
        ];
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(25, 1000));

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].id, RecordId::new("huge"));
        assert!(outcome.rejected[0].reason.contains("too large"));
        assert_eq!(weights(&outcome.fragments), vec![vec![10, 10]]);
    }

    #[test]
    fn source_order_is_preserved() {
        let records = vec![
            record("a", "g1", 5),
            record("b", "g2", 5),
            record("c", "g1", 5),
            record("d", "g3", 5),
        ];
        let outcome = segment(&records, |r| r.group_key.as_str(), &budget(100, 1000));

        let ids: Vec<&str> = outcome
            .fragments
            .iter()
            .flat_map(|f| f.records.iter().map(|r| r.id.as_str()))
            .collect();
        // "c" shares a key with "a" but is not adjacent, so it starts a new
        // group: relative order is never reshuffled to co-locate keys.
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn empty_input_yields_no_fragments() {
        let outcome = segment(&[], |r: &Record| r.group_key.as_str(), &budget(25, 1000));
        assert!(outcome.fragments.is_empty());
        assert!(outcome.rejected.is_empty());
    }
}
