use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::commit::{CommitMeta, CommitState, CommitStore, RefStore};
use crate::event::Event;
use crate::filter::{parse_update, UpdateOp, UpdateSpec};
use crate::wal::EventLog;
use crate::ParqueError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorResult {
    pub ancestor: Option<String>,
    pub commits_traversed: usize,
    pub depth_from_a: usize,
    pub depth_from_b: usize,
}

/// Bidirectional BFS over the parent DAG. Identical inputs return
/// themselves with zero traversal; disjoint histories return no ancestor.
pub async fn find_common_ancestor(
    store: &CommitStore,
    a: &str,
    b: &str,
) -> Result<AncestorResult, ParqueError> {
    if a == b {
        return Ok(AncestorResult {
            ancestor: Some(a.to_string()),
            commits_traversed: 0,
            depth_from_a: 0,
            depth_from_b: 0,
        });
    }

    let mut depth_a: HashMap<String, usize> = HashMap::from([(a.to_string(), 0)]);
    let mut depth_b: HashMap<String, usize> = HashMap::from([(b.to_string(), 0)]);
    let mut queue_a: VecDeque<String> = VecDeque::from([a.to_string()]);
    let mut queue_b: VecDeque<String> = VecDeque::from([b.to_string()]);
    let mut traversed = 0;

    while !queue_a.is_empty() || !queue_b.is_empty() {
        if let Some(found) = expand_frontier(store, &mut queue_a, &mut depth_a, &depth_b, &mut traversed).await? {
            return Ok(AncestorResult {
                depth_from_a: depth_a[&found],
                depth_from_b: depth_b[&found],
                ancestor: Some(found),
                commits_traversed: traversed,
            });
        }
        if let Some(found) = expand_frontier(store, &mut queue_b, &mut depth_b, &depth_a, &mut traversed).await? {
            return Ok(AncestorResult {
                depth_from_a: depth_a[&found],
                depth_from_b: depth_b[&found],
                ancestor: Some(found),
                commits_traversed: traversed,
            });
        }
    }

    Ok(AncestorResult {
        ancestor: None,
        commits_traversed: traversed,
        depth_from_a: 0,
        depth_from_b: 0,
    })
}

async fn expand_frontier(
    store: &CommitStore,
    queue: &mut VecDeque<String>,
    own_depths: &mut HashMap<String, usize>,
    other_depths: &HashMap<String, usize>,
    traversed: &mut usize,
) -> Result<Option<String>, ParqueError> {
    let Some(hash) = queue.pop_front() else {
        return Ok(None);
    };
    if other_depths.contains_key(&hash) {
        return Ok(Some(hash));
    }

    let commit = store.read_commit(&hash).await?;
    *traversed += 1;
    let depth = own_depths[&hash];
    for parent in commit.parents {
        if !own_depths.contains_key(&parent) {
            own_depths.insert(parent.clone(), depth + 1);
            if other_depths.contains_key(&parent) {
                queue.push_front(parent);
            } else {
                queue.push_back(parent);
            }
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Surface conflicts to the caller.
    Manual,
    Ours,
    Theirs,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub dry_run: bool,
    pub auto_merge_commutative: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Manual,
            dry_run: false,
            auto_merge_commutative: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub ns: String,
    pub target: String,
    pub ours: Vec<Event>,
    pub theirs: Vec<Event>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub from_ours: usize,
    pub from_theirs: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMergeResult {
    pub merged_events: Vec<Event>,
    pub conflicts: Vec<MergeConflict>,
    /// Entity targets whose concurrent updates composed automatically.
    pub auto_merged: Vec<String>,
    /// Entity targets resolved by an ours/theirs strategy.
    pub resolved: Vec<String>,
    pub stats: MergeStats,
    pub success: bool,
}

/// Merges two divergent event histories for one namespace.
///
/// - Entities touched on only one side are accepted as-is.
/// - Entities touched on both sides compose when every update on both
///   sides is commutative (`$inc` on disjoint fields, `$addToSet`,
///   `$push`) and auto-merge is enabled.
/// - Everything else conflicts unless an ours/theirs strategy resolves it.
pub fn merge_events(
    ns: &str,
    ours: &[Event],
    theirs: &[Event],
    options: &MergeOptions,
) -> EventMergeResult {
    let mut result = EventMergeResult::default();
    let targets: BTreeSet<String> = ours
        .iter()
        .chain(theirs.iter())
        .map(|event| event.target.clone())
        .collect();

    for target in targets {
        let our_events: Vec<Event> = ours.iter().filter(|e| e.target == target).cloned().collect();
        let their_events: Vec<Event> =
            theirs.iter().filter(|e| e.target == target).cloned().collect();

        match (our_events.is_empty(), their_events.is_empty()) {
            (false, true) => {
                result.stats.from_ours += our_events.len();
                result.merged_events.extend(our_events);
            }
            (true, false) => {
                result.stats.from_theirs += their_events.len();
                result.merged_events.extend(their_events);
            }
            (false, false) => {
                if options.auto_merge_commutative
                    && sides_commute(&our_events, &their_events)
                {
                    result.stats.from_ours += our_events.len();
                    result.stats.from_theirs += their_events.len();
                    result.merged_events.extend(our_events);
                    result.merged_events.extend(their_events);
                    result.auto_merged.push(target);
                    continue;
                }
                match options.strategy {
                    MergeStrategy::Ours => {
                        result.stats.from_ours += our_events.len();
                        result.merged_events.extend(our_events);
                        result.resolved.push(target);
                    }
                    MergeStrategy::Theirs => {
                        result.stats.from_theirs += their_events.len();
                        result.merged_events.extend(their_events);
                        result.resolved.push(target);
                    }
                    MergeStrategy::Manual => {
                        result.conflicts.push(MergeConflict {
                            ns: ns.to_string(),
                            target,
                            ours: our_events,
                            theirs: their_events,
                        });
                    }
                }
            }
            (true, true) => {}
        }
    }

    result
        .merged_events
        .sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
    result.success = result.conflicts.is_empty();
    result
}

/// Both sides commute when every event carries a commutative update spec
/// and the `$inc` fields across the sides are disjoint.
fn sides_commute(ours: &[Event], theirs: &[Event]) -> bool {
    let Some(our_specs) = update_specs(ours) else {
        return false;
    };
    let Some(their_specs) = update_specs(theirs) else {
        return false;
    };

    let our_inc = inc_fields(&our_specs);
    let their_inc = inc_fields(&their_specs);
    our_inc.is_disjoint(&their_inc)
}

/// The update specs attached to a side's events, or None when any event
/// lacks one or carries a non-commutative operator.
fn update_specs(events: &[Event]) -> Option<Vec<UpdateSpec>> {
    let mut specs = Vec::with_capacity(events.len());
    for event in events {
        let update = event
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("update"))?;
        let spec = parse_update(update).ok()?;
        if !spec.is_commutative() {
            return None;
        }
        specs.push(spec);
    }
    Some(specs)
}

fn inc_fields(specs: &[UpdateSpec]) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    for spec in specs {
        for op in &spec.ops {
            if let UpdateOp::Inc(map) = op {
                fields.extend(map.keys().cloned());
            }
        }
    }
    fields
}

#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub source_commit: String,
    pub target_commit: String,
    pub ancestor: String,
    pub namespaces: BTreeMap<String, EventMergeResult>,
    pub merge_commit: Option<String>,
    pub success: bool,
}

/// Three-way branch merge: resolve refs, find the common ancestor, diff
/// event histories per namespace, merge, and (unless dry-run) create the
/// merge commit and advance the target ref.
pub struct MergeEngine {
    commits: Arc<CommitStore>,
    refs: Arc<RefStore>,
    wal: Arc<EventLog>,
}

impl MergeEngine {
    pub fn new(commits: Arc<CommitStore>, refs: Arc<RefStore>, wal: Arc<EventLog>) -> Self {
        Self { commits, refs, wal }
    }

    pub async fn merge_branches(
        &self,
        source: &str,
        target: &str,
        options: &MergeOptions,
    ) -> Result<MergePlan, ParqueError> {
        let source_hash = self
            .refs
            .resolve_ref(source)
            .await?
            .ok_or_else(|| ParqueError::not_found(format!("ref {source}")))?;
        let target_hash = self
            .refs
            .resolve_ref(target)
            .await?
            .ok_or_else(|| ParqueError::not_found(format!("ref {target}")))?;

        let ancestor = find_common_ancestor(&self.commits, &source_hash, &target_hash).await?;
        let Some(ancestor_hash) = ancestor.ancestor else {
            return Err(ParqueError::invariant(format!(
                "{source} and {target} share no history"
            )));
        };

        let ancestor_commit = self.commits.read_commit(&ancestor_hash).await?;
        let source_commit = self.commits.read_commit(&source_hash).await?;
        let target_commit = self.commits.read_commit(&target_hash).await?;

        let namespaces: BTreeSet<String> = source_commit
            .state
            .namespace_positions
            .keys()
            .chain(target_commit.state.namespace_positions.keys())
            .cloned()
            .collect();

        let mut plan = MergePlan {
            source_commit: source_hash.clone(),
            target_commit: target_hash.clone(),
            ancestor: ancestor_hash,
            namespaces: BTreeMap::new(),
            merge_commit: None,
            success: true,
        };

        for ns in namespaces {
            let base = position(&ancestor_commit.state, &ns);
            let ours_to = position(&target_commit.state, &ns);
            let theirs_to = position(&source_commit.state, &ns);

            let events = self.wal.read_from(&ns, base + 1).await?;
            let shared_to = ours_to.min(theirs_to);
            let ours: Vec<Event> = events
                .iter()
                .filter(|event| event.seq > shared_to && event.seq <= ours_to)
                .cloned()
                .collect();
            let theirs: Vec<Event> = events
                .iter()
                .filter(|event| event.seq > shared_to && event.seq <= theirs_to)
                .cloned()
                .collect();

            let merged = merge_events(&ns, &ours, &theirs, options);
            plan.success &= merged.success;
            plan.namespaces.insert(ns, merged);
        }

        if options.dry_run || !plan.success {
            return Ok(plan);
        }

        let mut state = target_commit.state.clone();
        for (ns, merged) in &plan.namespaces {
            let top = merged
                .merged_events
                .iter()
                .map(|event| event.seq)
                .max()
                .unwrap_or(0);
            let entry = state.namespace_positions.entry(ns.clone()).or_insert(0);
            *entry = (*entry).max(top).max(position(&source_commit.state, ns));
        }

        let commit = self
            .commits
            .create_commit(
                state,
                CommitMeta {
                    message: format!("merge {source} into {target}"),
                    author: None,
                    parents: vec![target_hash, source_hash],
                    timestamp: None,
                },
            )
            .await?;

        // HEAD tracks the branch name, so advancing the target ref also
        // moves a HEAD checked out on it.
        self.refs.update_ref(target, &commit.hash).await?;
        plan.merge_commit = Some(commit.hash);
        Ok(plan)
    }
}

fn position(state: &CommitState, ns: &str) -> u64 {
    state.namespace_positions.get(ns).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{merge_events, MergeOptions, MergeStrategy};
    use crate::event::{Event, EventOp};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn update_event(id: &str, seq: u64, target: &str, update: serde_json::Value) -> Event {
        Event {
            id: id.to_string(),
            seq,
            ts: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, seq as u32 % 60).unwrap(),
            op: EventOp::Update,
            target: target.to_string(),
            before: None,
            after: None,
            actor: "tester".to_string(),
            metadata: Some(json!({"update": update})),
        }
    }

    #[test]
    fn one_sided_changes_are_accepted() {
        let ours = vec![update_event("o1", 2, "posts:a", json!({"$set": {"x": 1}}))];
        let theirs = vec![update_event("t1", 3, "posts:b", json!({"$set": {"y": 2}}))];

        let result = merge_events("posts", &ours, &theirs, &MergeOptions::default());
        assert!(result.success);
        assert_eq!(result.merged_events.len(), 2);
        assert_eq!(result.stats.from_ours, 1);
        assert_eq!(result.stats.from_theirs, 1);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn disjoint_incs_compose_automatically() {
        let ours = vec![update_event("o1", 2, "posts:a", json!({"$inc": {"views": 1}}))];
        let theirs = vec![update_event("t1", 3, "posts:a", json!({"$inc": {"likes": 5}}))];

        let result = merge_events("posts", &ours, &theirs, &MergeOptions::default());
        assert!(result.success);
        assert_eq!(result.auto_merged, vec!["posts:a".to_string()]);
        assert_eq!(result.merged_events.len(), 2);
    }

    #[test]
    fn overlapping_incs_conflict_under_manual_strategy() {
        let ours = vec![update_event("o1", 2, "posts:a", json!({"$inc": {"views": 1}}))];
        let theirs = vec![update_event("t1", 3, "posts:a", json!({"$inc": {"views": 2}}))];

        let result = merge_events("posts", &ours, &theirs, &MergeOptions::default());
        assert!(!result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].target, "posts:a");
    }

    #[test]
    fn add_to_set_composes_without_disjointness() {
        let ours = vec![update_event(
            "o1",
            2,
            "posts:a",
            json!({"$addToSet": {"tags": "x"}}),
        )];
        let theirs = vec![update_event(
            "t1",
            3,
            "posts:a",
            json!({"$addToSet": {"tags": "y"}}),
        )];

        let result = merge_events("posts", &ours, &theirs, &MergeOptions::default());
        assert!(result.success);
        assert_eq!(result.auto_merged.len(), 1);
    }

    #[test]
    fn set_conflicts_resolve_by_strategy() {
        let ours = vec![update_event("o1", 2, "posts:a", json!({"$set": {"x": 1}}))];
        let theirs = vec![update_event("t1", 3, "posts:a", json!({"$set": {"x": 2}}))];

        let take_ours = merge_events(
            "posts",
            &ours,
            &theirs,
            &MergeOptions {
                strategy: MergeStrategy::Ours,
                ..MergeOptions::default()
            },
        );
        assert!(take_ours.success);
        assert_eq!(take_ours.resolved, vec!["posts:a".to_string()]);
        assert_eq!(take_ours.merged_events.len(), 1);
        assert_eq!(take_ours.merged_events[0].id, "o1");

        let take_theirs = merge_events(
            "posts",
            &ours,
            &theirs,
            &MergeOptions {
                strategy: MergeStrategy::Theirs,
                ..MergeOptions::default()
            },
        );
        assert_eq!(take_theirs.merged_events[0].id, "t1");
    }

    #[test]
    fn auto_merge_disabled_turns_commutative_pairs_into_conflicts() {
        let ours = vec![update_event("o1", 2, "posts:a", json!({"$inc": {"views": 1}}))];
        let theirs = vec![update_event("t1", 3, "posts:a", json!({"$inc": {"likes": 1}}))];

        let result = merge_events(
            "posts",
            &ours,
            &theirs,
            &MergeOptions {
                auto_merge_commutative: false,
                ..MergeOptions::default()
            },
        );
        assert!(!result.success);
    }

    #[test]
    fn events_without_update_specs_conflict() {
        let mut ours = vec![update_event("o1", 2, "posts:a", json!({"$inc": {"v": 1}}))];
        ours[0].metadata = None;
        let theirs = vec![update_event("t1", 3, "posts:a", json!({"$inc": {"w": 1}}))];

        let result = merge_events("posts", &ours, &theirs, &MergeOptions::default());
        assert!(!result.success);
    }
}
