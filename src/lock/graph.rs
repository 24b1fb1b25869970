//! The acquisition-order graph
//!
//! One process-global directed graph over every cycle-detecting lock:
//! an edge `prior -> node` records that some thread acquired `node` while
//! holding `prior`. Before a first-time edge is recorded, a depth-first
//! search over the transitive priors of `prior` looks for the acquiring
//! node; finding it means the new edge would complete a cycle. The first
//! detection of a given `(node, prior)` pair is cached and every later
//! detection of the same pair carries the identical cause object.

use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::{LockOrderError, Policy};

/// Identity of one wrapped lock (a read/write pair shares one node)
pub(crate) struct LockNode {
    pub(crate) id: u64,
    pub(crate) name: String,
    /// `(factory id, ordinal)` for locks with an explicit rank
    pub(crate) rank: Option<(u64, usize)>,
}

impl LockNode {
    pub(crate) fn new(name: impl Into<String>, rank: Option<(u64, usize)>) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            rank,
        })
    }
}

/// A detected lock-order cycle; shared so repeat detections of the same
/// edge pair hand out the same instance
pub struct PotentialDeadlock {
    cycle: String,
    witnesses: Vec<String>,
}

impl PotentialDeadlock {
    /// The human-readable cycle, e.g. `"C -> A, B -> C, A -> B"`
    pub fn cycle(&self) -> &str {
        &self.cycle
    }

    /// Where each edge of the cycle was first observed
    pub fn witnesses(&self) -> &[String] {
        &self.witnesses
    }
}

impl fmt::Display for PotentialDeadlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock order cycle: {}", self.cycle)
    }
}

impl fmt::Debug for PotentialDeadlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PotentialDeadlock")
            .field("cycle", &self.cycle)
            .field("witnesses", &self.witnesses)
            .finish()
    }
}

impl std::error::Error for PotentialDeadlock {}

struct Edge {
    prior: Arc<LockNode>,
    /// The holder stack seen when this edge was first recorded
    witness: String,
}

#[derive(Default)]
struct LockGraph {
    /// node id -> (prior id -> edge)
    edges: HashMap<u64, HashMap<u64, Edge>>,
    /// (node id, prior id) -> first-seen cycle for that pair
    cycles: HashMap<(u64, u64), Arc<PotentialDeadlock>>,
}

impl LockGraph {
    fn is_allowed(&self, node: u64, prior: u64) -> bool {
        self.edges
            .get(&node)
            .is_some_and(|priors| priors.contains_key(&prior))
    }

    /// Depth-first search from `from` over transitive priors, looking for
    /// `target`. Returns the node path `[from, .., target]` when found.
    fn find_path(&self, from: &Arc<LockNode>, target: u64) -> Option<Vec<Arc<LockNode>>> {
        let mut seen = HashSet::new();
        let mut path = vec![Arc::clone(from)];
        if self.dfs(from.id, target, &mut seen, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        at: u64,
        target: u64,
        seen: &mut HashSet<u64>,
        path: &mut Vec<Arc<LockNode>>,
    ) -> bool {
        if !seen.insert(at) {
            return false;
        }
        let Some(priors) = self.edges.get(&at) else {
            return false;
        };
        for edge in priors.values() {
            path.push(Arc::clone(&edge.prior));
            if edge.prior.id == target || self.dfs(edge.prior.id, target, seen, path) {
                return true;
            }
            path.pop();
        }
        false
    }
}

fn graph() -> &'static RwLock<LockGraph> {
    static GRAPH: OnceLock<RwLock<LockGraph>> = OnceLock::new();
    GRAPH.get_or_init(|| RwLock::new(LockGraph::default()))
}

thread_local! {
    /// Nodes the current thread holds, outermost first
    static HELD: RefCell<Vec<Arc<LockNode>>> = const { RefCell::new(Vec::new()) };
}

fn render_cycle(node: &LockNode, prior: &LockNode, path: &[Arc<LockNode>]) -> String {
    // The new edge first, then the existing path walked back toward the
    // acquiring node: each consecutive pair (p, q) is the edge "q -> p".
    let mut segments = vec![format!("{} -> {}", prior.name, node.name)];
    for pair in path.windows(2) {
        segments.push(format!("{} -> {}", pair[1].name, pair[0].name));
    }
    segments.join(", ")
}

fn held_names(held: &[Arc<LockNode>]) -> String {
    let names: Vec<&str> = held.iter().map(|node| node.name.as_str()).collect();
    names.join(", ")
}

/// Observe an imminent first acquisition of `node` under `policy`.
///
/// `Err` means the acquisition must not proceed; nothing has been
/// acquired, so there is nothing to undo.
pub(crate) fn about_to_acquire(node: &Arc<LockNode>, policy: Policy) -> Result<(), LockOrderError> {
    debug_assert!(policy != Policy::Disabled);
    HELD.with(|held| {
        let held = held.borrow();
        if held.iter().any(|h| h.id == node.id) {
            // Reentrant re-entry adds no edges.
            return Ok(());
        }

        // Explicit ranks are checked before the graph: a lower rank after
        // a higher one is a deadlock-in-waiting, two distinct locks of the
        // same rank may not be held together at all.
        if let Some((group, ordinal)) = node.rank {
            for prior in held.iter() {
                let Some((prior_group, prior_ordinal)) = prior.rank else {
                    continue;
                };
                if prior_group != group {
                    continue;
                }
                if prior_ordinal == ordinal {
                    return Err(LockOrderError::ConflictingRank(format!(
                        "acquiring {} while holding {} of the same rank",
                        node.name, prior.name
                    )));
                }
                if prior_ordinal > ordinal {
                    let deadlock = Arc::new(PotentialDeadlock {
                        cycle: format!("{} -> {}", prior.name, node.name),
                        witnesses: vec![format!(
                            "rank order violated while holding [{}]",
                            held_names(&held)
                        )],
                    });
                    match policy {
                        Policy::Throw => {
                            return Err(LockOrderError::PotentialDeadlock(deadlock));
                        }
                        Policy::Warn => {
                            tracing::warn!(target: "kinet::lock", %deadlock, "rank order violation");
                        }
                        Policy::Disabled => {}
                    }
                }
            }
        }

        // Innermost-held first, per the observation contract.
        for prior in held.iter().rev() {
            if prior.id == node.id {
                continue;
            }

            {
                let graph = graph().read();
                if graph.is_allowed(node.id, prior.id) {
                    continue;
                }
                if let Some(cached) = graph.cycles.get(&(node.id, prior.id)) {
                    match policy {
                        Policy::Throw => {
                            return Err(LockOrderError::PotentialDeadlock(Arc::clone(cached)));
                        }
                        Policy::Warn => {
                            tracing::warn!(target: "kinet::lock", deadlock = %cached, "repeat lock order cycle");
                            continue;
                        }
                        Policy::Disabled => continue,
                    }
                }
            }

            let mut graph = graph().write();
            // Re-check under the write lock; another thread may have
            // recorded this edge or this cycle meanwhile.
            if graph.is_allowed(node.id, prior.id) {
                continue;
            }
            if let Some(cached) = graph.cycles.get(&(node.id, prior.id)).cloned() {
                match policy {
                    Policy::Throw => return Err(LockOrderError::PotentialDeadlock(cached)),
                    Policy::Warn => {
                        tracing::warn!(target: "kinet::lock", deadlock = %cached, "repeat lock order cycle");
                        continue;
                    }
                    Policy::Disabled => continue,
                }
            }

            if let Some(path) = graph.find_path(prior, node.id) {
                // The report carries where this acquisition stood and where
                // each edge of the existing path was first seen.
                let mut witnesses = vec![format!(
                    "acquiring {} while holding [{}]",
                    node.name,
                    held_names(&held)
                )];
                for pair in path.windows(2) {
                    let recorded = graph
                        .edges
                        .get(&pair[0].id)
                        .and_then(|priors| priors.get(&pair[1].id));
                    if let Some(edge) = recorded {
                        witnesses.push(edge.witness.clone());
                    }
                }
                let deadlock = Arc::new(PotentialDeadlock {
                    cycle: render_cycle(node, prior, &path),
                    witnesses,
                });
                graph
                    .cycles
                    .insert((node.id, prior.id), Arc::clone(&deadlock));
                match policy {
                    Policy::Throw => {
                        return Err(LockOrderError::PotentialDeadlock(deadlock));
                    }
                    Policy::Warn => {
                        tracing::warn!(target: "kinet::lock", %deadlock, "lock order cycle");
                        continue;
                    }
                    Policy::Disabled => continue,
                }
            }

            graph.edges.entry(node.id).or_default().insert(
                prior.id,
                Edge {
                    prior: Arc::clone(prior),
                    witness: format!(
                        "first acquired {} while holding [{}]",
                        node.name,
                        held_names(&held)
                    ),
                },
            );
        }
        Ok(())
    })
}

/// The witness recorded for an allowed edge, if present
#[cfg(test)]
pub(crate) fn edge_witness(node: u64, prior: u64) -> Option<String> {
    graph()
        .read()
        .edges
        .get(&node)
        .and_then(|priors| priors.get(&prior))
        .map(|edge| edge.witness.clone())
}

/// Record that the current thread now holds `node`
pub(crate) fn push_held(node: &Arc<LockNode>) {
    HELD.with(|held| held.borrow_mut().push(Arc::clone(node)));
}

/// Record that the current thread released `node` entirely
pub(crate) fn pop_held(node_id: u64) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(position) = held.iter().rposition(|node| node.id == node_id) {
            held.remove(position);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Arc<LockNode> {
        LockNode::new(name, None)
    }

    fn acquire(node: &Arc<LockNode>) {
        about_to_acquire(node, Policy::Throw).ok();
        push_held(node);
    }

    #[test]
    fn straight_line_order_is_allowed() {
        let a = node("sl-a");
        let b = node("sl-b");
        acquire(&a);
        acquire(&b);
        pop_held(b.id);
        pop_held(a.id);
        // Same order again, now via the cached edge.
        acquire(&a);
        assert!(about_to_acquire(&b, Policy::Throw).is_ok());
        pop_held(a.id);
    }

    #[test]
    fn two_lock_inversion_is_detected() {
        let a = node("inv-a");
        let b = node("inv-b");
        acquire(&a);
        acquire(&b);
        pop_held(b.id);
        pop_held(a.id);

        acquire(&b);
        let detected = about_to_acquire(&a, Policy::Throw);
        pop_held(b.id);
        match detected {
            Err(LockOrderError::PotentialDeadlock(deadlock)) => {
                assert!(deadlock.cycle().contains("inv-b -> inv-a"));
                assert!(deadlock.cycle().contains("inv-a -> inv-b"));
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn repeat_detection_reuses_the_cached_cause() {
        let a = node("cache-a");
        let b = node("cache-b");
        acquire(&a);
        acquire(&b);
        pop_held(b.id);
        pop_held(a.id);

        let first = {
            acquire(&b);
            let result = about_to_acquire(&a, Policy::Throw);
            pop_held(b.id);
            result
        };
        let second = {
            acquire(&b);
            let result = about_to_acquire(&a, Policy::Throw);
            pop_held(b.id);
            result
        };
        match (first, second) {
            (
                Err(LockOrderError::PotentialDeadlock(first)),
                Err(LockOrderError::PotentialDeadlock(second)),
            ) => assert!(Arc::ptr_eq(&first, &second)),
            other => panic!("expected two detections, got {other:?}"),
        }
    }

    #[test]
    fn reentrant_observation_adds_no_edges() {
        let a = node("re-a");
        acquire(&a);
        assert!(about_to_acquire(&a, Policy::Throw).is_ok());
        pop_held(a.id);
        assert!(edge_witness(a.id, a.id).is_none());
    }

    #[test]
    fn edges_record_a_witness() {
        let a = node("wit-a");
        let b = node("wit-b");
        acquire(&a);
        acquire(&b);
        pop_held(b.id);
        pop_held(a.id);
        let witness = edge_witness(b.id, a.id);
        assert!(witness.is_some_and(|w| w.contains("wit-a")));
    }
}
