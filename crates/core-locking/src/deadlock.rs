//! Wait-for graph deadlock detection
//!
//! Nodes are owners. An edge `W -> H` exists while owner `W` waits on a resource whose
//! unexpired lock is held by owner `H`. A cycle in this graph is a deadlock.
//!
//! Detection runs in two places:
//! - [`DeadlockDetector::check_request`] before each acquisition attempt, refusing a
//!   request that would close a cycle
//! - [`DeadlockDetector::scan`] on a fixed interval, aborting one waiter per cycle that
//!   slipped past the pre-check (e.g. two owners racing into it)

use crate::types::{DeadlockInfo, DeadlockResolution, DeadlockStrategy, LockInfo};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

const MAX_HISTORY: usize = 100;

type Graph = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone)]
struct Waiter {
    owner_id: String,
    resource_id: String,
    priority: i32,
    since: Instant,
    abort: CancellationToken,
}

#[derive(Debug, Default)]
struct Waiters(HashMap<Uuid, Waiter>);

/// Registration of an in-progress acquisition; removed from the graph on drop
#[derive(Debug)]
pub struct WaitGuard {
    id: Uuid,
    abort: CancellationToken,
    waiters: Arc<Mutex<Waiters>>,
}

impl WaitGuard {
    /// Cancelled when the periodic scan picks this waiter as a deadlock victim
    pub fn aborted(&self) -> &CancellationToken {
        &self.abort
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.0.remove(&self.id);
        }
    }
}

#[derive(Debug)]
pub struct DeadlockDetector {
    strategy: DeadlockStrategy,
    waiters: Arc<Mutex<Waiters>>,
    history: Mutex<VecDeque<DeadlockInfo>>,
    deadlock_count: AtomicU64,
}

impl DeadlockDetector {
    pub fn new(strategy: DeadlockStrategy) -> Self {
        Self {
            strategy,
            waiters: Arc::new(Mutex::new(Waiters::default())),
            history: Mutex::new(VecDeque::new()),
            deadlock_count: AtomicU64::new(0),
        }
    }

    /// Record that `owner_id` is trying to lock `resource_id`
    pub fn register_waiter(&self, owner_id: &str, resource_id: &str, priority: i32) -> WaitGuard {
        let id = Uuid::new_v4();
        let abort = CancellationToken::new();
        self.waiters_mut().0.insert(
            id,
            Waiter {
                owner_id: owner_id.to_string(),
                resource_id: resource_id.to_string(),
                priority,
                since: Instant::now(),
                abort: abort.clone(),
            },
        );
        WaitGuard {
            id,
            abort,
            waiters: self.waiters.clone(),
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters_mut().0.len()
    }

    pub fn deadlock_count(&self) -> u64 {
        self.deadlock_count.load(Ordering::Relaxed)
    }

    /// Most recent deadlocks, oldest first
    pub fn recent_deadlocks(&self) -> Vec<DeadlockInfo> {
        self.history_mut().iter().cloned().collect()
    }

    /// Would `owner_id` waiting on `resource_id` close a cycle?
    pub fn check_request(
        &self,
        owner_id: &str,
        resource_id: &str,
        locks: &[LockInfo],
    ) -> Option<DeadlockInfo> {
        let graph = self.build_graph(locks);

        let holders: BTreeSet<&str> = locks
            .iter()
            .filter(|l| l.resource_id == resource_id && l.owner_id != owner_id && !l.is_expired())
            .map(|l| l.owner_id.as_str())
            .collect();

        for holder in holders {
            if let Some(path) = find_path(&graph, holder, owner_id) {
                let mut cycle = vec![owner_id.to_string()];
                cycle.extend(path.into_iter().filter(|o| o != owner_id));
                let info = DeadlockInfo {
                    deadlock_id: Uuid::new_v4(),
                    detected_at: Utc::now(),
                    involved_locks: involved_locks(&cycle, locks),
                    cycle,
                    resolution: DeadlockResolution::RequestRejected {
                        owner_id: owner_id.to_string(),
                    },
                };
                self.record(info.clone());
                return Some(info);
            }
        }

        None
    }

    /// Abort one waiter in every cycle currently in the graph
    pub fn scan(&self, locks: &[LockInfo]) -> Vec<DeadlockInfo> {
        let mut found = Vec::new();

        // Each round removes one waiter, so the loop is bounded by the waiter count
        loop {
            let graph = self.build_graph(locks);
            let Some(cycle) = find_cycle(&graph) else {
                break;
            };

            let Some((victim_id, victim)) = self.pick_victim(&cycle) else {
                break;
            };

            victim.abort.cancel();
            self.waiters_mut().0.remove(&victim_id);

            warn!(
                owner = %victim.owner_id,
                resource = %victim.resource_id,
                cycle = ?cycle,
                "deadlock detected, aborting waiter"
            );

            let info = DeadlockInfo {
                deadlock_id: Uuid::new_v4(),
                detected_at: Utc::now(),
                involved_locks: involved_locks(&cycle, locks),
                cycle,
                resolution: DeadlockResolution::WaiterAborted {
                    owner_id: victim.owner_id,
                    resource_id: victim.resource_id,
                },
            };
            self.record(info.clone());
            found.push(info);
        }

        found
    }

    fn pick_victim(&self, cycle: &[String]) -> Option<(Uuid, Waiter)> {
        let waiters = self.waiters_mut();
        let candidates = waiters
            .0
            .iter()
            .filter(|(_, w)| cycle.contains(&w.owner_id) && !w.abort.is_cancelled());

        let chosen = match self.strategy {
            DeadlockStrategy::AbortYoungest => candidates.max_by_key(|(_, w)| w.since),
            DeadlockStrategy::AbortLowestPriority => candidates
                .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.since.cmp(&a.since))),
        };

        chosen.map(|(id, w)| (*id, w.clone()))
    }

    fn build_graph(&self, locks: &[LockInfo]) -> Graph {
        let mut holders: HashMap<&str, Vec<&str>> = HashMap::new();
        for lock in locks.iter().filter(|l| !l.is_expired()) {
            holders
                .entry(lock.resource_id.as_str())
                .or_default()
                .push(lock.owner_id.as_str());
        }

        let mut graph = Graph::new();
        for waiter in self.waiters_mut().0.values() {
            if waiter.abort.is_cancelled() {
                continue;
            }
            if let Some(owners) = holders.get(waiter.resource_id.as_str()) {
                for holder in owners.iter().filter(|h| **h != waiter.owner_id) {
                    graph
                        .entry(waiter.owner_id.clone())
                        .or_default()
                        .insert(holder.to_string());
                }
            }
        }
        graph
    }

    fn record(&self, info: DeadlockInfo) {
        self.deadlock_count.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history_mut();
        history.push_back(info);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    fn waiters_mut(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history_mut(&self) -> MutexGuard<'_, VecDeque<DeadlockInfo>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn involved_locks(cycle: &[String], locks: &[LockInfo]) -> Vec<Uuid> {
    locks
        .iter()
        .filter(|l| cycle.contains(&l.owner_id) && !l.is_expired())
        .map(|l| l.lock_id)
        .collect()
}

/// Breadth-first path `from -> .. -> to`, inclusive of both ends
fn find_path(graph: &Graph, from: &str, to: &str) -> Option<Vec<String>> {
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    let mut seen = BTreeSet::from([from]);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![to.to_string()];
            let mut cur = to;
            while let Some(&prev) = parent.get(cur) {
                path.push(prev.to_string());
                cur = prev;
            }
            path.reverse();
            return Some(path);
        }
        for next in graph.get(node).into_iter().flatten() {
            if seen.insert(next.as_str()) {
                parent.insert(next.as_str(), node);
                queue.push_back(next.as_str());
            }
        }
    }

    None
}

/// First cycle found by depth-first search, in edge order
fn find_cycle(graph: &Graph) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        graph: &'a Graph,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        for next in graph.get(node).into_iter().flatten() {
            match marks.get(next.as_str()) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == next.as_str())?;
                    return Some(stack[start..].iter().map(|s| s.to_string()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(graph, next, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for node in graph.keys() {
        if !marks.contains_key(node.as_str()) {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(graph, node, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockRequest;
    use std::time::Duration;

    fn held(resource: &str, owner: &str) -> LockInfo {
        LockInfo::new(&LockRequest::new(resource, owner), Duration::from_secs(30))
    }

    #[test]
    fn test_no_cycle_for_simple_wait() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortYoungest);
        let locks = vec![held("r1", "a")];

        assert!(detector.check_request("b", "r1", &locks).is_none());
        assert_eq!(detector.deadlock_count(), 0);
    }

    #[test]
    fn test_request_closing_cycle_is_rejected() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortYoungest);
        let locks = vec![held("r1", "a"), held("r2", "b")];
        let _a_waits = detector.register_waiter("a", "r2", 0);

        let info = detector.check_request("b", "r1", &locks).unwrap();
        assert_eq!(info.cycle, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(info.involved_locks.len(), 2);
        assert_eq!(
            info.resolution,
            DeadlockResolution::RequestRejected {
                owner_id: "b".to_string()
            }
        );
        assert_eq!(detector.deadlock_count(), 1);
    }

    #[test]
    fn test_transitive_cycle() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortYoungest);
        let locks = vec![held("r1", "a"), held("r2", "b"), held("r3", "c")];
        let _a = detector.register_waiter("a", "r2", 0);
        let _b = detector.register_waiter("b", "r3", 0);

        let info = detector.check_request("c", "r1", &locks).unwrap();
        assert_eq!(info.cycle, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_scan_aborts_youngest() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortYoungest);
        let locks = vec![held("r1", "a"), held("r2", "b")];

        let older = detector.register_waiter("a", "r2", 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let younger = detector.register_waiter("b", "r1", 0);

        let found = detector.scan(&locks);
        assert_eq!(found.len(), 1);
        assert!(younger.aborted().is_cancelled());
        assert!(!older.aborted().is_cancelled());
        assert_eq!(detector.waiting_count(), 1);
        assert_eq!(detector.recent_deadlocks().len(), 1);
    }

    #[test]
    fn test_scan_aborts_lowest_priority() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortLowestPriority);
        let locks = vec![held("r1", "a"), held("r2", "b")];

        let low = detector.register_waiter("a", "r2", 1);
        let high = detector.register_waiter("b", "r1", 10);

        detector.scan(&locks);
        assert!(low.aborted().is_cancelled());
        assert!(!high.aborted().is_cancelled());
    }

    #[test]
    fn test_guard_drop_removes_edge() {
        let detector = DeadlockDetector::new(DeadlockStrategy::AbortYoungest);
        let locks = vec![held("r1", "a"), held("r2", "b")];

        {
            let _a = detector.register_waiter("a", "r2", 0);
            assert_eq!(detector.waiting_count(), 1);
        }

        assert_eq!(detector.waiting_count(), 0);
        assert!(detector.check_request("b", "r1", &locks).is_none());
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = Graph::new();
        graph.entry("x".into()).or_default().insert("y".into());
        graph.entry("y".into()).or_default().insert("z".into());
        assert!(find_cycle(&graph).is_none());

        graph.entry("z".into()).or_default().insert("y".into());
        assert_eq!(find_cycle(&graph), Some(vec!["y".to_string(), "z".to_string()]));
    }
}
