//! Dependency graph construction and variable substitution.
//!
//! Edges come from explicit `dependsOn` lists plus one implicit edge per
//! `$<index>.<field>` reference. Ordering uses Kahn's algorithm with a
//! min-heap so ties break by task index. Completed and failed tasks are
//! history: they are never graph nodes, only satisfied or poisoning edges.

use super::error::QueueError;
use super::parser::{var_ref_from, whole_token, VAR_REF};
use super::types::*;
use regex::Captures;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Dependency graph over the non-terminal tasks of a queue.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Node indices, ascending
    nodes: Vec<u32>,

    /// index -> every dependency (nodes or history)
    deps: FxHashMap<u32, BTreeSet<u32>>,

    /// index -> nodes that depend on it
    dependents: FxHashMap<u32, Vec<u32>>,
}

impl DependencyGraph {
    /// Graph over the pending and running tasks of `queue`.
    pub fn from_queue(queue: &Queue) -> Self {
        Self::from_tasks(queue.tasks.iter().filter(|t| !t.status.is_terminal()))
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut graph = Self::default();
        for task in tasks {
            let deps = task.dependencies();
            for dep in &deps {
                graph.dependents.entry(*dep).or_default().push(task.index);
            }
            graph.nodes.push(task.index);
            graph.deps.insert(task.index, deps);
        }
        graph.nodes.sort_unstable();
        graph
    }

    pub fn nodes(&self) -> &[u32] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, index: u32) -> impl Iterator<Item = u32> + '_ {
        self.deps.get(&index).into_iter().flatten().copied()
    }

    fn is_node(&self, index: u32) -> bool {
        self.deps.contains_key(&index)
    }

    /// Forward references, unknown targets, and cycles.
    pub fn check(&self, queue: &Queue) -> Vec<QueueError> {
        let mut errors = Vec::new();
        for &index in &self.nodes {
            for target in self.dependencies_of(index) {
                if target >= index {
                    errors.push(QueueError::ForwardReference { index, target });
                } else if queue.get(target).is_none() {
                    errors.push(QueueError::UnknownTask { index, target });
                }
            }
        }
        errors.extend(self.detect_cycles());
        errors
    }

    /// One error per distinct cycle, attributed to its lowest index.
    fn detect_cycles(&self) -> Vec<QueueError> {
        let mut visited = FxHashSet::default();
        let mut stack = Vec::new();
        let mut seen: BTreeSet<Vec<u32>> = BTreeSet::new();
        let mut cycles = Vec::new();

        for &node in &self.nodes {
            if !visited.contains(&node) {
                self.dfs_cycle(node, &mut visited, &mut stack, &mut cycles);
            }
        }

        cycles
            .into_iter()
            .filter_map(|cycle: Vec<u32>| {
                let mut key = cycle.clone();
                key.sort_unstable();
                key.dedup();
                if !seen.insert(key.clone()) {
                    return None;
                }
                let index = key.first().copied().unwrap_or_default();
                Some(QueueError::CyclicDependency { index, cycle })
            })
            .collect()
    }

    fn dfs_cycle(
        &self,
        node: u32,
        visited: &mut FxHashSet<u32>,
        stack: &mut Vec<u32>,
        cycles: &mut Vec<Vec<u32>>,
    ) {
        visited.insert(node);
        stack.push(node);

        for dep in self.dependencies_of(node).filter(|d| self.is_node(*d)) {
            if let Some(pos) = stack.iter().position(|x| *x == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep);
                cycles.push(cycle);
            } else if !visited.contains(&dep) {
                self.dfs_cycle(dep, visited, stack, cycles);
            }
        }

        stack.pop();
    }

    fn in_degrees(&self) -> FxHashMap<u32, usize> {
        self.nodes
            .iter()
            .map(|&n| {
                let degree = self.dependencies_of(n).filter(|d| self.is_node(*d)).count();
                (n, degree)
            })
            .collect()
    }

    fn cycle_error(&self, placed: &FxHashSet<u32>) -> QueueError {
        let stuck: Vec<u32> = self
            .nodes
            .iter()
            .copied()
            .filter(|n| !placed.contains(n))
            .collect();
        QueueError::CyclicDependency {
            index: stuck.first().copied().unwrap_or_default(),
            cycle: stuck,
        }
    }

    /// Deterministic topological order, ties broken by lowest index.
    pub fn execution_order(&self) -> Result<Vec<u32>, QueueError> {
        let mut in_degree = self.in_degrees();
        let mut heap: BinaryHeap<Reverse<u32>> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| Reverse(n))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(current)) = heap.pop() {
            order.push(current);
            for dependent in self.dependents.get(&current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse(*dependent));
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let placed = order.iter().copied().collect();
            return Err(self.cycle_error(&placed));
        }
        Ok(order)
    }

    /// Partition into waves: a task's wave is one past its latest dependency's.
    pub fn waves(&self) -> Result<Vec<Vec<u32>>, QueueError> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<u32> = self
            .nodes
            .iter()
            .copied()
            .filter(|n| in_degree.get(n) == Some(&0))
            .collect();

        let mut waves = Vec::new();
        let mut placed = FxHashSet::default();
        while !current.is_empty() {
            let mut next = Vec::new();
            for node in &current {
                placed.insert(*node);
                for dependent in self.dependents.get(node).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort_unstable();
            waves.push(std::mem::replace(&mut current, next));
        }

        if placed.len() != self.nodes.len() {
            return Err(self.cycle_error(&placed));
        }
        Ok(waves)
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Whether a pending task can be dispatched now.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// All dependencies completed
    Ready,
    /// Some dependency is still pending or running
    Waiting,
    /// Some dependency failed or is missing; the task must fail without dispatch
    Poisoned(QueueError),
}

/// Classify `task` against the current state of `queue`.
pub fn readiness(task: &Task, queue: &Queue) -> Readiness {
    let mut waiting = false;
    for dep in task.dependencies() {
        match queue.get(dep).map(|t| t.status) {
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Pending) | Some(TaskStatus::Running) => waiting = true,
            Some(TaskStatus::Failed) => {
                let reference = task
                    .refs
                    .iter()
                    .find(|r| r.task_index == dep)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| format!("dependsOn {}", dep));
                return Readiness::Poisoned(QueueError::UnresolvedReference {
                    index: task.index,
                    reference,
                    reason: format!("task {} failed", dep),
                });
            }
            None => {
                return Readiness::Poisoned(QueueError::UnknownTask {
                    index: task.index,
                    target: dep,
                })
            }
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

// ============================================================================
// Substitution
// ============================================================================

fn unresolved(index: u32, var: &VarRef, reason: String) -> QueueError {
    QueueError::UnresolvedReference {
        index,
        reference: var.to_string(),
        reason,
    }
}

/// Look up the value a reference points at in a completed task's result.
pub fn lookup_ref(
    index: u32,
    var: &VarRef,
    queue: &Queue,
) -> Result<serde_json::Value, QueueError> {
    let source = queue
        .get(var.task_index)
        .ok_or_else(|| unresolved(index, var, format!("task {} does not exist", var.task_index)))?;
    if source.status != TaskStatus::Completed {
        return Err(unresolved(
            index,
            var,
            format!("task {} is {}", var.task_index, source.status),
        ));
    }
    let result = source
        .result
        .as_ref()
        .ok_or_else(|| unresolved(index, var, format!("task {} has no result", var.task_index)))?;

    let mut fields = var.field_path.iter();
    let first = fields.next().map(String::as_str).unwrap_or_default();
    let mut current = result.get(first);
    for field in fields {
        current = current.and_then(|v| match v {
            serde_json::Value::Object(map) => map.get(field),
            serde_json::Value::Array(items) => {
                field.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        });
    }
    current.cloned().ok_or_else(|| {
        unresolved(
            index,
            var,
            format!(
                "field '{}' not found in result of task {}",
                var.field_path.join("."),
                var.task_index
            ),
        )
    })
}

fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_value(
    index: u32,
    value: &serde_json::Value,
    queue: &Queue,
) -> Result<serde_json::Value, QueueError> {
    match value {
        serde_json::Value::String(s) => {
            if let Some(var) = whole_token(s) {
                return lookup_ref(index, &var, queue);
            }
            if !VAR_REF.is_match(s) {
                return Ok(value.clone());
            }
            let mut failure = None;
            let replaced = VAR_REF.replace_all(s, |caps: &Captures<'_>| {
                let text = match var_ref_from(caps) {
                    Some(var) => lookup_ref(index, &var, queue).map(|v| value_as_text(&v)),
                    None => Err(QueueError::UnresolvedReference {
                        index,
                        reference: caps[0].to_string(),
                        reason: "task index is out of range".to_string(),
                    }),
                };
                text.unwrap_or_else(|e| {
                    failure.get_or_insert(e);
                    String::new()
                })
            });
            match failure {
                Some(e) => Err(e),
                None => Ok(serde_json::Value::String(replaced.into_owned())),
            }
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(index, v, queue))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(index, v, queue)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(serde_json::Value::Object),
        other => Ok(other.clone()),
    }
}

/// Substitute every reference in `task.params` from completed results.
///
/// A value that is exactly one token takes the referenced JSON value;
/// tokens embedded in longer strings are interpolated as text.
pub fn resolve_params(task: &Task, queue: &Queue) -> Result<Params, QueueError> {
    task.params
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(task.index, v, queue)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn task(index: u32, params: serde_json::Value, depends_on: Vec<u32>) -> Task {
        let params: Params = serde_json::from_value(params).unwrap();
        Task::new(index, Action::Modify, params, depends_on)
    }

    fn queue_of(tasks: Vec<Task>) -> Queue {
        let next_index = tasks.iter().map(|t| t.index).max().unwrap_or(0) + 1;
        Queue {
            next_index,
            tasks,
            ..Queue::default()
        }
    }

    fn complete(queue: &mut Queue, index: u32, result: serde_json::Value) {
        let t = queue.get_mut(index).unwrap();
        t.status = TaskStatus::Completed;
        t.result = result.as_object().cloned();
    }

    #[test]
    fn test_resolver_implicit_edges() {
        let q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"uuid": "$1.uuid"}), vec![]),
        ]);
        let graph = DependencyGraph::from_queue(&q);
        assert_eq!(graph.dependencies_of(2).collect::<Vec<_>>(), vec![1]);
        assert!(graph.check(&q).is_empty());
    }

    #[test]
    fn test_resolver_forward_reference() {
        let q = queue_of(vec![
            task(1, json!({"uuid": "$2.uuid"}), vec![]),
            task(2, json!({}), vec![]),
        ]);
        let errors = DependencyGraph::from_queue(&q).check(&q);
        assert_eq!(
            errors,
            vec![QueueError::ForwardReference {
                index: 1,
                target: 2
            }]
        );
    }

    #[test]
    fn test_resolver_self_reference_is_forward() {
        let q = queue_of(vec![task(1, json!({}), vec![1])]);
        let errors = DependencyGraph::from_queue(&q).check(&q);
        assert!(errors.contains(&QueueError::ForwardReference {
            index: 1,
            target: 1
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, QueueError::CyclicDependency { .. })));
    }

    #[test]
    fn test_resolver_cycle_detected() {
        let q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"uuid": "$3.uuid"}), vec![]),
            task(3, json!({"uuid": "$2.uuid"}), vec![]),
        ]);
        let graph = DependencyGraph::from_queue(&q);
        let errors = graph.check(&q);
        let cycles: Vec<_> = errors
            .iter()
            .filter(|e| matches!(e, QueueError::CyclicDependency { .. }))
            .collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].task_index(), 2);
        assert!(graph.execution_order().is_err());
        assert!(graph.waves().is_err());
    }

    #[test]
    fn test_resolver_unknown_target() {
        let mut q = queue_of(vec![task(5, json!({"uuid": "$3.uuid"}), vec![])]);
        q.next_index = 6;
        let errors = DependencyGraph::from_queue(&q).check(&q);
        assert_eq!(
            errors,
            vec![QueueError::UnknownTask {
                index: 5,
                target: 3
            }]
        );
    }

    #[test]
    fn test_resolver_order_ties_by_index() {
        let q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({}), vec![]),
            task(3, json!({}), vec![1]),
            task(4, json!({}), vec![]),
        ]);
        let graph = DependencyGraph::from_queue(&q);
        assert_eq!(graph.execution_order().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(graph.waves().unwrap(), vec![vec![1, 2, 4], vec![3]]);
    }

    #[test]
    fn test_resolver_terminal_tasks_not_nodes() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"uuid": "$1.uuid"}), vec![]),
        ]);
        complete(&mut q, 1, json!({"uuid": "U-1"}));
        let graph = DependencyGraph::from_queue(&q);
        assert_eq!(graph.nodes(), &[2]);
        assert_eq!(graph.waves().unwrap(), vec![vec![2]]);
    }

    #[test]
    fn test_resolver_readiness() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"uuid": "$1.uuid"}), vec![]),
            task(3, json!({}), vec![2]),
        ]);
        assert_eq!(readiness(&q.tasks[1], &q), Readiness::Waiting);
        complete(&mut q, 1, json!({"uuid": "U-1"}));
        assert_eq!(readiness(&q.tasks[1], &q), Readiness::Ready);
        q.get_mut(2).unwrap().status = TaskStatus::Failed;
        match readiness(&q.tasks[2], &q) {
            Readiness::Poisoned(QueueError::UnresolvedReference { index, reason, .. }) => {
                assert_eq!(index, 3);
                assert!(reason.contains("task 2 failed"));
            }
            other => panic!("expected poisoned, got {:?}", other),
        }
    }

    #[test]
    fn test_resolver_whole_token_keeps_type() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(
                2,
                json!({"uuids": "$1.found", "rating": "$1.meta.score", "first": "$1.found.0"}),
                vec![],
            ),
        ]);
        complete(
            &mut q,
            1,
            json!({"found": ["A", "B"], "meta": {"score": 4}}),
        );
        let params = resolve_params(&q.tasks[1], &q).unwrap();
        assert_eq!(params["uuids"], json!(["A", "B"]));
        assert_eq!(params["rating"], json!(4));
        assert_eq!(params["first"], json!("A"));
    }

    #[test]
    fn test_resolver_embedded_interpolation() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(
                2,
                json!({"comment": "copy of $1.name ($1.count items)", "nested": {"x": ["$1.name"]}}),
                vec![],
            ),
        ]);
        complete(&mut q, 1, json!({"name": "Report", "count": 3}));
        let params = resolve_params(&q.tasks[1], &q).unwrap();
        assert_eq!(params["comment"], json!("copy of Report (3 items)"));
        assert_eq!(params["nested"], json!({"x": ["Report"]}));
    }

    #[test]
    fn test_resolver_missing_field_unresolved() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"uuid": "$1.uuid"}), vec![]),
        ]);
        complete(&mut q, 1, json!({"name": "x"}));
        let err = resolve_params(&q.tasks[1], &q).unwrap_err();
        assert_eq!(err.kind(), "unresolved_reference");
        assert!(err.to_string().contains("field 'uuid' not found"));
    }

    #[test]
    fn test_resolver_leading_zero_interpolated() {
        let mut q = queue_of(vec![
            task(1, json!({}), vec![]),
            task(2, json!({"comment": "copy of $01.name"}), vec![]),
        ]);
        complete(&mut q, 1, json!({"name": "Report"}));
        let params = resolve_params(&q.tasks[1], &q).unwrap();
        assert_eq!(params["comment"], json!("copy of Report"));
    }

    #[test]
    fn test_resolver_out_of_range_index_fails() {
        let q = queue_of(vec![
            task(1, json!({"uuid": "$99999999999.uuid"}), vec![]),
            task(2, json!({"comment": "see $99999999999.uuid"}), vec![]),
        ]);
        for t in &q.tasks {
            let err = resolve_params(t, &q).unwrap_err();
            assert_eq!(err.kind(), "unresolved_reference");
            assert!(err.to_string().contains("out of range"), "{}", err);
        }
    }

    fn arb_backward_dag() -> impl Strategy<Value = Vec<Vec<u32>>> {
        (1usize..24).prop_flat_map(|n| {
            (0..n)
                .map(|i| {
                    if i == 0 {
                        Just(Vec::new()).boxed()
                    } else {
                        proptest::collection::vec(1..=(i as u32), 0..3).boxed()
                    }
                })
                .collect::<Vec<_>>()
        })
    }

    fn dag_queue(deps: &[Vec<u32>]) -> Queue {
        queue_of(
            deps.iter()
                .enumerate()
                .map(|(i, d)| task(i as u32 + 1, json!({}), d.clone()))
                .collect(),
        )
    }

    proptest! {
        #[test]
        fn prop_resolver_backward_edges_are_valid(deps in arb_backward_dag()) {
            let q = dag_queue(&deps);
            let graph = DependencyGraph::from_queue(&q);
            prop_assert!(graph.check(&q).is_empty());

            let order = graph.execution_order().unwrap();
            prop_assert_eq!(order.len(), deps.len());
            let pos: FxHashMap<u32, usize> = order.iter().enumerate().map(|(p, i)| (*i, p)).collect();
            for t in &q.tasks {
                for d in t.dependencies() {
                    prop_assert!(pos[&d] < pos[&t.index]);
                }
            }
        }

        #[test]
        fn prop_resolver_waves_respect_edges(deps in arb_backward_dag()) {
            let q = dag_queue(&deps);
            let waves = DependencyGraph::from_queue(&q).waves().unwrap();
            let wave_of: FxHashMap<u32, usize> = waves
                .iter()
                .enumerate()
                .flat_map(|(w, ids)| ids.iter().map(move |i| (*i, w)))
                .collect();
            prop_assert_eq!(wave_of.len(), deps.len());
            for t in &q.tasks {
                for d in t.dependencies() {
                    prop_assert!(wave_of[&d] < wave_of[&t.index]);
                }
            }
        }

        #[test]
        fn prop_resolver_forward_edge_rejected(deps in arb_backward_dag(), pick in any::<prop::sample::Index>()) {
            let mut q = dag_queue(&deps);
            let n = q.tasks.len();
            let from = pick.index(n);
            let target = q.tasks[from].index + 1;
            q.tasks[from].depends_on.push(target);
            let errors = DependencyGraph::from_queue(&q).check(&q);
            let forward = QueueError::ForwardReference { index: q.tasks[from].index, target };
            prop_assert!(errors.contains(&forward));
        }
    }
}
