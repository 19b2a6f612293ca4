//! Wave partitioning by topological layering.
//!
//! Each wave is the maximal set of not-yet-assigned tasks whose dependencies
//! all live in earlier waves. Members are ordered by ascending task id so the
//! same graph always yields the same plan.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::dag::builder::{DagBuilder, TaskGraph, TaskIndex};
use crate::errors::PlanError;
use crate::task::Task;

/// Members of one wave that declare the same touched resource.
///
/// Advisory only: conflicting tasks still run in the same wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRisk {
    pub resource: String,
    pub tasks: Vec<String>,
}

/// An ordered group of mutually independent tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 1-based wave number
    pub number: u32,
    /// Member task ids, ascending
    pub tasks: Vec<String>,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictRisk>,
}

impl Wave {
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t == task_id)
    }

    pub fn has_conflict_risk(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Order task ids naturally: all-digit ids first and numerically, then
/// everything else lexically.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Find the wave number a task was assigned to.
pub fn wave_of(waves: &[Wave], task_id: &str) -> Option<u32> {
    waves.iter().find(|w| w.contains(task_id)).map(|w| w.number)
}

/// Partitions a task graph into ordered waves.
pub struct WavePartitioner;

impl WavePartitioner {
    /// Build the graph from tasks and partition it.
    pub fn from_tasks(tasks: &[Task]) -> Result<Vec<Wave>, PlanError> {
        let graph = DagBuilder::new(tasks.to_vec()).build()?;
        Self::partition(&graph)
    }

    /// Compute execution waves.
    ///
    /// Layering stalls exactly when the remaining tasks contain a cycle,
    /// which is reported as [`PlanError::Cycle`].
    pub fn partition(graph: &TaskGraph) -> Result<Vec<Wave>, PlanError> {
        if graph.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut waves = Vec::new();
        let mut assigned: HashSet<TaskIndex> = HashSet::new();
        let mut wave_by_index: HashMap<TaskIndex, u32> = HashMap::new();

        while assigned.len() < graph.len() {
            let mut ready: Vec<TaskIndex> = (0..graph.len())
                .filter(|i| !assigned.contains(i))
                .filter(|&i| graph.dependencies_satisfied(i, &assigned))
                .collect();

            if ready.is_empty() {
                return Err(PlanError::Cycle {
                    tasks: cycle_members(graph, &assigned),
                });
            }

            ready.sort_by(|&a, &b| compare_task_ids(&id_at(graph, a), &id_at(graph, b)));

            let number = waves.len() as u32 + 1;
            let rationale = Self::rationale(graph, &ready, &wave_by_index);
            let conflicts = Self::conflicts(graph, &ready);

            for &idx in &ready {
                assigned.insert(idx);
                wave_by_index.insert(idx, number);
            }

            waves.push(Wave {
                number,
                tasks: ready.iter().map(|&i| id_at(graph, i)).collect(),
                rationale,
                conflicts,
            });
        }

        Ok(waves)
    }

    fn rationale(
        graph: &TaskGraph,
        members: &[TaskIndex],
        wave_by_index: &HashMap<TaskIndex, u32>,
    ) -> String {
        let upstream: BTreeSet<u32> = members
            .iter()
            .flat_map(|&i| graph.dependencies(i).iter())
            .filter_map(|dep| wave_by_index.get(dep).copied())
            .collect();

        let count = members.len();
        let noun = if count == 1 { "task" } else { "tasks" };

        if upstream.is_empty() {
            format!("{} {} with no dependencies", count, noun)
        } else {
            let list: Vec<String> = upstream.iter().map(|w| w.to_string()).collect();
            format!(
                "{} {} whose dependencies complete in wave(s) {}",
                count,
                noun,
                list.join(", ")
            )
        }
    }

    fn conflicts(graph: &TaskGraph, members: &[TaskIndex]) -> Vec<ConflictRisk> {
        let mut by_resource: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for &idx in members {
            if let Some(task) = graph.get_task(idx) {
                for resource in &task.touched_resources {
                    by_resource
                        .entry(resource.as_str())
                        .or_default()
                        .push(task.id.clone());
                }
            }
        }

        by_resource
            .into_iter()
            .filter(|(_, tasks)| tasks.len() > 1)
            .map(|(resource, tasks)| ConflictRisk {
                resource: resource.to_string(),
                tasks,
            })
            .collect()
    }
}

/// Unassigned tasks that sit on a dependency cycle, naturally ordered.
///
/// Tasks that merely wait on a cycle are left out.
fn cycle_members(graph: &TaskGraph, assigned: &HashSet<TaskIndex>) -> Vec<String> {
    let mut members: Vec<String> = (0..graph.len())
        .filter(|i| !assigned.contains(i))
        .filter(|&i| reaches_itself(graph, i))
        .map(|i| id_at(graph, i))
        .collect();
    members.sort_by(|a, b| compare_task_ids(a, b));
    members
}

fn reaches_itself(graph: &TaskGraph, start: TaskIndex) -> bool {
    let mut stack = graph.dependencies(start).to_vec();
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if seen.insert(node) {
            stack.extend_from_slice(graph.dependencies(node));
        }
    }
    false
}

fn id_at(graph: &TaskGraph, index: TaskIndex) -> String {
    graph
        .get_task(index)
        .map(|t| t.id.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, &format!("Task {}", id), deps)
    }

    fn assert_valid_partition(tasks: &[Task], waves: &[Wave]) {
        // every task appears in exactly one wave
        for t in tasks {
            let count = waves.iter().filter(|w| w.contains(&t.id)).count();
            assert_eq!(count, 1, "task {} appears {} times", t.id, count);
        }
        // no wave is empty, numbering is 1..=n
        for (i, w) in waves.iter().enumerate() {
            assert!(!w.tasks.is_empty());
            assert_eq!(w.number as usize, i + 1);
        }
        // every edge points to a strictly earlier wave
        for t in tasks {
            let mine = wave_of(waves, &t.id).unwrap();
            for dep in &t.depends_on {
                assert!(wave_of(waves, dep).unwrap() < mine);
            }
        }
    }

    #[test]
    fn test_five_task_example_yields_two_waves() {
        let tasks = vec![
            task("1", &[]),
            task("2", &[]),
            task("3", &[]),
            task("4", &["1", "2"]),
            task("5", &["3"]),
        ];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].tasks, vec!["1", "2", "3"]);
        assert_eq!(waves[1].tasks, vec!["4", "5"]);
        assert_eq!(waves[0].rationale, "3 tasks with no dependencies");
        assert_eq!(
            waves[1].rationale,
            "2 tasks whose dependencies complete in wave(s) 1"
        );
        assert_valid_partition(&tasks, &waves);
    }

    #[test]
    fn test_linear_chain() {
        let tasks = vec![task("1", &[]), task("2", &["1"]), task("3", &["2"])];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].tasks, vec!["1"]);
        assert_eq!(waves[1].tasks, vec!["2"]);
        assert_eq!(waves[2].tasks, vec!["3"]);
    }

    #[test]
    fn test_waves_are_maximal() {
        // 4 only depends on 1, so it must not wait for 3's chain.
        let tasks = vec![
            task("1", &[]),
            task("2", &["1"]),
            task("3", &["2"]),
            task("4", &["1"]),
        ];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(waves[1].tasks, vec!["2", "4"]);
        assert_eq!(waves[2].tasks, vec!["3"]);
        assert_valid_partition(&tasks, &waves);
    }

    #[test]
    fn test_ids_order_naturally_not_by_declaration() {
        let tasks = vec![task("10", &[]), task("2", &[]), task("b", &[]), task("a", &[])];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(waves[0].tasks, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn test_partition_is_deterministic() {
        let tasks = vec![
            task("c", &["a"]),
            task("a", &[]),
            task("d", &["b", "c"]),
            task("b", &[]),
            task("e", &[]),
        ];

        let first = WavePartitioner::from_tasks(&tasks).unwrap();
        let second = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(first, second);

        let mut reversed = tasks.clone();
        reversed.reverse();
        assert_eq!(WavePartitioner::from_tasks(&reversed).unwrap(), first);
        assert_valid_partition(&tasks, &first);
    }

    #[test]
    fn test_cycle_fails_with_specific_error() {
        let tasks = vec![task("1", &[]), task("2", &["3"]), task("3", &["2"])];

        let err = WavePartitioner::from_tasks(&tasks).unwrap_err();
        match err {
            PlanError::Cycle { tasks } => assert_eq!(tasks, vec!["2", "3"]),
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_report_leaves_out_tasks_waiting_on_it() {
        // 11 and 12 only depend on the 9 <-> 10 cycle.
        let tasks = vec![
            task("10", &["9"]),
            task("9", &["10"]),
            task("11", &["10"]),
            task("12", &["11"]),
            task("1", &[]),
        ];

        let err = WavePartitioner::from_tasks(&tasks).unwrap_err();
        match err {
            PlanError::Cycle { tasks } => assert_eq!(tasks, vec!["9", "10"]),
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tasks = vec![task("a", &["a"]), task("b", &["a"])];

        let err = WavePartitioner::from_tasks(&tasks).unwrap_err();
        assert!(matches!(err, PlanError::Cycle { tasks } if tasks == vec!["a"]));
    }

    #[test]
    fn test_disjoint_cycles_are_all_reported() {
        let tasks = vec![
            task("x", &["y"]),
            task("y", &["x"]),
            task("2", &["3"]),
            task("3", &["2"]),
        ];

        let err = WavePartitioner::from_tasks(&tasks).unwrap_err();
        match err {
            PlanError::Cycle { tasks } => assert_eq!(tasks, vec!["2", "3", "x", "y"]),
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_graph_is_an_error() {
        let err = WavePartitioner::from_tasks(&[]).unwrap_err();
        assert!(matches!(err, PlanError::Empty));
    }

    #[test]
    fn test_overlapping_resources_are_annotated_not_serialized() {
        let tasks = vec![
            task("1", &[]).touching(&["src/db.rs", "src/lib.rs"]),
            task("2", &[]).touching(&["src/db.rs"]),
            task("3", &[]).touching(&["src/api.rs"]),
        ];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert_eq!(waves.len(), 1);
        assert!(waves[0].has_conflict_risk());
        assert_eq!(
            waves[0].conflicts,
            vec![ConflictRisk {
                resource: "src/db.rs".to_string(),
                tasks: vec!["1".to_string(), "2".to_string()],
            }]
        );
    }

    #[test]
    fn test_resources_shared_across_waves_are_not_conflicts() {
        let tasks = vec![
            task("1", &[]).touching(&["src/db.rs"]),
            task("2", &["1"]).touching(&["src/db.rs"]),
        ];

        let waves = WavePartitioner::from_tasks(&tasks).unwrap();

        assert!(waves.iter().all(|w| !w.has_conflict_risk()));
    }

    #[test]
    fn test_compare_task_ids() {
        assert_eq!(compare_task_ids("2", "10"), Ordering::Less);
        assert_eq!(compare_task_ids("a", "b"), Ordering::Less);
        assert_eq!(compare_task_ids("10", "a"), Ordering::Less);
        assert_eq!(compare_task_ids("02", "2"), Ordering::Less);
    }
}
