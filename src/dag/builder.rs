//! Task dependency graph.
//!
//! `DagBuilder::build` resolves dependency ids to positions and rejects
//! duplicate ids and dangling dependencies. Acyclicity is established by the
//! partitioner: a graph with a cycle can never be fully layered.

use std::collections::{HashMap, HashSet};

use crate::errors::PlanError;
use crate::task::Task;

/// Position of a task in declaration order.
pub type TaskIndex = usize;

/// Tasks plus their resolved dependency edges.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    /// `dependencies[i]` holds the positions task `i` waits for
    dependencies: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get_task(&self, index: TaskIndex) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.dependencies.get(index).map_or(&[], |deps| deps.as_slice())
    }

    /// True when every dependency of `index` is in `done`.
    pub fn dependencies_satisfied(&self, index: TaskIndex, done: &HashSet<TaskIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| done.contains(dep))
    }
}

pub struct DagBuilder {
    tasks: Vec<Task>,
}

impl DagBuilder {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn build(self) -> Result<TaskGraph, PlanError> {
        let dependencies = {
            let mut positions: HashMap<&str, TaskIndex> =
                HashMap::with_capacity(self.tasks.len());
            for (i, task) in self.tasks.iter().enumerate() {
                if positions.insert(task.id.as_str(), i).is_some() {
                    return Err(PlanError::DuplicateTask {
                        id: task.id.clone(),
                    });
                }
            }

            self.tasks
                .iter()
                .map(|task| {
                    task.depends_on
                        .iter()
                        .map(|dep| {
                            positions.get(dep.as_str()).copied().ok_or_else(|| {
                                PlanError::UnknownDependency {
                                    task: task.id.clone(),
                                    dependency: dep.clone(),
                                }
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(TaskGraph {
            tasks: self.tasks,
            dependencies,
        })
    }
}
