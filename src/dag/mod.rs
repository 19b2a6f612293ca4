//! Task dependency graph and wave partitioning.
//!
//! The partitioner groups a task graph into ordered waves of mutually
//! independent tasks:
//!
//! 1. **Builder** - Constructs a validated DAG from tasks with their dependencies
//! 2. **Partitioner** - Layers the DAG into maximal, deterministic waves
//!
//! ## Example
//!
//! ```
//! use waveforge::dag::WavePartitioner;
//! use waveforge::task::Task;
//!
//! let tasks = vec![
//!     Task::new("1", "Schema", &[]),
//!     Task::new("2", "Repository", &[]),
//!     Task::new("3", "Config", &[]),
//!     Task::new("4", "API", &["1", "2"]),
//!     Task::new("5", "CLI", &["3"]),
//! ];
//!
//! let waves = WavePartitioner::from_tasks(&tasks).unwrap();
//! assert_eq!(waves[0].tasks, vec!["1", "2", "3"]);
//! assert_eq!(waves[1].tasks, vec!["4", "5"]);
//! ```

mod builder;
mod partition;

pub use builder::{DagBuilder, TaskGraph, TaskIndex};
pub use partition::{ConflictRisk, Wave, WavePartitioner, compare_task_ids, wave_of};
