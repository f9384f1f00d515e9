pub mod config;
pub mod events;
pub mod id;
pub mod roles;
pub mod types;

pub use config::{Config, ConfigError};
pub use id::Id;
pub use types::{
    Decision, Event, JournalEntry, Role, RoleOutputs, Run, RunStatus, Step, StepStatus, Task,
    TaskState, TaskStatus, TaskType, Verdict, Worktree, TASK_ID_REGEX,
};
