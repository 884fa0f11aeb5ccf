//! Domain model (IDs, resources, task rows, worker rows, pipelines, history).

pub mod errors;
pub mod history;
pub mod ids;
pub mod pipeline;
pub mod resources;
pub mod state;
pub mod task;
pub mod task_type;
pub mod worker;

pub use errors::TaskError;
pub use history::{AttemptResult, HistoryEntry};
pub use ids::{PipelineKey, TaskId, WorkerId};
pub use pipeline::PipelineRecord;
pub use resources::Resources;
pub use state::TaskState;
pub use task::{InsertOutcome, NewTask, TaskRecord};
pub use task_type::{StageDetails, TaskTypeName};
pub use worker::WorkerNode;
