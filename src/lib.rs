//! Fabricator: resumable manufacturing work orchestration.
//!
//! A WorkOrder fans out into one Job per matched part. Each Job owns a
//! checkpointable script [`Runner`] that suspends while external work is in
//! flight; remote executors pull tasks and push results through the HTTP
//! gateway, reconciled by single-use cookies.

pub mod capability;
pub mod config;
pub mod drawing;
pub mod error;
pub mod gateway;
pub mod parts;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod store;
pub mod value;
pub mod workorder;

pub use error::{OrderError, OrderErrorCode, RunnerError};
pub use runner::{Runner, Task};
pub use scheduler::{Engine, EngineError, WorkOrderRequest};
pub use value::ScriptValue;
pub use workorder::{ExecutionStyle, Job, JobState, WorkOrder};
