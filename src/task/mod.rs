//! Task module - the orchestrated unit of work and its state machine.
//!
//! This module is pure data plus validated transitions:
//! - All status changes go through methods on `Task` that check the source state
//! - Invariants (result bound, progress semantics, completion threshold) are
//!   enforced here so every store backend sees consistent records
//! - No IO happens here; persistence and locking live in `lifecycle` and `store`

mod request;
pub mod task;

pub use request::{decode_base64_image, ReferenceImage, RequestError, Style, TaskRequest};
pub use task::{
    SubJobOutcome, SubJobResult, Task, TaskError, TaskId, TaskSnapshot, TaskStatus,
    PARTIAL_PROGRESS_CAP,
};
