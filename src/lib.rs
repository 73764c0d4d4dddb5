//! # Fan-out Orchestrator
//!
//! Poll-based orchestrator for slow, externally-serviced image generation.
//!
//! This library provides:
//! - Task submission that returns immediately with a task id
//! - Fan-out of each task into N concurrent variant jobs, completing when K succeed
//! - Stall detection with a bounded automatic retry
//! - Pluggable task stores (in-memory, size-capped JSON file, SQLite)
//! - A polling client with HTTP and in-process transports
//!
//! ## Architecture
//!
//! ```text
//!   PollingClient ──submit/poll──► api (axum) ──► Orchestrator
//!                                                    │
//!                      ┌─────────────────────────────┼──────────────────────┐
//!                      ▼                             ▼                      ▼
//!             TaskLifecycleManager ◄──────── FanOutCoordinator     TimeoutRetryMonitor
//!                      │                             │
//!                      ▼                             ▼
//!                  TaskStore                N x SubJobExecutor ──► ImageProvider
//! ```
//!
//! ## Task Flow
//! 1. Client submits a prompt; a `pending` task is stored and its id returned
//! 2. The coordinator moves it to `processing` and starts N sub-jobs
//! 3. Each settled sub-job advances progress (10% base, 85% spread across N)
//! 4. With at least K successes the task completes, otherwise it fails
//! 5. The monitor fails and re-dispatches tasks whose progress stopped moving
//!
//! ## Modules
//! - `task`: Task data, status machine and request validation
//! - `store`: Task persistence backends
//! - `lifecycle`: Serialized, validated transitions over a store
//! - `executor`: Sub-job execution against the image provider
//! - `fanout`: Concurrent dispatch and result aggregation
//! - `monitor`: Stall detection and retry
//! - `orchestrator`: Facade tying the components together
//! - `client`: Polling client
//! - `api`: HTTP surface

pub mod api;
pub mod client;
pub mod config;
pub mod executor;
pub mod fanout;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod store;
pub mod task;
pub mod util;

pub use client::{PollConfig, PollOutcome, PollingClient, TaskApi};
pub use config::Config;
pub use orchestrator::{Orchestrator, StatusLookup};
pub use task::{TaskId, TaskRequest, TaskSnapshot, TaskStatus};
