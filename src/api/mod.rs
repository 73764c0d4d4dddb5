//! HTTP API for the fan-out orchestrator.
//!
//! ## Endpoints
//!
//! - `POST /api/tasks` - Submit a new task
//! - `GET /api/tasks` - List recent tasks (debug)
//! - `GET /api/tasks/:id` - Get task status and results
//! - `DELETE /api/tasks/:id` - Delete a task
//! - `POST /api/tasks/:id/retry` - Retry a failed task
//! - `POST /api/tasks/check-timeout` - Run one stall scan now
//! - `GET /api/stats` - Task counts per status
//! - `GET /api/health` - Health check

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
