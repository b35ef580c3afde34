//! The task record and its lifecycle.

mod models;
mod state;

pub use models::*;
pub use state::TaskState;
