//! Sync plan and sync run domain models.

mod sync_plan_model;
mod sync_run_model;

pub use sync_plan_model::*;
pub use sync_run_model::*;
