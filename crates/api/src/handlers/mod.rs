pub mod health;
pub mod scheduler;
pub mod sync_runs;
pub mod tasks;
