//! Controller Module - Führt einen ReconciliationPlan aus
//!
//! 1. Scheduler startet Operationen sobald ihre Abhängigkeiten erfüllt sind
//! 2. Executor führt eine Operation inklusive Wiederholungen aus
//! 3. Nach dem Start eines Containers wird auf Readiness gewartet

pub mod executor;
pub mod health;
pub mod scheduler;

pub use executor::{execute_operation, ExecContext, Outcome};
pub use health::{wait_until_ready, HealthTimeout};
pub use scheduler::{execute_plan, plan_results};
