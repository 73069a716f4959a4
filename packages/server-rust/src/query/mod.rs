//! Query execution: planning (index vs scan), filtering, sorting,
//! pagination, projection, and `explain`.

mod executor;

pub use executor::{PlanStep, QueryExecutor};
