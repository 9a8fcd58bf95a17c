//! Phase-level machinery: response parsing (§4.1), retry-context rendering (§4.2), backpressure
//! checks (§4.5), and the iteration-loop executor (§4.5) that ties them together.

pub mod backpressure;
pub mod executor;
pub mod parser;
pub mod retry_context;

pub use backpressure::{BackpressureCheck, BackpressureReport, CheckResult};
pub use executor::{PhaseExecutionInput, PhaseExecutor, PhaseOutcome};
pub use parser::{PhaseKind, PhaseResponse, Verdict};
pub use retry_context::{RetryContextInput, ReviewComment};
