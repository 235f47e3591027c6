//! Contention detection and contender attribution
//!
//! Detection compares the derived metrics of a latency-critical task against
//! the threshold bucket matching its utilization. Attribution then looks at
//! every other task for the one whose signal jumped the most.

mod attribution;
mod contention;

pub use attribution::{contention_signal, find_contender};
pub use contention::{ContentionDetector, Detection, MemoryBwPolicy};
