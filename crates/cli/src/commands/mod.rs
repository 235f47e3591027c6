pub mod status;
pub mod thresholds;
