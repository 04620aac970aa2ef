#![doc(issue_tracker_base_url = "https://github.com/courier-rs/courier/issues/")]

pub use courier_core::*;
pub use courier_metrics::*;
