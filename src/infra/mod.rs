//! Concrete collaborators: input loading, result storage, result transport
//! and an in-memory provider.

#[cfg(feature = "http")]
pub mod http;
pub mod input;
pub mod results;
pub mod simulated;

#[cfg(feature = "http")]
pub use http::HttpResultChannel;
pub use input::{filter_uncollected, load_work_items, parse_work_items, WorkloadScript};
pub use results::FsResultStore;
pub use simulated::{SimulatedCloud, TypeBehavior};
