//! Configuration models for harvest runs.

pub mod harvest;

pub use harvest::HarvestConfig;
