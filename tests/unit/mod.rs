//! Unit tests for individual components

mod config_test;
mod driver_test;
mod error_test;
