//! # Instance Harvest
//!
//! A quota-aware admission scheduler for running a workload across a large
//! catalog of ephemeral cloud instance types and harvesting each instance's
//! results.
//!
//! Cloud providers cap concurrent capacity per instance family (for example
//! in vCPUs). This crate keeps a pool of workers busy without ever admitting
//! more concurrent work in a family than that family's quota allows.
//!
//! ## Components
//!
//! - **Capacity Catalog** ([`core::catalog`]): classifies an instance type into
//!   its quota family and resolves its capacity cost through a batched,
//!   cached lookup.
//! - **Quota Table** ([`core::quota`]): remaining capacity per family, seeded
//!   from provider limits minus instances already running elsewhere.
//! - **Admission Scheduler** ([`core::scheduler`]): pending queue and quota
//!   table under one lock with a condition variable. Workers block in
//!   `acquire` until an item fits; `release` credits capacity back only when
//!   teardown was confirmed.
//! - **Driver** ([`core::driver`]): launch with one fallback class, wait for
//!   running, poll for completion, collect, tear down.
//! - **Worker Pool** ([`core::worker_pool`]): fixed set of named OS threads,
//!   each with its own current-thread tokio runtime.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use instance_harvest::builders::build_scheduler;
//! use instance_harvest::config::HarvestConfig;
//! use instance_harvest::core::{Driver, DriverSettings, HarvestPool};
//! use instance_harvest::infra::{load_work_items, FsResultStore, HttpResultChannel, WorkloadScript};
//!
//! let config = HarvestConfig::from_env()?;
//! let script = WorkloadScript::from_file("bench.sh")?;
//! let store = FsResultStore::new(&config.result_dir, script.name());
//! let items = instance_harvest::infra::filter_uncollected(load_work_items("instance.txt")?, &store);
//!
//! let boot = build_scheduler(&config, &*cloud, cloud.clone(), items).await?;
//! let driver = Driver::new(
//!     cloud.clone(),
//!     Arc::new(HttpResultChannel::from_config(&config)?),
//!     Arc::new(store),
//!     DriverSettings::from(&config),
//! )
//! .with_user_data(script.content());
//! let report = HarvestPool::new(&config).run(Arc::new(boot.scheduler), Arc::new(driver))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions and capacity accounting.
pub mod core;
/// Configuration for harvest runs.
pub mod config;
/// Builders that assemble scheduler components at startup.
pub mod builders;
/// Concrete collaborators: input, result storage, transport, simulation.
pub mod infra;
/// Shared utilities.
pub mod util;
