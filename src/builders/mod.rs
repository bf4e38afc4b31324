//! Builders that assemble scheduler components at startup.

pub mod bootstrap;

pub use bootstrap::{
    build_scheduler, discover_quotas, resolve_items, subtract_active_consumers, Bootstrap,
};
