//! Port allocation and tunnel lifecycle service.
//!
//! Routers register for a port from a fixed range, keep it alive with heartbeats and
//! ownership verifications, and lose it again when they release it or stop verifying.
//! A daily reaper expires silent allocations and a periodic prober checks that allocated
//! ports are actually listening.

pub mod allocator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod prober;
pub mod reaper;
pub mod tasks;
pub mod tracker;

pub use error::{PortError, Result};
pub use manager::PortManager;
