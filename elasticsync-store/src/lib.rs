//! Change-log storage for ElasticSync.
//!
//! The change log is the durable queue between the capture triggers and the
//! sync workers. This crate provides:
//! - The [`ChangeLogStore`], [`ChangeLogSession`] and
//!   [`NotificationSubscription`] traits the engine drains it through
//! - [`PgChangeLogStore`], the Postgres implementation (capture install,
//!   skip-locked claims, `LISTEN`)
//! - [`MemoryChangeLogStore`], an in-process implementation with the same
//!   eligibility rules
//! - The capture DDL generator in [`installer`]

mod error;
pub mod installer;
mod memory;
mod postgres;
mod store;

pub use error::{StoreError, StoreResult};
pub use installer::CaptureTarget;
pub use memory::{MemoryChangeLogStore, MemorySession, MemorySubscription};
pub use postgres::{PgChangeLogStore, PgSession, PgSubscription};
pub use store::{
    ChangeLogSession, ChangeLogStats, ChangeLogStore, ClaimStrategy, Notification,
    NotificationSubscription, RowFailure, RowReject,
};
