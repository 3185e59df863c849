//! facematch-store: SQLite persistence for enrolled faces.
//!
//! Each row holds the canonical embedding text produced by
//! [`facematch_core::codec::encode`] plus verification counters. Rows are
//! created by enrollment, mutated only by verification events, and removed
//! only by a bulk [`EnrollmentStore::clear`].

mod store;

pub use store::{EnrollmentRecord, EnrollmentStore, MigrationReport, StoreError, StoreStats};
