//! Attendance: the store clients and the reconciliation that keeps the live
//! roster in step with it.

mod http;
pub mod reconciler;
mod store;

pub use http::HttpPresenceStore;
pub use reconciler::{merge_snapshot, reconcile, PresenceReconciler, PresenceSnapshot, RosterDiff};
pub use store::{MemoryPresenceStore, PresenceStore};
