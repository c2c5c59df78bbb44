//! Shared data types for the portal discovery workspace
//!
//! This library provides:
//! - The canonical service record emitted by every discovery source
//! - The change type shared by watch handlers and metric bookkeeping
//! - The statically configured manual service entry

pub mod change;
pub mod record;

pub use change::ResourceChange;
pub use record::{derive_uid, ManualServiceEntry, ServiceRecord};
