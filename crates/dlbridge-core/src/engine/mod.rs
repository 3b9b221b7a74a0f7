//! Download Engine - one lifecycle over two native download APIs
//!
//! This module implements:
//! - Native seams for the legacy and modern download objects
//! - Redirect policy translation
//! - Per-download handles and delegate adapters
//! - The coordinator tying them together
//! - SQLite persistence of finished downloads

mod adapter;
mod coordinator;
mod handle;
mod native;
mod persistence;
mod policy;

pub use adapter::DownloadDelegateAdapter;
pub use coordinator::*;
pub use handle::*;
pub use native::*;
pub use persistence::*;
pub use policy::*;
