//! The `zcored` node: settings, the validation context and process lifecycle.

pub mod config;
pub mod context;
pub mod import;
pub mod notify;
pub mod run;

pub use context::{Committed, ContextError, ValidationContext};
pub use import::{import_blocks, ImportError, ImportSummary};
pub use notify::{NotificationError, ValidationObserver, ValidationRegistry};
pub use run::run_entry;
