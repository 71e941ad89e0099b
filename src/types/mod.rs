//! Type definitions

pub mod import_job;
pub mod ledger;
pub mod messages;

pub use import_job::*;
pub use ledger::*;
pub use messages::*;
