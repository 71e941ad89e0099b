//! Business logic services

pub mod cancellation;
pub mod import_processor;
pub mod ledger;
pub mod replay;
pub mod retry;
