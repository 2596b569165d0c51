pub mod app;
pub mod archive;
pub mod clock;
pub mod config;
pub mod convert;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod naming;
pub mod output;
pub mod refs;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod task;
pub mod validity;
