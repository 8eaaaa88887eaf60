//! PBS integration: job submission, tracking, and cancellation.

mod adapter;
mod parser;

pub use adapter::PbsSystem;
