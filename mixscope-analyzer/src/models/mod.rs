//! Data models for mixscope-analyzer
//!
//! - [`job`]: job record, status state machine, submission and status payloads
//! - [`report`]: the technical report and the persisted analysis result

pub mod job;
pub mod report;

pub use job::{AnalysisMode, Job, JobStatus, JobSubmission, JobView, StateTransition};
pub use report::{AnalysisResult, TechnicalReport, REPORT_SCHEMA_VERSION};
