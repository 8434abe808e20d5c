//! Push-triggered static site deployment.
//!
//! A push to a repository's configured branch materializes the branch into a
//! per-repository workspace, optionally runs a build command there, and
//! publishes the output directory under the sites root.  Deployments of one
//! repository are serialized by a lock file; the live site is only ever
//! replaced by a complete release.

pub mod config;
pub mod lock;
pub mod pipeline;
pub mod publish;

pub use pipeline::{PagesPipeline, PipelineFailure, PipelineOutcome, SkipReason, Stage};
