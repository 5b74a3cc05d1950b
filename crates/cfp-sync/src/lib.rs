//! Reconciliation pipeline from raw source records to the canonical store and
//! its year-partitioned archive.

pub mod config;
pub mod enrich;
pub mod lifecycle;
pub mod matcher;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod validate;

pub const CRATE_NAME: &str = "cfp-sync";

pub use config::{PipelineConfig, SourceConfig, SourceRegistry};
pub use enrich::{Geocoder, LinkChecker, LinkStatus};
pub use matcher::{IdentityMatcher, MatchOutcome, MatcherConfig};
pub use pipeline::{run_once_from_env, run_with_config, ReconcilePipeline, RunSummary};
pub use report::report_recent_markdown;
