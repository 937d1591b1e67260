//! # Reconcile
//!
//! Plan and apply engine for declaratively configured remote resources.
//!
//! A configuration declares notification channels, watchlists, and custom
//! agents. The engine fingerprints each declared resource, compares it with
//! the hash recorded the last time it was applied, and produces a plan of
//! creates, updates, replacements, and deletions in dependency order.
//! Applying the plan calls a [`Provider`] per resource and records each
//! success in a local state file.
//!
//! ## Core Concepts
//!
//! - **Fingerprint**: Canonical SHA-256 of a resource's JSON configuration
//! - **StateFile**: `.state/state.json`, what was last applied and its remote id
//! - **ExecutionPlan**: Ordered changes with diffs, risk, and warnings
//! - **Executor**: Applies a plan with bounded concurrency under a lock
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     Executor, ExecuteOptions, NoProgress, PlanOptions, ProviderRegistry,
//!     RunContext, StateStore, generate_plan,
//! };
//!
//! let context = RunContext::new(".");
//! let store = StateStore::new(&context);
//! let plan = generate_plan(&store, &config, &PlanOptions::default())?;
//!
//! let executor = Executor::new(&store, ProviderRegistry::all(my_provider));
//! let result = executor.execute(&plan, &config, &ExecuteOptions::default(), &mut NoProgress)?;
//! if !result.success {
//!     eprintln!("needs attention: {:?}", result.manual_followup);
//! }
//! ```
//!
//! ## Extension Traits
//!
//! - [`Provider`]: Remote create, update, delete for one resource kind
//! - [`ProgressCallback`]: Receives per-resource progress during apply
//! - [`ProcessProbe`]: Decides whether a lock holder is still running

pub mod canonical;
pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod plan;
pub mod planner;
pub mod rate_limit;
pub mod retry;
pub mod state;
pub mod types;

pub use config::ParsedConfig;
pub use context::{CancelToken, NoProgress, ProgressCallback, RunContext};
pub use diff::{DiffOptions, DiffResult, deep_compare};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{
    ExecuteOptions, ExecutionReadiness, ExecutionResult, ExecutionStatus, Executor, Provider,
    ProviderOutcome, ProviderRegistry, ResourceExecutionResult,
};
pub use fingerprint::{fingerprint, fingerprints_equal};
pub use graph::DependencyGraph;
pub use plan::{ExecutionPlan, PlanFile, PlanWarning, WarningSeverity};
pub use planner::{PlanOptions, generate_plan};
pub use retry::RetryConfig;
pub use state::{
    AppliedResource, LockOperation, ProcessProbe, StateComparison, StateEntry, StateFile,
    StateStore,
};
pub use types::{ChangeType, FieldDiff, ResourceChange, ResourceConfig, ResourceKind, RiskLevel};
