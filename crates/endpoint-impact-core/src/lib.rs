//! Endpoint impact core library.
//!
//! Given the HTTP entry points of a Python web application and the files a
//! change touched, works out which entry points the change can affect, how
//! confident that verdict is, and the call path that connects them. Changed
//! code no entry point reaches is reported separately as orphaned.
//!
//! The pipeline is: index the project sources ([`indexer`]), resolve each
//! entry point's dependencies with a [`query::backend::DependencyBackend`],
//! persist them in the [`store::cache::AnalysisCache`], then map every
//! changed file onto the entry points it reaches ([`query::mapper`]).

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod store;

pub use config::{AnalyzerConfig, BackendKind};
pub use errors::{ImpactError, ImpactResult};
pub use models::{
    AnalysisReport, ChangeKind, ChangedFile, Confidence, DiffHunk, EntryPoint,
    EntryPointDependencies, HandlerLocation, HttpMethod, ImpactFinding, OrphanChange,
    ProgressCallback, ProgressEvent, SymbolReference, Trace, TraceFrame,
};
pub use query::engine::{DiffSource, EntryPointSource, ImpactAnalyzer};
pub use query::registry::EntryPointRegistry;
pub use store::cache::{AnalysisCache, DependencyMap};
