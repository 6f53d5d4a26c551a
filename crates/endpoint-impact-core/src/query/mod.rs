pub mod backend;
pub mod engine;
pub mod guards;
pub mod import_graph;
pub mod mapper;
pub mod reachability;
pub mod registry;
pub mod tracer;
