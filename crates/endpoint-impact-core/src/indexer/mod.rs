pub mod filesystem;
pub mod imports;
pub mod parser;
pub mod pipeline;
pub mod semantic;
pub mod symbols;
