pub mod core;
pub mod export;
pub mod ingest;
pub mod jobs;
pub mod setup;
pub mod students;
