pub mod artifact;
pub mod bpf;
pub mod chain;
pub mod config;
pub mod errors;
pub mod export;
pub mod model;
pub mod supervisor;
