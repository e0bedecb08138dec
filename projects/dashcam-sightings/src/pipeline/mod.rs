// Vehicle sighting pipeline: detection, tracking, merge, export and composition

pub mod bridge;
pub mod compositor;
pub mod detection;
pub mod export;
pub mod merge;
pub mod orchestrator;
pub mod scanner;
#[cfg(test)]
pub mod test_support;
pub mod tracker;
pub mod types;
