#![deny(dead_code)]
#![deny(unused_imports)]
pub mod concurrent;
pub mod count;
pub mod pipeline;
pub mod reader;
pub mod types;

pub use count::count_graph_elements;
pub use pipeline::{process_file, run_pipeline};
pub use reader::FragmentReader;
pub use types::{
    FragmentProcessor, PipelineConfig, PipelineError, ProcessingError, ProgressSnapshot,
    RecordCounts, RunSummary, RunningTotals,
};
