mod local_runner;

pub use local_runner::{parse_output_log, LocalRunner};
