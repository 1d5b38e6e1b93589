mod container_runner;

pub use container_runner::{parse_logs, ContainerRunner};
