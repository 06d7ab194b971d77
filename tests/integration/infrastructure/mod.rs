pub mod health_stub;
pub mod process_harness;

pub use health_stub::HealthStub;
pub use process_harness::{read_pid, wait_until_dead, CliTestHarness};
