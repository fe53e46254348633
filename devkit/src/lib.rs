/*!
# LabControl DevKit - test harness for the kernel

- temporary lab directories with a file-backed store
- board, resource and user record builders
- helper scripts standing in for power controllers and capture tools
- polling helpers for detached processes
*/

pub mod fixtures;
pub mod harness;

pub use fixtures::{user, write_script, BoardBuilder, ResourceBuilder};
pub use harness::{init_tracing, wait_for_file, wait_until, LabHarness};
