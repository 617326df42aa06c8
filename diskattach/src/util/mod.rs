//! Helpers shared by every layer.

mod command;
mod host;
mod logging;
mod process;

pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use host::{HostPaths, Readiness, is_within_roots};
pub use logging::init_logging;
pub use process::{find_processes, is_process_alive, is_same_process, terminate_process};
