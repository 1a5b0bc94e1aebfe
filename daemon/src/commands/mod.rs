pub mod cli;
pub mod daemon;

pub use cli::{Cli, DaemonCliCommand};
pub use daemon::{DaemonCommand, StatusCommand, StopCommand};
