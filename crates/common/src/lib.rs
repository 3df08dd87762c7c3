// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod command;
pub mod fs;
pub mod scheduler;
pub mod signature;

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use scheduler::{Scheduler, TimerHandle};
