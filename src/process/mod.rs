//! Subprocess lifecycle: spawn with piped output, stream lines, and tear down
//! whole process trees on stop.

mod supervisor;
pub mod tree;

pub use supervisor::{CommandSpec, LineHandler, OutputStream, ProcessExit, ProcessSupervisor};
