//! Session orchestration: one worker task per project, driving the agent
//! through initializing, coding and build validation until the work-item
//! store reports everything passing.

pub mod lock;
mod manager;
pub mod phase;
mod runner;
pub mod session;

pub use lock::{OrphanedLock, RunLock, reconcile_locks};
pub use manager::{AgentManager, ManagerDeps, StatusReport};
pub use phase::{AgentPhase, AgentStatus, compute_phase};
pub use session::{LoopExit, Session};
