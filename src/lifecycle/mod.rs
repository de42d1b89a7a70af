//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (shutdown.rs):
//!     pool connects → register(disconnect hook) → registry
//!
//! Startup (startup.rs):
//!     connect every label → subscribe every channel
//!         → any failure → trigger("startup … failed")
//!
//! Triggers (signals.rs + explicit):
//!     SIGINT / SIGQUIT / SIGTERM → trigger("SIG… caught")
//!     request_exit()             → trigger("process.exit caught")
//!
//! Cleanup (shutdown.rs):
//!     first trigger → Idle → Cleaning → spawn all hooks
//!         → settle all within one deadline → Terminated → exit code
//! ```
//!
//! # Design Decisions
//! - Exactly one trigger is acted upon; the rest return immediately
//! - Registrations after the first trigger are dropped, not queued
//! - Timeout beats hook failure when choosing the exit code
//! - Hooks left running at the deadline are abandoned, not aborted

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod types;

pub use shutdown::ExitCoordinator;
pub use types::{ExitOutcome, ExitReport, ExitState, HookError, HookStatus, ProcessExit, Terminator};
