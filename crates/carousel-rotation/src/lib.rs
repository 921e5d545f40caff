//! carousel-rotation — the rotation controller.
//!
//! On a jittered timer, or when an operator asks, the controller swaps one
//! Active instance for a Standby one:
//!
//! ```text
//! Idle → SelectingCandidate → StartingCandidate → VerifyingCandidate
//!      → CuttingOverProxy → StoppingPrevious → Idle
//!                 ↘ RollingBack → Idle (from any phase after selection)
//! ```
//!
//! The controller is the only writer of `RotationState`. It runs as a
//! single task consuming one trigger channel, so cycles are serialized;
//! requests that arrive while a cycle is in flight are rejected with
//! `RotationInProgress`. Every phase is deadline-bound and a cycle always
//! ends in `Success`, `RolledBack` or `Failed`.
//!
//! The number of Active ∧ Healthy instances never drops below
//! `min_healthy` through a controller action: the retiring instance is
//! only stopped after the candidate is verified and routed, and not at all
//! if stopping it would breach the floor.

pub mod controller;
pub mod error;
pub mod handle;
pub mod schedule;
pub mod selection;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use controller::{ControllerDeps, ControllerSettings, RotationController};
pub use error::{RotationError, RotationResult};
pub use handle::RotationHandle;
pub use schedule::{JitterSchedule, TriggerTimer};
pub use state::RotationState;
