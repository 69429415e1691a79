//! A command-based control framework for path-following robots.
//!
//! Application code composes long-running, interruptible commands over a
//! small set of shared subsystems; a single-threaded [`Scheduler`] ticks
//! them cooperatively at the host loop's cadence, arbitrating subsystem
//! ownership and re-seeding default commands as subsystems go idle.
//!
//! # Examples
//!
//! ## Scheduling a command against a ticking scheduler
//! ```
//! use pursuit_commands::{CommandBuilder, Scheduler};
//! use std::time::Duration;
//!
//! let mut scheduler = Scheduler::new();
//!
//! scheduler.schedule_command(
//!     CommandBuilder::new()
//!         .initialize(|| println!("deploying intake"))
//!         .execute(|| println!("holding intake out"))
//!         .build()
//!         .with_timeout(Duration::from_millis(60)),
//! );
//!
//! for _ in 0..5 {
//!     scheduler.tick();
//!     std::thread::sleep(Duration::from_millis(20));
//! }
//! ```

pub mod adapter;
pub mod commands;
pub mod conditions;
pub mod follow;
pub mod geometry;
pub mod groups;
pub mod registry;
pub mod routine;
pub mod scheduler;
pub mod telemetry;
#[cfg(test)]
mod test;

pub use commands::*;
pub use conditions::Condition;
pub use follow::{FollowPathCommand, Follower, FollowerHandle, PathError, ProgressTracker};
pub use geometry::{
    wrap_angle, HeadingInterpolation, PathChain, PathChainBuilder, PathSegment, Point, Pose,
};
pub use groups::{CommandError, ParallelGroup, ParallelMode, SequentialGroup};
pub use scheduler::{
    CommandFault, FaultStage, Scheduler, SchedulerError, Subsystem, SubsystemCell, SubsystemId,
    SubsystemRequirement,
};
pub use telemetry::{PoseChannel, TelemetryServer};

/// Clones local variables before moving them into a closure.
///
/// Commands capture a lot of shared handles; this keeps the clone-then-move
/// dance out of call sites.
///
/// # Examples
/// ```
/// use pursuit_commands::{clone_mv, CommandBuilder};
///
/// let label = String::from("intake");
/// let samples: Vec<f64> = Vec::new();
///
/// let command = CommandBuilder::new()
///     .initialize(clone_mv!(samples, label >> || println!("{label}: {samples:?}")))
///     .execute(clone_mv!(samples >> || {
///         println!("samples so far: {samples:?}");
///     }))
///     .build();
/// # let _ = command;
/// ```
#[macro_export]
macro_rules! clone_mv {
    ($($name:ident),* >> |$($arg:ident),*| $body:expr) => {
        {
            $(let $name = $name.clone();)*
            move |$($arg),*| $body
        }
    };
    ($($name:ident),* >> || $body:expr) => {
        {
            $(let $name = $name.clone();)*
            move || $body
        }
    };
}
