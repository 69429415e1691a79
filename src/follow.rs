//! Glue between the command model and the motion-control collaborator.
//!
//! The follower itself is opaque: the core only starts it, polls it, and
//! stops it. Everything geometric beyond handing over a
//! [`PathChain`](crate::geometry::PathChain) stays on the follower's side of
//! the fence.

use std::{cell::UnsafeCell, fmt::Debug, rc::Rc};

use fxhash::FxHashMap;
use thiserror::Error;

use crate::{
    commands::{Command, CommandTrait},
    geometry::{wrap_angle, PathChain, PathChainBuilder, PathSegment, Pose},
    scheduler::{SubsystemId, SubsystemRequirement},
};

/// The motion-control capability a follow command drives.
///
/// The turn and progress accessors are optional; followers that do not track
/// them inherit inert defaults.
pub trait Follower {
    /// Begin tracking `chain`. `max_power` is in `[0, 1]`; `hold_end`
    /// requests active position holding after the chain completes.
    fn follow(&mut self, chain: &PathChain, max_power: f64, hold_end: bool);

    /// Whether the follower is still actively tracking.
    fn is_busy(&self) -> bool;

    /// Request an immediate stop.
    fn break_following(&mut self);

    /// The current robot pose.
    fn pose(&self) -> Pose;

    fn is_turning(&self) -> bool {
        false
    }

    fn turn_to(&mut self, _target: f64) {}

    /// Index of the chain segment currently being tracked.
    fn chain_index(&self) -> usize {
        0
    }

    /// Parametric progress along the current segment, in `[0, 1]`.
    fn current_t_value(&self) -> f64 {
        0.0
    }
}

/// A copyable handle to a follower subsystem.
///
/// Obtained from [`SubsystemCell::follower`](crate::scheduler::SubsystemCell),
/// so it always points at an immortalized subsystem and carries the subsystem
/// id a follow command must require. Like the cell it comes from, it trades
/// aliasing guarantees for the many-handles ergonomics robot code wants; it
/// is not `Send` or `Sync`.
#[derive(Clone, Copy)]
pub struct FollowerHandle {
    cell: &'static UnsafeCell<dyn Follower>,
    suid: SubsystemId,
}

impl FollowerHandle {
    pub(crate) fn new(cell: &'static UnsafeCell<dyn Follower>, suid: SubsystemId) -> Self {
        Self { cell, suid }
    }

    #[must_use]
    pub fn suid(&self) -> SubsystemId {
        self.suid
    }

    pub fn with<R>(&self, op: impl FnOnce(&dyn Follower) -> R) -> R {
        op(unsafe { &*self.cell.get() })
    }

    pub fn with_mut<R>(&self, op: impl FnOnce(&mut dyn Follower) -> R) -> R {
        op(unsafe { &mut *self.cell.get() })
    }
}
impl SubsystemRequirement for FollowerHandle {
    fn suid(&self) -> SubsystemId {
        self.suid
    }
}
impl Debug for FollowerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowerHandle")
            .field("suid", &self.suid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PathError {
    /// The chain has been materialized; segments can no longer be added.
    #[error("path builder is frozen once its chain has been materialized")]
    BuilderFrozen,
    /// There is no chain and no segments to build one from.
    #[error("follow-path command has no chain and no segments to build one")]
    ChainUnbuilt,
}

/// Starts a follower on a chain and finishes when the follower goes idle.
///
/// `execute` is deliberately empty: the host loop advances the follower.
/// Built either around a finished chain or as a lazy builder that
/// materializes its chain on first `initialize`; once materialized, further
/// segment pushes fail with [`PathError::BuilderFrozen`].
pub struct FollowPathCommand {
    follower: FollowerHandle,
    chain: Option<Rc<PathChain>>,
    builder: Option<PathChainBuilder>,
    frozen: bool,
    failed: bool,
    max_power: f64,
    hold_end: bool,
}

impl FollowPathCommand {
    /// A follow command over an already-built chain.
    #[must_use]
    pub fn new(follower: FollowerHandle, chain: PathChain) -> Self {
        Self {
            follower,
            chain: Some(Rc::new(chain)),
            builder: None,
            frozen: true,
            failed: false,
            max_power: 1.0,
            hold_end: false,
        }
    }

    /// The lazy variant: collects segments and materializes the chain on
    /// first `initialize`.
    #[must_use]
    pub fn build(follower: FollowerHandle) -> Self {
        Self {
            follower,
            chain: None,
            builder: Some(PathChainBuilder::new()),
            frozen: false,
            failed: false,
            max_power: 1.0,
            hold_end: false,
        }
    }

    /// Appends a segment to the pending chain.
    ///
    /// # Errors
    /// - [`PathError::BuilderFrozen`] once the chain has been materialized.
    pub fn segment(mut self, segment: PathSegment) -> Result<Self, PathError> {
        self.push_segment(segment)?;
        Ok(self)
    }

    /// Appends a segment in place, e.g. through a
    /// [`CommandHandle::apply`](crate::commands::CommandHandle::apply).
    ///
    /// # Errors
    /// - [`PathError::BuilderFrozen`] once the chain has been materialized.
    pub fn push_segment(&mut self, segment: PathSegment) -> Result<(), PathError> {
        match self.builder.as_mut() {
            Some(builder) if !self.frozen => {
                builder.push(segment);
                Ok(())
            }
            _ => Err(PathError::BuilderFrozen),
        }
    }

    #[must_use]
    pub fn with_max_power(mut self, max_power: f64) -> Self {
        self.max_power = max_power.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_hold_end(mut self, hold_end: bool) -> Self {
        self.hold_end = hold_end;
        self
    }

    /// The materialized chain, if there is one yet.
    #[must_use]
    pub fn chain(&self) -> Option<Rc<PathChain>> {
        self.chain.clone()
    }

    fn materialize(&mut self) -> Result<Rc<PathChain>, PathError> {
        if let Some(chain) = &self.chain {
            return Ok(chain.clone());
        }
        match self.builder.take() {
            Some(builder) if !builder.is_empty() => {
                let chain = Rc::new(builder.build());
                self.chain = Some(chain.clone());
                self.frozen = true;
                Ok(chain)
            }
            _ => Err(PathError::ChainUnbuilt),
        }
    }
}

impl CommandTrait for FollowPathCommand {
    fn initialize(&mut self) {
        self.failed = false;
        match self.materialize() {
            Ok(chain) => {
                self.follower
                    .with_mut(|follower| follower.follow(&chain, self.max_power, self.hold_end));
            }
            Err(error) => {
                tracing::error!("follow-path initialize failed: {error}");
                self.failed = true;
            }
        }
    }

    fn is_finished(&mut self) -> bool {
        self.failed || self.follower.with(|follower| !follower.is_busy())
    }

    fn end(&mut self, interrupted: bool) {
        if interrupted {
            self.follower.with_mut(|follower| follower.break_following());
        }
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        vec![self.follower.suid]
    }

    fn name(&self) -> String {
        String::from("follow-path")
    }
}

impl Debug for FollowPathCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowPathCommand")
            .field("follower", &self.follower)
            .field("chain", &self.chain)
            .field("frozen", &self.frozen)
            .field("max_power", &self.max_power)
            .field("hold_end", &self.hold_end)
            .finish()
    }
}

impl From<FollowPathCommand> for Command {
    fn from(command: FollowPathCommand) -> Self {
        Self::FollowPath(command)
    }
}

#[derive(Debug, Clone)]
struct TurnState {
    name: String,
    start: f64,
    target: f64,
    progress: f64,
}

/// Tracks progress along the follower's current path and chain, and fires
/// named one-shot events as thresholds are crossed.
///
/// Not a command; routine builders poll it from `WaitUntil` predicates.
#[derive(Debug)]
pub struct ProgressTracker {
    follower: FollowerHandle,
    segment_count: usize,
    path_progress: f64,
    chain_progress: f64,
    thresholds: FxHashMap<String, f64>,
    fired: FxHashMap<String, bool>,
    turn: Option<TurnState>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(follower: FollowerHandle) -> Self {
        Self {
            follower,
            segment_count: 0,
            path_progress: 0.0,
            chain_progress: 0.0,
            thresholds: FxHashMap::default(),
            fired: FxHashMap::default(),
            turn: None,
        }
    }

    /// Tells the tracker how long the chain being followed is, so chain
    /// progress can be normalized.
    pub fn bind_chain(&mut self, chain: &PathChain) {
        self.segment_count = chain.len();
        self.path_progress = 0.0;
        self.chain_progress = 0.0;
    }

    /// Registers a one-shot event fired when path progress reaches
    /// `threshold`. Thresholds are clamped into `[0, 1]`.
    pub fn add_event(&mut self, name: impl Into<String>, threshold: f64) {
        let name = name.into();
        self.thresholds
            .insert(name.clone(), threshold.clamp(0.0, 1.0));
        self.fired.insert(name, false);
    }

    /// Progress along the current path segment, in `[0, 1]`.
    #[must_use]
    pub fn path_progress(&self) -> f64 {
        self.path_progress
    }

    /// Progress along the whole chain, in `[0, 1]`.
    #[must_use]
    pub fn chain_progress(&self) -> f64 {
        self.chain_progress
    }

    /// Re-reads the follower. Called implicitly by
    /// [`ProgressTracker::should_trigger`].
    pub fn update(&mut self) {
        let t = self
            .follower
            .with(|follower| follower.current_t_value())
            .clamp(0.0, 1.0);
        self.path_progress = t;
        if self.segment_count > 0 {
            let index = self
                .follower
                .with(|follower| follower.chain_index())
                .min(self.segment_count - 1);
            self.chain_progress =
                ((index as f64 + t) / self.segment_count as f64).clamp(0.0, 1.0);
        }
        if let Some(turn) = self.turn.as_mut() {
            let heading = self.follower.with(|follower| follower.pose().heading);
            let total = wrap_angle(turn.target - turn.start);
            let travelled = wrap_angle(heading - turn.start);
            turn.progress = if total.abs() < f64::EPSILON {
                1.0
            } else {
                (travelled / total).clamp(0.0, 1.0)
            };
        }
    }

    /// True exactly once: the first poll after the event's progress passes
    /// its threshold.
    pub fn should_trigger(&mut self, name: &str) -> bool {
        self.update();
        let Some(&threshold) = self.thresholds.get(name) else {
            return false;
        };
        let progress = match &self.turn {
            Some(turn) if turn.name == name => turn.progress,
            _ => self.path_progress,
        };
        let Some(fired) = self.fired.get_mut(name) else {
            return false;
        };
        if *fired || progress < threshold {
            return false;
        }
        *fired = true;
        true
    }

    /// Enters turn-tracking mode: asks the follower to turn to `target`,
    /// records the current heading as the start, and registers `name` as a
    /// one-shot event fired when the normalized angular progress reaches
    /// `threshold`. Progress is measured against the signed shortest delta,
    /// wrapped to `[-pi, pi]`.
    pub fn start_turn(&mut self, target: f64, name: impl Into<String>, threshold: f64) {
        let name = name.into();
        let start = self.follower.with(|follower| follower.pose().heading);
        self.follower.with_mut(|follower| follower.turn_to(target));
        self.add_event(name.clone(), threshold);
        self.turn = Some(TurnState {
            name,
            start,
            target,
            progress: 0.0,
        });
    }

    /// Normalized angular progress of the active turn, in `[0, 1]`.
    #[must_use]
    pub fn turn_progress(&self) -> f64 {
        self.turn.as_ref().map_or(0.0, |turn| turn.progress)
    }

    /// Whether the follower reports the active turn as done.
    #[must_use]
    pub fn turn_complete(&self) -> bool {
        self.turn.is_some() && self.follower.with(|follower| !follower.is_turning())
    }

    /// Clears all progress, fired flags, and any active turn.
    pub fn reset(&mut self) {
        self.path_progress = 0.0;
        self.chain_progress = 0.0;
        for fired in self.fired.values_mut() {
            *fired = false;
        }
        self.turn = None;
    }
}
