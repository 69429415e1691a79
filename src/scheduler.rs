use std::{
    any::Any,
    cell::{RefCell, UnsafeCell},
    collections::VecDeque,
    fmt,
    hash::{Hash, Hasher},
    ops::{Deref, DerefMut},
    panic::{catch_unwind, AssertUnwindSafe},
};

use fxhash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::{
    commands::{Command, CommandHandle, CommandTrait},
    conditions::ConditionalScheduler,
    follow::{Follower, FollowerHandle},
};

pub type SubsystemId = u64;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// No scheduler is installed on the current thread.
    #[error("no scheduler is installed on this thread")]
    Detached,
    /// A default command must require the subsystem it is bound to.
    #[error("default command does not require the subsystem it is bound to")]
    RequirementMismatch,
}

/// Mutations requested while the scheduler itself is on the stack. Drained in
/// `(to_schedule, to_cancel)` order at the end of each tick.
#[derive(Default)]
struct DeferredQueues {
    to_schedule: VecDeque<CommandHandle>,
    to_cancel: VecDeque<CommandHandle>,
    conditions: Vec<ConditionalScheduler>,
}

thread_local! {
    static DEFERRED: RefCell<Option<DeferredQueues>> = RefCell::new(None);
}

/// Asks the scheduler on this thread to run `handle`.
///
/// Callable from anywhere, including inside a running command's callbacks;
/// the request takes effect once the scheduler reaches its next drain point.
/// A command already waiting in the queue is not enqueued twice.
///
/// # Errors
/// - [`SchedulerError::Detached`] if the current thread has no scheduler.
pub fn schedule(handle: &CommandHandle) -> Result<(), SchedulerError> {
    DEFERRED.with(|queues| match &mut *queues.borrow_mut() {
        Some(queues) => {
            if !queues.to_schedule.iter().any(|queued| queued.ptr_eq(handle)) {
                queues.to_schedule.push_back(handle.clone());
            }
            Ok(())
        }
        None => Err(SchedulerError::Detached),
    })
}

/// Asks the scheduler on this thread to cancel `handle`.
///
/// A command that is still waiting in the schedule queue is simply removed
/// from it: it never initialized, so it receives no lifecycle calls at all.
///
/// # Errors
/// - [`SchedulerError::Detached`] if the current thread has no scheduler.
pub fn cancel(handle: &CommandHandle) -> Result<(), SchedulerError> {
    DEFERRED.with(|queues| match &mut *queues.borrow_mut() {
        Some(queues) => {
            if let Some(pending) = queues
                .to_schedule
                .iter()
                .position(|queued| queued.ptr_eq(handle))
            {
                let _ = queues.to_schedule.remove(pending);
            } else {
                queues.to_cancel.push_back(handle.clone());
            }
            Ok(())
        }
        None => Err(SchedulerError::Detached),
    })
}

/// Hands a condition watcher to the scheduler on this thread. It is adopted
/// at the start of the next tick.
pub(crate) fn watch(scheduler: ConditionalScheduler) -> Result<(), SchedulerError> {
    DEFERRED.with(|queues| match &mut *queues.borrow_mut() {
        Some(queues) => {
            queues.conditions.push(scheduler);
            Ok(())
        }
        None => Err(SchedulerError::Detached),
    })
}

pub trait Subsystem {
    /// The name of the subsystem, mainly used for logging. Also the basis of
    /// the subsystem's identity, so it has to be unique.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Constructs the subsystem, called when the subsystem is registered.
    fn construct() -> Self;

    /// Called once per tick by the scheduler, before any command runs.
    fn periodic(&mut self) {}

    /// The default command for the subsystem, if any. Re-scheduled by the
    /// scheduler whenever the subsystem is idle.
    fn default_command(&mut self) -> Option<Command> {
        None
    }

    /// A unique identifier for the subsystem.
    fn suid(&self) -> SubsystemId {
        let mut hasher = fxhash::FxHasher::default();
        self.name().hash(&mut hasher);
        hasher.finish()
    }
}

/// Anything that can stand in for a subsystem in a requirement list.
pub trait SubsystemRequirement {
    fn suid(&self) -> SubsystemId;
}
impl<T: Subsystem + 'static> SubsystemRequirement for SubsystemCell<T> {
    fn suid(&self) -> SubsystemId {
        self.get().suid()
    }
}

/// This type deliberately sidesteps Rust's aliasing rules; it cannot be
/// transferred between threads, and the control loop is single-threaded by
/// contract. It lets application code hold many handles to one subsystem the
/// way robot code typically wants to. The subsystem is leaked rather than
/// reference-counted so the scheduler's periodic callback can never dangle.
#[derive(Debug)]
pub struct SubsystemCell<T: Subsystem + 'static>(pub(crate) &'static UnsafeCell<T>);

impl<T: Subsystem + 'static> Clone for SubsystemCell<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<T: Subsystem + 'static> Copy for SubsystemCell<T> {}

impl<T: Subsystem> Deref for SubsystemCell<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0.get() }
    }
}

impl<T: Subsystem> DerefMut for SubsystemCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0.get() }
    }
}

impl<T: Subsystem + 'static> SubsystemCell<T> {
    /// Constructs the subsystem, immortalizes it, registers it with the
    /// scheduler, and installs its default command if it declares one.
    ///
    /// # Panics
    /// If the declared default command does not require this subsystem.
    #[must_use]
    pub fn generate(scheduler: &mut Scheduler) -> Self {
        let cell = Self(Box::leak(Box::new(UnsafeCell::new(T::construct()))));
        tracing::debug!("constructed subsystem {}", cell.name());
        scheduler.register_subsystem(&cell);
        if let Some(default) = cell.get_mut().default_command() {
            scheduler
                .set_default_command(&cell, default)
                .expect("default command must require its own subsystem");
        }
        cell
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn get(&self) -> &T {
        unsafe { &*self.0.get() }
    }

    /// Interior mutability for the subsystem.
    ///
    /// # Safety
    /// Multiple live mutable references to the same subsystem are possible
    /// through this; the cell is not `Send` or `Sync`, so only code on the
    /// control thread can collide with itself.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    #[must_use]
    #[doc(hidden)]
    #[allow(clippy::missing_const_for_fn)]
    pub(crate) unsafe fn immortal_mut(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Subsystem + Follower + 'static> SubsystemCell<T> {
    /// A copyable handle exposing this subsystem's follower capability,
    /// carrying the subsystem id a follow command must require.
    #[must_use]
    pub fn follower(&self) -> FollowerHandle {
        FollowerHandle::new(self.0, self.suid())
    }
}

/// Where in a command's lifecycle a caught panic surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStage {
    Initialize,
    Execute,
    IsFinished,
    End,
    Periodic,
}
impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initialize => "initialize",
            Self::Execute => "execute",
            Self::IsFinished => "is_finished",
            Self::End => "end",
            Self::Periodic => "periodic",
        };
        f.write_str(label)
    }
}

/// A caught panic from a command callback or a subsystem periodic.
#[derive(Debug)]
pub struct CommandFault {
    pub command: String,
    pub stage: FaultStage,
    pub message: String,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("opaque panic payload")
    }
}

enum Deferred {
    Schedule(CommandHandle),
    Cancel(CommandHandle),
}

/// The single-threaded cooperative executor.
///
/// Owns the set of currently running commands, arbitrates subsystem
/// ownership, runs subsystem periodic callbacks, re-seeds default commands,
/// and defers structural mutations requested while it is iterating.
pub struct Scheduler {
    registered: FxHashSet<SubsystemId>,
    periodic_callbacks: Vec<(SubsystemId, Box<dyn FnMut()>)>,
    scheduled: Vec<CommandHandle>,
    ownership: FxHashMap<SubsystemId, CommandHandle>,
    defaults: FxHashMap<SubsystemId, CommandHandle>,
    conditions: Vec<ConditionalScheduler>,
    error_sink: Box<dyn FnMut(&CommandFault)>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        DEFERRED.with(|queues| {
            *queues.borrow_mut() = Some(DeferredQueues::default());
        });
        Self {
            registered: FxHashSet::default(),
            periodic_callbacks: Vec::new(),
            scheduled: Vec::new(),
            ownership: FxHashMap::default(),
            defaults: FxHashMap::default(),
            conditions: Vec::new(),
            error_sink: Box::new(|fault| {
                tracing::error!(
                    command = %fault.command,
                    stage = %fault.stage,
                    "command fault: {}",
                    fault.message
                );
            }),
        }
    }

    /// Replaces the sink that receives caught command faults. The default
    /// sink logs them.
    pub fn set_error_sink(&mut self, sink: impl FnMut(&CommandFault) + 'static) {
        self.error_sink = Box::new(sink);
    }

    /// Adds the subsystem to the periodic-callback list. Idempotent.
    pub fn register_subsystem<T: Subsystem + 'static>(&mut self, cell: &SubsystemCell<T>) {
        let suid = cell.suid();
        if !self.registered.insert(suid) {
            return;
        }
        let immortal = unsafe { cell.immortal_mut() };
        self.periodic_callbacks.push((
            suid,
            Box::new(move || unsafe {
                (&mut *immortal).periodic();
            }),
        ));
        tracing::debug!("registered subsystem {}", cell.name());
    }

    /// Binds `command` as the default for `subsystem`, replacing any prior
    /// default. The default enters the running set at the end of the next
    /// tick on which the subsystem is idle.
    ///
    /// # Errors
    /// - [`SchedulerError::RequirementMismatch`] if the command does not
    ///   require the subsystem.
    pub fn set_default_command(
        &mut self,
        subsystem: &impl SubsystemRequirement,
        command: impl Into<Command>,
    ) -> Result<CommandHandle, SchedulerError> {
        let suid = subsystem.suid();
        let command = command.into();
        if !command.requirements().contains(&suid) {
            return Err(SchedulerError::RequirementMismatch);
        }
        let handle = CommandHandle::new(command);
        self.defaults.insert(suid, handle.clone());
        Ok(handle)
    }

    /// Admits `handle` into the running set now.
    ///
    /// Any current holder of a required subsystem is interrupted first, its
    /// `end(true)` running before this command's `initialize`. Scheduling a
    /// command that is already running is a no-op.
    pub fn schedule(&mut self, handle: &CommandHandle) {
        self.admit(handle);
        self.settle();
    }

    /// Wraps `command` in a handle, schedules it, and returns the handle.
    pub fn schedule_command(&mut self, command: impl Into<Command>) -> CommandHandle {
        let handle = CommandHandle::new(command.into());
        self.schedule(&handle);
        handle
    }

    /// Removes `handle` from the running set with `end(interrupted = true)`.
    /// A no-op if the command is not running.
    pub fn cancel(&mut self, handle: &CommandHandle) {
        self.cancel_now(handle);
        self.settle();
    }

    /// Interrupts every running command.
    pub fn cancel_all(&mut self) {
        for handle in self.scheduled.clone() {
            self.cancel_now(&handle);
        }
        self.settle();
    }

    #[must_use]
    pub fn is_scheduled(&self, handle: &CommandHandle) -> bool {
        self.scheduled.iter().any(|running| running.ptr_eq(handle))
    }

    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    /// The command currently holding `subsystem`, if any.
    #[must_use]
    pub fn holder_of(&self, subsystem: &impl SubsystemRequirement) -> Option<CommandHandle> {
        self.ownership.get(&subsystem.suid()).cloned()
    }

    /// One scheduler step: subsystem periodics, condition polls, one
    /// `execute`/`is_finished` round for every running command in insertion
    /// order, deferred-mutation drain, default re-seeding.
    pub fn tick(&mut self) {
        self.adopt_conditions();
        self.run_periodics();
        self.poll_conditions();
        self.run_commands();
        self.settle();
        tracing::trace!("scheduler tick complete");
    }

    /// Clears all scheduler state. Running commands are interrupted first.
    /// Calling `reset` twice is the same as calling it once.
    pub fn reset(&mut self) {
        for handle in self.scheduled.clone() {
            self.cancel_now(&handle);
        }
        self.scheduled.clear();
        self.ownership.clear();
        self.defaults.clear();
        self.conditions.clear();
        self.registered.clear();
        self.periodic_callbacks.clear();
        DEFERRED.with(|queues| {
            if let Some(queues) = queues.borrow_mut().as_mut() {
                queues.to_schedule.clear();
                queues.to_cancel.clear();
                queues.conditions.clear();
            }
        });
    }

    /// Registers a condition watcher directly: on any tick where its
    /// condition evaluates to true, its command is scheduled.
    pub fn watch(&mut self, watcher: ConditionalScheduler) {
        self.conditions.push(watcher);
    }

    fn adopt_conditions(&mut self) {
        let mut incoming = DEFERRED.with(|queues| {
            queues
                .borrow_mut()
                .as_mut()
                .map(|queues| std::mem::take(&mut queues.conditions))
                .unwrap_or_default()
        });
        self.conditions.append(&mut incoming);
    }

    fn run_periodics(&mut self) {
        for (suid, callback) in &mut self.periodic_callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                let fault = CommandFault {
                    command: format!("subsystem {suid:#018x}"),
                    stage: FaultStage::Periodic,
                    message: panic_message(&*payload),
                };
                (self.error_sink)(&fault);
            }
        }
    }

    fn poll_conditions(&mut self) {
        for watcher in &mut self.conditions {
            if let Some(handle) = watcher.poll() {
                // Fires go through the deferred queue and take effect at the
                // end of this tick.
                let _ = schedule(&handle);
            }
        }
    }

    fn run_commands(&mut self) {
        let snapshot = self.scheduled.clone();
        for handle in snapshot {
            if !self.is_scheduled(&handle) {
                continue;
            }
            if self
                .guarded(&handle, FaultStage::Execute, |command| command.execute())
                .is_err()
            {
                self.force_remove(&handle);
                continue;
            }
            match self.guarded(&handle, FaultStage::IsFinished, |command| {
                command.is_finished()
            }) {
                Err(()) => self.force_remove(&handle),
                Ok(true) => {
                    let _ = self.guarded(&handle, FaultStage::End, |command| command.end(false));
                    self.remove(&handle);
                }
                Ok(false) => {}
            }
        }
    }

    /// Drains deferred mutations and re-seeds defaults until both are quiet.
    /// Admissions performed here can themselves defer more work, hence the
    /// loop.
    fn settle(&mut self) {
        loop {
            self.drain_deferred();
            if !self.reseed_defaults() {
                break;
            }
        }
    }

    fn drain_deferred(&mut self) {
        loop {
            let next = DEFERRED.with(|queues| {
                let mut queues = queues.borrow_mut();
                let queues = queues.as_mut()?;
                if let Some(handle) = queues.to_schedule.pop_front() {
                    Some(Deferred::Schedule(handle))
                } else {
                    queues.to_cancel.pop_front().map(Deferred::Cancel)
                }
            });
            match next {
                Some(Deferred::Schedule(handle)) => self.admit(&handle),
                Some(Deferred::Cancel(handle)) => self.cancel_now(&handle),
                None => break,
            }
        }
    }

    /// Schedules the default of every idle subsystem, in registration order.
    /// Returns whether anything was admitted.
    fn reseed_defaults(&mut self) -> bool {
        let order: Vec<SubsystemId> = self
            .periodic_callbacks
            .iter()
            .map(|(suid, _)| *suid)
            .collect();
        let mut admitted = false;
        for suid in order {
            if self.ownership.contains_key(&suid) {
                continue;
            }
            let Some(default) = self.defaults.get(&suid).cloned() else {
                continue;
            };
            self.admit(&default);
            admitted = true;
        }
        admitted
    }

    /// The admission algorithm. Interrupted holders observe `end(true)`
    /// before the incoming command observes `initialize`.
    fn admit(&mut self, handle: &CommandHandle) {
        if self.is_scheduled(handle) {
            return;
        }
        let requirements = handle.requirements();
        let mut holders: Vec<CommandHandle> = Vec::new();
        for suid in &requirements {
            if let Some(holder) = self.ownership.get(suid) {
                if !holders.iter().any(|seen| seen.ptr_eq(holder)) {
                    holders.push(holder.clone());
                }
            }
        }
        for holder in holders {
            self.cancel_now(&holder);
        }
        self.scheduled.push(handle.clone());
        for suid in requirements {
            self.ownership.insert(suid, handle.clone());
        }
        if self
            .guarded(handle, FaultStage::Initialize, |command| command.initialize())
            .is_err()
        {
            // The command never successfully initialized, so no end call.
            self.remove(handle);
        }
    }

    fn cancel_now(&mut self, handle: &CommandHandle) {
        if !self.is_scheduled(handle) {
            return;
        }
        let _ = self.guarded(handle, FaultStage::End, |command| command.end(true));
        self.remove(handle);
    }

    /// Removal after a fault in `execute`/`is_finished`: the command did
    /// initialize, so it is still owed an `end(true)`.
    fn force_remove(&mut self, handle: &CommandHandle) {
        let _ = self.guarded(handle, FaultStage::End, |command| command.end(true));
        self.remove(handle);
    }

    fn remove(&mut self, handle: &CommandHandle) {
        self.scheduled.retain(|running| !running.ptr_eq(handle));
        self.ownership.retain(|_, holder| !holder.ptr_eq(handle));
    }

    fn guarded<R>(
        &mut self,
        handle: &CommandHandle,
        stage: FaultStage,
        op: impl FnOnce(&mut Command) -> R,
    ) -> Result<R, ()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut command = handle.borrow_mut();
            op(&mut *command)
        }));
        match outcome {
            Ok(value) => Ok(value),
            Err(payload) => {
                let fault = CommandFault {
                    command: handle.name(),
                    stage,
                    message: panic_message(&*payload),
                };
                (self.error_sink)(&fault);
                Err(())
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tracing::debug!("dropping scheduler");
        DEFERRED.with(|queues| {
            *queues.borrow_mut() = None;
        });
    }
}
