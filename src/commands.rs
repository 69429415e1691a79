use std::{
    cell::{RefCell, RefMut},
    fmt::Debug,
    hash::{Hash, Hasher},
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    adapter::ForeignCommand,
    conditions::Condition,
    follow::FollowPathCommand,
    groups::{CommandError, ParallelGroup, ParallelMode, SequentialGroup},
    scheduler::{self, SchedulerError, SubsystemId},
};

pub trait CommandTrait {
    /// Called once when the command enters the running set.
    fn initialize(&mut self) {}

    /// Called once per tick while the command is running.
    fn execute(&mut self) {}

    /// Called exactly once when the command leaves the running set.
    /// `interrupted` is true if the command did not finish on its own.
    fn end(&mut self, _interrupted: bool) {}

    /// Polled after `execute` each tick.
    fn is_finished(&mut self) -> bool {
        false
    }

    /// The subsystems this command needs. Fixed for the lifetime of the command.
    fn requirements(&self) -> Vec<SubsystemId> {
        Vec::new()
    }

    /// Display name, mainly for logging.
    fn name(&self) -> String {
        String::from("unnamed command")
    }
}

/// Builds a [`SimpleCommand`] out of individual lifecycle closures.
///
/// Closures that are left out behave as no-ops, with `is_finished`
/// defaulting to false.
pub struct CommandBuilder {
    initialize: Option<Box<dyn FnMut()>>,
    execute: Option<Box<dyn FnMut()>>,
    end: Option<Box<dyn FnMut(bool)>>,
    is_finished: Option<Box<dyn FnMut() -> bool>>,
    requirements: Vec<SubsystemId>,
}
impl Debug for CommandBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("CommandBuilder")
            .field("initialize", &self.initialize.is_some())
            .field("execute", &self.execute.is_some())
            .field("end", &self.end.is_some())
            .field("is_finished", &self.is_finished.is_some())
            .field("requirements", &self.requirements)
            .finish()
    }
}

impl CommandBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initialize: None,
            execute: None,
            end: None,
            is_finished: None,
            requirements: Vec::new(),
        }
    }

    /// Defines the `initialize` closure for this command.
    #[must_use]
    pub fn initialize(mut self, initialize: impl FnMut() + 'static) -> Self {
        self.initialize = Some(Box::new(initialize));
        self
    }

    /// Defines the `execute` closure for this command.
    #[must_use]
    pub fn execute(mut self, execute: impl FnMut() + 'static) -> Self {
        self.execute = Some(Box::new(execute));
        self
    }

    /// Defines the `end` closure for this command.
    #[must_use]
    pub fn end(mut self, end: impl FnMut(bool) + 'static) -> Self {
        self.end = Some(Box::new(end));
        self
    }

    /// Defines the `is_finished` closure for this command.
    #[must_use]
    pub fn is_finished(mut self, is_finished: impl FnMut() -> bool + 'static) -> Self {
        self.is_finished = Some(Box::new(is_finished));
        self
    }

    /// Replaces the requirement set for this command.
    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<SubsystemId>) -> Self {
        self.requirements = requirements;
        self
    }

    /// Adds a single subsystem to the requirement set.
    #[must_use]
    pub fn requires(mut self, subsystem: &impl scheduler::SubsystemRequirement) -> Self {
        self.requirements.push(subsystem.suid());
        self
    }

    pub fn build(self) -> Command {
        Command::Simple(SimpleCommand {
            initialize: self.initialize,
            execute: self.execute,
            end: self.end,
            is_finished: self.is_finished,
            requirements: self.requirements,
        })
    }
}
impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimpleCommand {
    initialize: Option<Box<dyn FnMut()>>,
    execute: Option<Box<dyn FnMut()>>,
    end: Option<Box<dyn FnMut(bool)>>,
    is_finished: Option<Box<dyn FnMut() -> bool>>,
    requirements: Vec<SubsystemId>,
}
impl CommandTrait for SimpleCommand {
    fn initialize(&mut self) {
        if let Some(initialize) = self.initialize.as_mut() {
            initialize();
        }
    }

    fn execute(&mut self) {
        if let Some(execute) = self.execute.as_mut() {
            execute();
        }
    }

    fn end(&mut self, interrupted: bool) {
        if let Some(end) = self.end.as_mut() {
            end(interrupted);
        }
    }

    fn is_finished(&mut self) -> bool {
        self.is_finished
            .as_mut()
            .map_or(false, |is_finished| is_finished())
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.requirements.clone()
    }

    fn name(&self) -> String {
        String::from("simple")
    }
}
impl Debug for SimpleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("SimpleCommand")
            .field("initialize", &self.initialize.is_some())
            .field("execute", &self.execute.is_some())
            .field("end", &self.end.is_some())
            .field("is_finished", &self.is_finished.is_some())
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// Runs a closure once at `initialize` and finishes immediately.
pub struct InstantCommand {
    action: Option<Box<dyn FnMut()>>,
    requirements: Vec<SubsystemId>,
}
impl CommandTrait for InstantCommand {
    fn initialize(&mut self) {
        if let Some(action) = self.action.as_mut() {
            action();
        }
    }

    fn is_finished(&mut self) -> bool {
        true
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.requirements.clone()
    }

    fn name(&self) -> String {
        String::from("instant")
    }
}
impl Debug for InstantCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("InstantCommand")
            .field("action", &self.action.is_some())
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// Runs a closure every tick and never finishes on its own.
pub struct RunCommand {
    body: Box<dyn FnMut()>,
    requirements: Vec<SubsystemId>,
}
impl CommandTrait for RunCommand {
    fn execute(&mut self) {
        (self.body)();
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.requirements.clone()
    }

    fn name(&self) -> String {
        String::from("run")
    }
}
impl Debug for RunCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("RunCommand")
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// Finishes once the configured duration has elapsed since `initialize`.
///
/// An instance that has not been initialized yet reports not-finished.
#[allow(missing_copy_implementations)]
#[derive(Debug)]
pub struct WaitCommand {
    started: Option<Instant>,
    duration: Duration,
}
impl CommandTrait for WaitCommand {
    fn initialize(&mut self) {
        self.started = Some(Instant::now());
    }

    fn is_finished(&mut self) -> bool {
        self.started
            .map_or(false, |started| started.elapsed() >= self.duration)
    }

    fn name(&self) -> String {
        format!("wait({:?})", self.duration)
    }
}

/// Finishes as soon as its condition evaluates to true. No state to initialize.
#[derive(Debug)]
pub struct WaitUntilCommand {
    condition: Condition,
}
impl CommandTrait for WaitUntilCommand {
    fn is_finished(&mut self) -> bool {
        self.condition.evaluate()
    }

    fn name(&self) -> String {
        String::from("wait-until")
    }
}

/// Carries a display name through composition.
#[derive(Debug)]
pub struct NamedCommand {
    name: String,
    command: Box<Command>,
}
impl CommandTrait for NamedCommand {
    fn initialize(&mut self) {
        self.command.initialize();
    }

    fn execute(&mut self) {
        self.command.execute();
    }

    fn end(&mut self, interrupted: bool) {
        self.command.end(interrupted);
    }

    fn is_finished(&mut self) -> bool {
        self.command.is_finished()
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.command.requirements()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[must_use]
pub enum Command {
    Instant(InstantCommand),
    Run(RunCommand),
    Wait(WaitCommand),
    WaitUntil(WaitUntilCommand),
    Sequential(SequentialGroup),
    Parallel(ParallelGroup),
    FollowPath(FollowPathCommand),
    Simple(SimpleCommand),
    Foreign(ForeignCommand),
    Named(NamedCommand),
    Custom(Box<dyn CommandTrait>),
}
impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Instant(command) => f.debug_tuple("Instant").field(command).finish(),
            Self::Run(command) => f.debug_tuple("Run").field(command).finish(),
            Self::Wait(command) => f.debug_tuple("Wait").field(command).finish(),
            Self::WaitUntil(command) => f.debug_tuple("WaitUntil").field(command).finish(),
            Self::Sequential(command) => f.debug_tuple("Sequential").field(command).finish(),
            Self::Parallel(command) => f.debug_tuple("Parallel").field(command).finish(),
            Self::FollowPath(command) => f.debug_tuple("FollowPath").field(command).finish(),
            Self::Simple(command) => f.debug_tuple("Simple").field(command).finish(),
            Self::Foreign(command) => f.debug_tuple("Foreign").field(command).finish(),
            Self::Named(command) => f.debug_tuple("Named").field(command).finish(),
            Self::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}
impl CommandTrait for Command {
    fn initialize(&mut self) {
        match self {
            Self::Instant(command) => command.initialize(),
            Self::Run(command) => command.initialize(),
            Self::Wait(command) => command.initialize(),
            Self::WaitUntil(command) => command.initialize(),
            Self::Sequential(command) => command.initialize(),
            Self::Parallel(command) => command.initialize(),
            Self::FollowPath(command) => command.initialize(),
            Self::Simple(command) => command.initialize(),
            Self::Foreign(command) => command.initialize(),
            Self::Named(command) => command.initialize(),
            Self::Custom(command) => command.initialize(),
        }
    }

    fn execute(&mut self) {
        match self {
            Self::Instant(command) => command.execute(),
            Self::Run(command) => command.execute(),
            Self::Wait(command) => command.execute(),
            Self::WaitUntil(command) => command.execute(),
            Self::Sequential(command) => command.execute(),
            Self::Parallel(command) => command.execute(),
            Self::FollowPath(command) => command.execute(),
            Self::Simple(command) => command.execute(),
            Self::Foreign(command) => command.execute(),
            Self::Named(command) => command.execute(),
            Self::Custom(command) => command.execute(),
        }
    }

    fn end(&mut self, interrupted: bool) {
        match self {
            Self::Instant(command) => command.end(interrupted),
            Self::Run(command) => command.end(interrupted),
            Self::Wait(command) => command.end(interrupted),
            Self::WaitUntil(command) => command.end(interrupted),
            Self::Sequential(command) => command.end(interrupted),
            Self::Parallel(command) => command.end(interrupted),
            Self::FollowPath(command) => command.end(interrupted),
            Self::Simple(command) => command.end(interrupted),
            Self::Foreign(command) => command.end(interrupted),
            Self::Named(command) => command.end(interrupted),
            Self::Custom(command) => command.end(interrupted),
        }
    }

    fn is_finished(&mut self) -> bool {
        match self {
            Self::Instant(command) => command.is_finished(),
            Self::Run(command) => command.is_finished(),
            Self::Wait(command) => command.is_finished(),
            Self::WaitUntil(command) => command.is_finished(),
            Self::Sequential(command) => command.is_finished(),
            Self::Parallel(command) => command.is_finished(),
            Self::FollowPath(command) => command.is_finished(),
            Self::Simple(command) => command.is_finished(),
            Self::Foreign(command) => command.is_finished(),
            Self::Named(command) => command.is_finished(),
            Self::Custom(command) => command.is_finished(),
        }
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        match self {
            Self::Instant(command) => command.requirements(),
            Self::Run(command) => command.requirements(),
            Self::Wait(command) => command.requirements(),
            Self::WaitUntil(command) => command.requirements(),
            Self::Sequential(command) => command.requirements(),
            Self::Parallel(command) => command.requirements(),
            Self::FollowPath(command) => command.requirements(),
            Self::Simple(command) => command.requirements(),
            Self::Foreign(command) => command.requirements(),
            Self::Named(command) => command.requirements(),
            Self::Custom(command) => command.requirements(),
        }
    }

    fn name(&self) -> String {
        match self {
            Self::Instant(command) => command.name(),
            Self::Run(command) => command.name(),
            Self::Wait(command) => command.name(),
            Self::WaitUntil(command) => command.name(),
            Self::Sequential(command) => command.name(),
            Self::Parallel(command) => command.name(),
            Self::FollowPath(command) => command.name(),
            Self::Simple(command) => command.name(),
            Self::Foreign(command) => command.name(),
            Self::Named(command) => command.name(),
            Self::Custom(command) => command.name(),
        }
    }
}

impl Command {
    /// Runs `action` once and finishes immediately. No requirements.
    pub fn instant(action: impl FnMut() + 'static) -> Self {
        Self::instant_with(action, Vec::new())
    }

    /// Runs `action` once and finishes immediately, holding `requirements`.
    pub fn instant_with(action: impl FnMut() + 'static, requirements: Vec<SubsystemId>) -> Self {
        Self::Instant(InstantCommand {
            action: Some(Box::new(action)),
            requirements,
        })
    }

    /// A command that does nothing and finishes immediately.
    pub fn noop() -> Self {
        Self::Instant(InstantCommand {
            action: None,
            requirements: Vec::new(),
        })
    }

    /// Runs `body` every tick until externally cancelled.
    pub fn run(body: impl FnMut() + 'static, requirements: Vec<SubsystemId>) -> Self {
        Self::Run(RunCommand {
            body: Box::new(body),
            requirements,
        })
    }

    /// Finishes once `duration` has elapsed since the command was initialized.
    pub fn wait(duration: Duration) -> Self {
        Self::Wait(WaitCommand {
            started: None,
            duration,
        })
    }

    /// Finishes as soon as `predicate` returns true.
    pub fn wait_until(predicate: impl Fn() -> bool + 'static) -> Self {
        Self::wait_until_condition(Condition::new(predicate))
    }

    /// Finishes as soon as `condition` evaluates to true.
    pub fn wait_until_condition(condition: Condition) -> Self {
        Self::WaitUntil(WaitUntilCommand { condition })
    }

    /// Runs `children` one at a time, in order.
    pub fn sequential(children: Vec<Command>) -> Self {
        Self::Sequential(SequentialGroup::new(children))
    }

    /// Runs `children` concurrently; finishes when all of them have finished.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if two children share a subsystem.
    pub fn parallel(children: Vec<Command>) -> Result<Self, CommandError> {
        Ok(Self::Parallel(ParallelGroup::new(
            children,
            ParallelMode::All,
        )?))
    }

    /// Runs `children` concurrently; finishes when any of them finishes and
    /// interrupts the rest.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if two children share a subsystem.
    pub fn race(children: Vec<Command>) -> Result<Self, CommandError> {
        Ok(Self::Parallel(ParallelGroup::new(
            children,
            ParallelMode::Race,
        )?))
    }

    /// Runs `deadline` and `companions` concurrently; finishes when `deadline`
    /// finishes and interrupts the companions.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if any two members share a subsystem.
    pub fn deadline(deadline: Command, companions: Vec<Command>) -> Result<Self, CommandError> {
        let mut children = vec![deadline];
        children.extend(companions);
        Ok(Self::Parallel(ParallelGroup::new(
            children,
            ParallelMode::Deadline,
        )?))
    }

    /// Runs `self`, then `next`.
    pub fn and_then(self, next: Self) -> Self {
        Self::sequential(vec![self, next])
    }

    /// Runs `self` and `other` concurrently until both finish.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if the two share a subsystem.
    pub fn along_with(self, other: Self) -> Result<Self, CommandError> {
        Self::parallel(vec![self, other])
    }

    /// Runs `self` and `other` concurrently until either finishes.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if the two share a subsystem.
    pub fn race_with(self, other: Self) -> Result<Self, CommandError> {
        Self::race(vec![self, other])
    }

    /// Runs `self` alongside `companions`, ending them when `self` finishes.
    ///
    /// # Errors
    /// [`CommandError::RequirementConflict`] if any two members share a subsystem.
    pub fn with_companions(self, companions: Vec<Command>) -> Result<Self, CommandError> {
        Self::deadline(self, companions)
    }

    /// Cancels `self` if it has not finished after `duration`.
    pub fn with_timeout(self, duration: Duration) -> Self {
        // A wait has no requirements, so the race cannot conflict.
        Self::Parallel(ParallelGroup::unchecked(
            vec![self, Self::wait(duration)],
            ParallelMode::Race,
        ))
    }

    /// Wraps `self` with a display name.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self::Named(NamedCommand {
            name: name.into(),
            command: Box::new(self),
        })
    }

    /// Wraps a custom lifecycle object.
    pub fn custom(command: Box<dyn CommandTrait>) -> Self {
        Self::Custom(command)
    }

    /// Moves this command behind a shared, identity-bearing handle.
    pub fn into_handle(self) -> CommandHandle {
        CommandHandle::new(self)
    }
}
impl Default for Command {
    fn default() -> Self {
        Self::noop()
    }
}
impl From<CommandBuilder> for Command {
    fn from(builder: CommandBuilder) -> Self {
        builder.build()
    }
}
impl From<Box<dyn CommandTrait>> for Command {
    fn from(command: Box<dyn CommandTrait>) -> Self {
        Self::Custom(command)
    }
}

/// A shared handle to a command.
///
/// The scheduler and the named registry both deal in handles: equality and
/// hashing go by instance identity, so scheduling the same handle twice is a
/// no-op while two separately built but otherwise identical commands stay
/// distinct. Group commands own their children directly and never hand out
/// handles to them.
#[derive(Clone)]
pub struct CommandHandle(Rc<RefCell<Command>>);

impl CommandHandle {
    pub fn new(command: Command) -> Self {
        Self(Rc::new(RefCell::new(command)))
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.borrow().name()
    }

    #[must_use]
    pub fn requirements(&self) -> Vec<SubsystemId> {
        self.0.borrow().requirements()
    }

    /// Whether two handles refer to the same command instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Mutable access to the underlying command, e.g. to feed segments to a
    /// not-yet-initialized path builder.
    ///
    /// # Panics
    /// If called from inside one of this command's own lifecycle callbacks.
    pub fn apply<R>(&self, op: impl FnOnce(&mut Command) -> R) -> R {
        op(&mut *self.0.borrow_mut())
    }

    /// Asks the scheduler on this thread to run this command.
    ///
    /// # Panics
    /// If no scheduler is installed on this thread. Use
    /// [`CommandHandle::try_schedule`] to handle that case.
    pub fn schedule(&self) {
        self.try_schedule()
            .expect("no scheduler is installed on this thread");
    }

    /// Asks the scheduler on this thread to run this command.
    ///
    /// # Errors
    /// [`SchedulerError::Detached`] if no scheduler is installed on this thread.
    pub fn try_schedule(&self) -> Result<(), SchedulerError> {
        scheduler::schedule(self)
    }

    /// Asks the scheduler on this thread to cancel this command.
    ///
    /// # Errors
    /// [`SchedulerError::Detached`] if no scheduler is installed on this thread.
    pub fn try_cancel(&self) -> Result<(), SchedulerError> {
        scheduler::cancel(self)
    }

    pub(crate) fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Command> {
        self.0.borrow_mut()
    }
}
impl PartialEq for CommandHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl Eq for CommandHandle {}
impl Hash for CommandHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.key());
    }
}
impl Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_tuple("CommandHandle").field(&self.name()).finish()
    }
}
impl From<Command> for CommandHandle {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}
