use std::{cell::Cell, fmt::Debug, rc::Rc};

use crate::{
    commands::{Command, CommandHandle},
    scheduler,
};

/// A cloneable, composable boolean predicate.
///
/// Backs [`WaitUntil`](crate::commands::WaitUntilCommand) commands and the
/// edge-triggered schedulers built by [`Condition::on_true`] /
/// [`Condition::on_false`].
#[derive(Clone)]
pub struct Condition {
    predicate: Rc<dyn Fn() -> bool>,
}
impl Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}
impl Condition {
    pub fn new(predicate: impl Fn() -> bool + 'static) -> Self {
        Self {
            predicate: Rc::new(predicate),
        }
    }

    #[must_use]
    pub fn evaluate(&self) -> bool {
        (self.predicate)()
    }

    #[must_use]
    pub fn and(&self, other: impl Fn() -> bool + 'static) -> Self {
        let own = self.predicate.clone();
        Self::new(move || own() && other())
    }

    #[must_use]
    pub fn or(&self, other: impl Fn() -> bool + 'static) -> Self {
        let own = self.predicate.clone();
        Self::new(move || own() || other())
    }

    #[must_use]
    pub fn negate(&self) -> Self {
        let own = self.predicate.clone();
        Self::new(move || !own())
    }

    /// True for exactly one evaluation each time the condition goes from
    /// false to true.
    #[must_use]
    pub fn rising_edge(&self) -> Self {
        let own = self.predicate.clone();
        let last = Cell::new(false);
        Self::new(move || {
            let now = own();
            let before = last.replace(now);
            !before && now
        })
    }

    /// True for exactly one evaluation each time the condition goes from
    /// true to false.
    #[must_use]
    pub fn falling_edge(&self) -> Self {
        let own = self.predicate.clone();
        let last = Cell::new(false);
        Self::new(move || {
            let now = own();
            let before = last.replace(now);
            before && !now
        })
    }

    /// Schedules `command` on each rising edge of this condition. The watcher
    /// lives as long as the scheduler. Returns the command's handle so the
    /// caller can cancel or re-schedule it imperatively.
    ///
    /// # Panics
    /// If no scheduler is installed on this thread.
    pub fn on_true(&self, command: impl Into<Command>) -> CommandHandle {
        let handle = CommandHandle::new(command.into());
        scheduler::watch(ConditionalScheduler::new(self.rising_edge(), handle.clone()))
            .expect("no scheduler is installed on this thread");
        handle
    }

    /// Schedules `command` on each falling edge of this condition.
    ///
    /// # Panics
    /// If no scheduler is installed on this thread.
    pub fn on_false(&self, command: impl Into<Command>) -> CommandHandle {
        let handle = CommandHandle::new(command.into());
        scheduler::watch(ConditionalScheduler::new(
            self.falling_edge(),
            handle.clone(),
        ))
        .expect("no scheduler is installed on this thread");
        handle
    }
}

/// Pairs a condition with the command to schedule when it evaluates true.
/// Polled by the scheduler once per tick.
#[derive(Debug)]
pub struct ConditionalScheduler {
    condition: Condition,
    command: CommandHandle,
}
impl ConditionalScheduler {
    #[must_use]
    pub fn new(condition: Condition, command: CommandHandle) -> Self {
        Self { condition, command }
    }

    pub(crate) fn poll(&mut self) -> Option<CommandHandle> {
        self.condition.evaluate().then(|| self.command.clone())
    }
}
