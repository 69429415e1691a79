//! Admits foreign objects into the command model.
//!
//! Three ingestion paths: bare closures become instants, objects that
//! implement [`CommandTrait`](crate::commands::CommandTrait) ride in as
//! custom commands (the trait's defaulted methods are the "missing method is
//! a no-op" rule), and objects whose lifecycle is opaque but that can at
//! least schedule themselves come in through [`Schedulable`]. The fourth
//! shape, [`ForeignCommand`], carries lifecycle functions discovered at
//! registration time as an explicit vtable.

use std::fmt::Debug;

use crate::{
    commands::{Command, CommandTrait},
    scheduler::SubsystemId,
};

/// Wraps a closure as an instant command with no requirements.
pub fn from_fn(action: impl FnMut() + 'static) -> Command {
    Command::instant(action)
}

/// Wraps a boxed lifecycle object. Methods the object does not override fall
/// back to the trait defaults: no-ops, with `is_finished` reporting false.
pub fn from_lifecycle(object: Box<dyn CommandTrait>) -> Command {
    Command::custom(object)
}

/// A foreign object that cannot expose its lifecycle but can fire itself.
pub trait Schedulable {
    fn schedule_now(&mut self);
}

/// Wraps an opaque foreign command: an instant whose `initialize` asks the
/// object to schedule itself through whatever machinery it owns.
pub fn from_schedulable(mut object: impl Schedulable + 'static) -> Command {
    Command::instant(move || object.schedule_now())
}

/// Lifecycle functions discovered at registration time. Slots that were not
/// found stay empty and behave as no-ops, with `is_finished` defaulting to
/// false.
pub struct ForeignCommand {
    label: String,
    initialize: Option<Box<dyn FnMut()>>,
    execute: Option<Box<dyn FnMut()>>,
    end: Option<Box<dyn FnMut(bool)>>,
    is_finished: Option<Box<dyn FnMut() -> bool>>,
    requirements: Vec<SubsystemId>,
}

impl ForeignCommand {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            initialize: None,
            execute: None,
            end: None,
            is_finished: None,
            requirements: Vec::new(),
        }
    }

    #[must_use]
    pub fn on_initialize(mut self, initialize: impl FnMut() + 'static) -> Self {
        self.initialize = Some(Box::new(initialize));
        self
    }

    #[must_use]
    pub fn on_execute(mut self, execute: impl FnMut() + 'static) -> Self {
        self.execute = Some(Box::new(execute));
        self
    }

    #[must_use]
    pub fn on_end(mut self, end: impl FnMut(bool) + 'static) -> Self {
        self.end = Some(Box::new(end));
        self
    }

    #[must_use]
    pub fn finished_when(mut self, is_finished: impl FnMut() -> bool + 'static) -> Self {
        self.is_finished = Some(Box::new(is_finished));
        self
    }

    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<SubsystemId>) -> Self {
        self.requirements = requirements;
        self
    }
}

impl CommandTrait for ForeignCommand {
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
        self.label.clone()
    }
}

impl Debug for ForeignCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignCommand")
            .field("label", &self.label)
            .field("initialize", &self.initialize.is_some())
            .field("execute", &self.execute.is_some())
            .field("end", &self.end.is_some())
            .field("is_finished", &self.is_finished.is_some())
            .field("requirements", &self.requirements)
            .finish()
    }
}

impl From<ForeignCommand> for Command {
    fn from(command: ForeignCommand) -> Self {
        Self::Foreign(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn foreign_slots_default_to_noops() {
        let mut command: Command = ForeignCommand::new("bare").into();
        command.initialize();
        command.execute();
        assert!(!command.is_finished());
        command.end(true);
    }

    #[test]
    fn foreign_dispatches_through_discovered_slots() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut command: Command = ForeignCommand::new("probe")
            .on_initialize(crate::clone_mv!(log >> || log.borrow_mut().push("init")))
            .on_execute(crate::clone_mv!(log >> || log.borrow_mut().push("exec")))
            .finished_when(|| true)
            .into();
        command.initialize();
        command.execute();
        assert!(command.is_finished());
        assert_eq!(*log.borrow(), vec!["init", "exec"]);
    }

    #[test]
    fn closures_and_lifecycle_objects_adapt() {
        let ran = Rc::new(RefCell::new(false));
        let mut command = from_fn(crate::clone_mv!(ran >> || *ran.borrow_mut() = true));
        command.initialize();
        assert!(command.is_finished());
        assert!(*ran.borrow());

        struct Lifecycle;
        impl CommandTrait for Lifecycle {
            fn is_finished(&mut self) -> bool {
                true
            }
        }
        let mut command = from_lifecycle(Box::new(Lifecycle));
        command.initialize();
        command.execute();
        assert!(command.is_finished());
    }

    #[test]
    fn schedulable_objects_become_instants() {
        struct Opaque {
            fired: Rc<RefCell<bool>>,
        }
        impl Schedulable for Opaque {
            fn schedule_now(&mut self) {
                *self.fired.borrow_mut() = true;
            }
        }
        let fired = Rc::new(RefCell::new(false));
        let mut command = from_schedulable(Opaque {
            fired: fired.clone(),
        });
        command.initialize();
        assert!(command.is_finished());
        assert!(*fired.borrow());
    }
}
