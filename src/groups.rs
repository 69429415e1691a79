use fxhash::FxHashSet;
use thiserror::Error;

use crate::{
    commands::{Command, CommandTrait},
    scheduler::SubsystemId,
};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Two children meant to run concurrently both require the same subsystem.
    #[error("concurrent children both require subsystem {0:#018x}")]
    RequirementConflict(SubsystemId),
}

/// Union of the children's requirement sets, rejecting overlap.
fn disjoint_union(children: &[Command]) -> Result<FxHashSet<SubsystemId>, CommandError> {
    let mut merged = FxHashSet::default();
    for child in children {
        for requirement in child.requirements() {
            if !merged.insert(requirement) {
                return Err(CommandError::RequirementConflict(requirement));
            }
        }
    }
    Ok(merged)
}

/// Union of the children's requirement sets. Sequential children never overlap
/// in time, so sharing a subsystem is fine there.
fn union(children: &[Command]) -> FxHashSet<SubsystemId> {
    children
        .iter()
        .flat_map(CommandTrait::requirements)
        .collect()
}

/// Runs its children one at a time, in order.
#[derive(Debug)]
pub struct SequentialGroup {
    commands: Vec<Command>,
    current: usize,
    requirements: FxHashSet<SubsystemId>,
}
impl SequentialGroup {
    pub(crate) fn new(commands: Vec<Command>) -> Self {
        Self {
            requirements: union(&commands),
            commands,
            current: 0,
        }
    }
}
impl CommandTrait for SequentialGroup {
    fn initialize(&mut self) {
        self.current = 0;
        if let Some(first) = self.commands.first_mut() {
            first.initialize();
        }
    }

    fn execute(&mut self) {
        let Some(active) = self.commands.get_mut(self.current) else {
            return;
        };
        active.execute();
        // Children that finish the moment they are initialized (instants,
        // zero waits) close out within the same tick instead of costing one
        // tick each.
        while let Some(active) = self.commands.get_mut(self.current) {
            if !active.is_finished() {
                break;
            }
            active.end(false);
            self.current += 1;
            if let Some(next) = self.commands.get_mut(self.current) {
                next.initialize();
            }
        }
    }

    fn end(&mut self, interrupted: bool) {
        if interrupted {
            if let Some(active) = self.commands.get_mut(self.current) {
                active.end(true);
            }
        }
    }

    fn is_finished(&mut self) -> bool {
        self.current >= self.commands.len()
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.requirements.iter().copied().collect()
    }

    fn name(&self) -> String {
        self.commands
            .iter()
            .map(CommandTrait::name)
            .collect::<Vec<_>>()
            .join("->")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    /// Finishes when every child has finished.
    All,
    /// Finishes when any child finishes; the rest are interrupted.
    Race,
    /// Finishes when the child at index 0 finishes; the rest are interrupted.
    Deadline,
}

/// Runs its children concurrently, interleaved within a single tick.
///
/// A `finished` flag per child tracks who has already received an `end` call,
/// so a tie between children (or an interruption racing a natural finish)
/// never ends the same child twice.
#[derive(Debug)]
pub struct ParallelGroup {
    commands: Vec<Command>,
    finished: Vec<bool>,
    requirements: FxHashSet<SubsystemId>,
    mode: ParallelMode,
}
impl ParallelGroup {
    pub(crate) fn new(commands: Vec<Command>, mode: ParallelMode) -> Result<Self, CommandError> {
        let requirements = disjoint_union(&commands)?;
        Ok(Self {
            finished: vec![false; commands.len()],
            commands,
            requirements,
            mode,
        })
    }

    /// Constructor for callers that know the children cannot conflict.
    pub(crate) fn unchecked(commands: Vec<Command>, mode: ParallelMode) -> Self {
        Self {
            finished: vec![false; commands.len()],
            requirements: union(&commands),
            commands,
            mode,
        }
    }
}
impl CommandTrait for ParallelGroup {
    fn initialize(&mut self) {
        for flag in &mut self.finished {
            *flag = false;
        }
        for command in &mut self.commands {
            command.initialize();
        }
    }

    fn execute(&mut self) {
        for (i, command) in self.commands.iter_mut().enumerate() {
            if self.finished[i] {
                continue;
            }
            command.execute();
            if command.is_finished() {
                command.end(false);
                self.finished[i] = true;
            }
        }
    }

    fn end(&mut self, _interrupted: bool) {
        // Whether the group finished naturally (race/deadline with children
        // still going) or was interrupted from outside, every child that has
        // not ended yet is interrupted now.
        for (i, command) in self.commands.iter_mut().enumerate() {
            if !self.finished[i] {
                command.end(true);
                self.finished[i] = true;
            }
        }
    }

    fn is_finished(&mut self) -> bool {
        match self.mode {
            ParallelMode::All => self.finished.iter().all(|&finished| finished),
            ParallelMode::Race => {
                self.commands.is_empty() || self.finished.iter().any(|&finished| finished)
            }
            ParallelMode::Deadline => self.finished.first().copied().unwrap_or(true),
        }
    }

    fn requirements(&self) -> Vec<SubsystemId> {
        self.requirements.iter().copied().collect()
    }

    fn name(&self) -> String {
        self.commands
            .iter()
            .map(CommandTrait::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn probe(log: &Rc<RefCell<Vec<String>>>, tag: &str, finish_after: usize) -> Command {
        let tag = tag.to_owned();
        let ticks = Rc::new(RefCell::new(0usize));
        crate::commands::CommandBuilder::new()
            .initialize(crate::clone_mv!(log, tag >> || log.borrow_mut().push(format!("{tag}.init"))))
            .execute(crate::clone_mv!(log, tag, ticks >> || {
                *ticks.borrow_mut() += 1;
                log.borrow_mut().push(format!("{tag}.exec"));
            }))
            .end(crate::clone_mv!(log, tag >> |interrupted| {
                log.borrow_mut().push(format!("{tag}.end({interrupted})"));
            }))
            .is_finished(crate::clone_mv!(ticks >> || *ticks.borrow() >= finish_after))
            .build()
    }

    #[test]
    fn empty_sequential_finishes_immediately() {
        let mut group = Command::sequential(Vec::new());
        group.initialize();
        group.execute();
        assert!(group.is_finished());
    }

    #[test]
    fn empty_race_finishes_without_initializing_anything() {
        let mut group = Command::race(Vec::new()).unwrap();
        group.initialize();
        assert!(group.is_finished());
    }

    #[test]
    fn sequential_cascades_through_instant_children() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ran = Rc::new(RefCell::new(0));
        let mut group = Command::sequential(vec![
            probe(&log, "a", 1),
            Command::instant(crate::clone_mv!(ran >> || *ran.borrow_mut() += 1)),
        ]);
        group.initialize();
        group.execute();
        assert!(group.is_finished());
        assert_eq!(*ran.borrow(), 1);
        assert_eq!(
            *log.borrow(),
            vec!["a.init", "a.exec", "a.end(false)"]
        );
    }

    #[test]
    fn race_interrupts_the_losers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group =
            Command::race(vec![probe(&log, "fast", 1), probe(&log, "slow", 99)]).unwrap();
        group.initialize();
        group.execute();
        assert!(group.is_finished());
        group.end(false);
        let log = log.borrow();
        assert!(log.contains(&"fast.end(false)".to_owned()));
        assert!(log.contains(&"slow.end(true)".to_owned()));
    }

    #[test]
    fn race_tie_finishes_both_naturally() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group =
            Command::race(vec![probe(&log, "a", 1), probe(&log, "b", 1)]).unwrap();
        group.initialize();
        group.execute();
        assert!(group.is_finished());
        group.end(false);
        let log = log.borrow();
        assert!(log.contains(&"a.end(false)".to_owned()));
        assert!(log.contains(&"b.end(false)".to_owned()));
    }

    #[test]
    fn deadline_cuts_companions_off() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group = Command::deadline(
            probe(&log, "deadline", 2),
            vec![probe(&log, "companion", 99)],
        )
        .unwrap();
        group.initialize();
        group.execute();
        assert!(!group.is_finished());
        group.execute();
        assert!(group.is_finished());
        group.end(false);
        let log = log.borrow();
        assert!(log.contains(&"deadline.end(false)".to_owned()));
        assert!(log.contains(&"companion.end(true)".to_owned()));
    }

    #[test]
    fn parallel_rejects_overlapping_requirements() {
        let shared: SubsystemId = 7;
        let a = Command::run(|| {}, vec![shared]);
        let b = Command::run(|| {}, vec![shared]);
        assert_eq!(
            Command::parallel(vec![a, b]).unwrap_err(),
            CommandError::RequirementConflict(shared)
        );
    }

    #[test]
    fn interrupting_a_parallel_group_ends_all_running_children() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group =
            Command::parallel(vec![probe(&log, "a", 1), probe(&log, "b", 99)]).unwrap();
        group.initialize();
        group.execute();
        group.end(true);
        let log = log.borrow();
        assert!(log.contains(&"a.end(false)".to_owned()));
        assert!(log.contains(&"b.end(true)".to_owned()));
    }
}
