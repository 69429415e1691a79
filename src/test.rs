use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use crate::{
    clone_mv,
    commands::{Command, CommandBuilder},
    conditions::Condition,
    follow::Follower,
    geometry::{PathChain, Pose},
    registry, routine,
    scheduler::{FaultStage, Scheduler, SchedulerError, Subsystem, SubsystemCell},
};

type Log = Rc<RefCell<Vec<String>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// A command that traces its lifecycle into `log` and finishes after
/// `finish_after` executes (`usize::MAX` for never).
fn probe(log: &Log, tag: &str, requirements: Vec<u64>, finish_after: usize) -> Command {
    let tag = tag.to_owned();
    let ticks = Rc::new(Cell::new(0usize));
    CommandBuilder::new()
        .initialize(clone_mv!(log, tag, ticks >> || {
            ticks.set(0);
            log.borrow_mut().push(format!("{tag}.init"));
        }))
        .execute(clone_mv!(log, tag, ticks >> || {
            ticks.set(ticks.get() + 1);
            log.borrow_mut().push(format!("{tag}.exec"));
        }))
        .end(clone_mv!(log, tag >> |interrupted| {
            log.borrow_mut().push(format!("{tag}.end({interrupted})"));
        }))
        .is_finished(clone_mv!(ticks >> || ticks.get() >= finish_after))
        .with_requirements(requirements)
        .build()
}

struct Drive;
impl Subsystem for Drive {
    fn construct() -> Self {
        Self
    }
}

#[test]
fn basic_run_to_completion() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let handle = scheduler.schedule_command(probe(&log, "c", Vec::new(), 1));

    scheduler.tick();

    assert_eq!(entries(&log), vec!["c.init", "c.exec", "c.end(false)"]);
    assert!(!scheduler.is_scheduled(&handle));
    assert_eq!(scheduler.scheduled_count(), 0);
}

#[test]
fn preemption_by_requirement() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();

    let c1 = scheduler.schedule_command(probe(&log, "c1", vec![drive.suid()], usize::MAX));
    scheduler.tick();
    let c2 = scheduler.schedule_command(probe(&log, "c2", vec![drive.suid()], usize::MAX));
    scheduler.tick();

    assert_eq!(
        entries(&log),
        vec!["c1.init", "c1.exec", "c1.end(true)", "c2.init", "c2.exec"]
    );
    assert!(!scheduler.is_scheduled(&c1));
    assert!(scheduler.is_scheduled(&c2));
    assert!(scheduler.holder_of(&drive).unwrap().ptr_eq(&c2));
}

#[test]
fn default_command_reinsertion() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();

    let default = scheduler
        .set_default_command(&drive, probe(&log, "d", vec![drive.suid()], usize::MAX))
        .unwrap();

    scheduler.tick();
    assert_eq!(entries(&log), vec!["d.init"]);
    scheduler.tick();
    assert_eq!(entries(&log), vec!["d.init", "d.exec"]);

    scheduler.schedule_command(probe(&log, "c", vec![drive.suid()], 1));
    assert_eq!(
        entries(&log),
        vec!["d.init", "d.exec", "d.end(true)", "c.init"]
    );

    // The tick on which c finishes re-seeds the default at tick end; its
    // first execute lands on the following tick.
    scheduler.tick();
    assert_eq!(
        entries(&log),
        vec!["d.init", "d.exec", "d.end(true)", "c.init", "c.exec", "c.end(false)", "d.init"]
    );
    scheduler.tick();
    assert!(entries(&log).ends_with(&["d.exec".to_owned()]));
    assert!(scheduler.is_scheduled(&default));
}

#[test]
fn default_must_require_its_subsystem() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();
    assert_eq!(
        scheduler
            .set_default_command(&drive, probe(&log, "d", Vec::new(), usize::MAX))
            .unwrap_err(),
        SchedulerError::RequirementMismatch
    );
}

#[test]
fn sequential_wait_then_instant_closes_in_one_tick() {
    let mut scheduler = Scheduler::new();
    let ran = Rc::new(Cell::new(0));
    let group = Command::wait(Duration::from_millis(10)).and_then(Command::instant(
        clone_mv!(ran >> || ran.set(ran.get() + 1)),
    ));
    let handle = scheduler.schedule_command(group);

    scheduler.tick();
    assert!(scheduler.is_scheduled(&handle));
    assert_eq!(ran.get(), 0);

    std::thread::sleep(Duration::from_millis(15));
    scheduler.tick();
    assert_eq!(ran.get(), 1);
    assert!(!scheduler.is_scheduled(&handle));
}

#[test]
fn race_ends_winner_naturally_and_interrupts_loser() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let race = Command::race(vec![
        probe(&log, "fast", Vec::new(), 2),
        probe(&log, "slow", Vec::new(), usize::MAX),
    ])
    .unwrap();
    let handle = scheduler.schedule_command(race);

    scheduler.tick();
    assert!(scheduler.is_scheduled(&handle));
    scheduler.tick();

    assert!(!scheduler.is_scheduled(&handle));
    let log = entries(&log);
    assert!(log.contains(&"fast.end(false)".to_owned()));
    assert!(log.contains(&"slow.end(true)".to_owned()));
}

#[test]
fn race_against_predicate_waits_for_it() {
    let mut scheduler = Scheduler::new();
    let flag = Rc::new(Cell::new(false));
    let race = Command::wait(Duration::from_secs(100))
        .race_with(Command::wait_until(clone_mv!(flag >> || flag.get())))
        .unwrap();
    let handle = scheduler.schedule_command(race);

    scheduler.tick();
    scheduler.tick();
    assert!(scheduler.is_scheduled(&handle));

    flag.set(true);
    scheduler.tick();
    assert!(!scheduler.is_scheduled(&handle));
}

#[test]
fn deferred_schedule_initializes_at_tick_end() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let other = probe(&log, "other", Vec::new(), 1).into_handle();
    let fired = Rc::new(Cell::new(false));
    let runner = {
        let other = other.clone();
        Command::run(
            clone_mv!(log, fired >> || {
                log.borrow_mut().push(String::from("runner.exec"));
                if !fired.get() {
                    fired.set(true);
                    other.try_schedule().unwrap();
                }
            }),
            Vec::new(),
        )
    };
    scheduler.schedule_command(runner);

    scheduler.tick();
    // `other` initialized at the drain, strictly after the run pass.
    assert_eq!(entries(&log), vec!["runner.exec", "other.init"]);

    scheduler.tick();
    assert_eq!(
        entries(&log),
        vec!["runner.exec", "other.init", "runner.exec", "other.exec", "other.end(false)"]
    );
}

#[test]
fn deferred_cancel_of_pending_schedule_runs_nothing() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let other = probe(&log, "other", Vec::new(), 1).into_handle();
    let fired = Rc::new(Cell::new(false));
    let runner = {
        let other = other.clone();
        Command::run(
            clone_mv!(fired >> || {
                if !fired.get() {
                    fired.set(true);
                    other.try_schedule().unwrap();
                    other.try_cancel().unwrap();
                }
            }),
            Vec::new(),
        )
    };
    scheduler.schedule_command(runner);

    scheduler.tick();
    scheduler.tick();

    assert!(entries(&log).is_empty());
    assert!(!scheduler.is_scheduled(&other));
}

#[test]
fn schedule_then_cancel_restores_initial_state() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();
    let handle = scheduler.schedule_command(probe(&log, "c", vec![drive.suid()], usize::MAX));

    scheduler.cancel(&handle);

    assert_eq!(entries(&log), vec!["c.init", "c.end(true)"]);
    assert!(!scheduler.is_scheduled(&handle));
    assert!(scheduler.holder_of(&drive).is_none());
    assert_eq!(scheduler.scheduled_count(), 0);
}

#[test]
fn scheduling_the_same_instance_twice_is_a_noop() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();
    let handle = probe(&log, "c", vec![drive.suid()], usize::MAX).into_handle();

    scheduler.schedule(&handle);
    scheduler.schedule(&handle);
    scheduler.tick();

    assert_eq!(entries(&log), vec!["c.init", "c.exec"]);
    assert_eq!(scheduler.scheduled_count(), 1);
}

#[test]
fn reset_is_idempotent() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    scheduler.schedule_command(probe(&log, "c", Vec::new(), usize::MAX));

    scheduler.reset();
    scheduler.reset();

    assert_eq!(entries(&log), vec!["c.init", "c.end(true)"]);
    assert_eq!(scheduler.scheduled_count(), 0);
}

#[test]
fn wait_zero_closes_on_its_first_tick() {
    let mut scheduler = Scheduler::new();
    let handle = scheduler.schedule_command(Command::wait(Duration::ZERO));
    scheduler.tick();
    assert!(!scheduler.is_scheduled(&handle));
}

#[test]
fn empty_groups_close_on_their_first_tick() {
    let mut scheduler = Scheduler::new();
    let sequential = scheduler.schedule_command(Command::sequential(Vec::new()));
    let race = scheduler.schedule_command(Command::race(Vec::new()).unwrap());
    scheduler.tick();
    assert!(!scheduler.is_scheduled(&sequential));
    assert!(!scheduler.is_scheduled(&race));
}

#[test]
fn panicking_command_is_removed_and_the_tick_continues() {
    let mut scheduler = Scheduler::new();
    let drive = SubsystemCell::<Drive>::generate(&mut scheduler);
    let log = new_log();
    let faults = Rc::new(RefCell::new(Vec::new()));
    scheduler.set_error_sink(clone_mv!(faults >> |fault| {
        faults.borrow_mut().push((fault.stage, fault.message.clone()));
    }));

    let bad = scheduler.schedule_command(
        CommandBuilder::new()
            .execute(|| panic!("encoder unplugged"))
            .with_requirements(vec![drive.suid()])
            .build(),
    );
    let good = scheduler.schedule_command(probe(&log, "good", Vec::new(), usize::MAX));

    scheduler.tick();

    assert!(!scheduler.is_scheduled(&bad));
    assert!(scheduler.is_scheduled(&good));
    assert!(scheduler.holder_of(&drive).is_none());
    assert_eq!(entries(&log), vec!["good.init", "good.exec"]);
    assert_eq!(
        *faults.borrow(),
        vec![(FaultStage::Execute, String::from("encoder unplugged"))]
    );

    // The subsystem is free again: a new command admits without interrupting.
    let replacement = scheduler.schedule_command(probe(&log, "r", vec![drive.suid()], usize::MAX));
    assert!(scheduler.holder_of(&drive).unwrap().ptr_eq(&replacement));
}

#[test]
fn panicking_subsystem_periodic_is_surfaced_and_survived() {
    struct FlakySensors {
        polls: usize,
    }
    impl Subsystem for FlakySensors {
        fn construct() -> Self {
            Self { polls: 0 }
        }

        fn periodic(&mut self) {
            self.polls += 1;
            assert!(self.polls != 1, "sensor glitch");
        }
    }

    let mut scheduler = Scheduler::new();
    let sensors = SubsystemCell::<FlakySensors>::generate(&mut scheduler);
    let faults = Rc::new(RefCell::new(Vec::new()));
    scheduler.set_error_sink(clone_mv!(faults >> |fault| {
        faults.borrow_mut().push(fault.stage);
    }));

    scheduler.tick();
    scheduler.tick();

    assert_eq!(sensors.get().polls, 2);
    assert_eq!(*faults.borrow(), vec![FaultStage::Periodic]);
}

#[test]
fn subsystem_periodics_run_before_commands() {
    thread_local! {
        static ORDER: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
    }
    struct Chassis;
    impl Subsystem for Chassis {
        fn construct() -> Self {
            Self
        }

        fn periodic(&mut self) {
            ORDER.with(|order| order.borrow_mut().push("chassis.periodic"));
        }
    }

    let mut scheduler = Scheduler::new();
    let _chassis = SubsystemCell::<Chassis>::generate(&mut scheduler);
    scheduler.schedule_command(
        CommandBuilder::new()
            .execute(|| ORDER.with(|order| order.borrow_mut().push("command.exec")))
            .build(),
    );

    scheduler.tick();

    ORDER.with(|order| {
        assert_eq!(*order.borrow(), vec!["chassis.periodic", "command.exec"]);
    });
}

#[test]
fn conditions_fire_on_each_rising_edge() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let flag = Rc::new(Cell::new(false));
    let handle = Condition::new(clone_mv!(flag >> || flag.get()))
        .on_true(probe(&log, "t", Vec::new(), 1));

    scheduler.tick();
    assert!(entries(&log).is_empty());

    flag.set(true);
    scheduler.tick();
    assert_eq!(entries(&log), vec!["t.init"]);
    scheduler.tick();
    assert_eq!(entries(&log), vec!["t.init", "t.exec", "t.end(false)"]);
    scheduler.tick();

    flag.set(false);
    scheduler.tick();
    flag.set(true);
    scheduler.tick();
    assert!(entries(&log).ends_with(&["t.init".to_owned()]));
    assert!(scheduler.is_scheduled(&handle));
}

#[test]
fn interrupting_a_scheduled_group_cascades_to_children() {
    let mut scheduler = Scheduler::new();
    let log = new_log();
    let group = Command::sequential(vec![
        probe(&log, "a", Vec::new(), usize::MAX),
        probe(&log, "b", Vec::new(), usize::MAX),
    ]);
    let handle = scheduler.schedule_command(group);
    scheduler.tick();
    scheduler.cancel(&handle);

    assert_eq!(entries(&log), vec!["a.init", "a.exec", "a.end(true)"]);
}

struct AutoFollower {
    busy: usize,
    t: f64,
    follows: usize,
}
impl Subsystem for AutoFollower {
    fn construct() -> Self {
        Self {
            busy: 0,
            t: 0.0,
            follows: 0,
        }
    }

    fn periodic(&mut self) {
        // Stands in for the host loop advancing the follower.
        if self.busy > 0 {
            self.busy -= 1;
            self.t = (self.t + 0.34).min(1.0);
        }
    }
}
impl Follower for AutoFollower {
    fn follow(&mut self, _chain: &PathChain, _max_power: f64, _hold_end: bool) {
        self.follows += 1;
        self.busy = 3;
        self.t = 0.0;
    }

    fn is_busy(&self) -> bool {
        self.busy > 0
    }

    fn break_following(&mut self) {
        self.busy = 0;
    }

    fn pose(&self) -> Pose {
        Pose::default()
    }

    fn current_t_value(&self) -> f64 {
        self.t
    }
}

#[test]
fn routine_fires_event_markers_through_the_registry() {
    const PATH_FILE: &str = r#"{
        "startPoint": { "x": 8.0, "y": 60.0, "startDeg": 90.0 },
        "lines": [
            {
                "id": 1,
                "name": "cross field",
                "endPoint": { "x": 120.0, "y": 60.0 },
                "eventMarkers": [ { "id": 1, "name": "score", "position": 0.5 } ]
            }
        ]
    }"#;

    let mut scheduler = Scheduler::new();
    let follower = SubsystemCell::<AutoFollower>::generate(&mut scheduler);
    let log = new_log();
    registry::register("score", probe(&log, "score", Vec::new(), 1)).unwrap();

    let file = routine::parse_path_file(PATH_FILE).unwrap();
    let root = routine::build_routine(&file, follower.follower()).unwrap();
    let root = scheduler.schedule_command(root);

    for _ in 0..6 {
        scheduler.tick();
    }

    assert!(!scheduler.is_scheduled(&root));
    assert_eq!(follower.get().follows, 1);
    assert_eq!(
        entries(&log),
        vec!["score.init", "score.exec", "score.end(false)"]
    );

    registry::clear();
}
