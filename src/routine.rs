//! The path-file collaborator: parses the visualizer's JSON document and
//! builds an autonomous routine command tree out of it.
//!
//! Each line becomes `wait-before -> follow (with event markers as deadline
//! companions) -> wait-after`, and the lines run sequentially. Event markers
//! name commands in the [`registry`](crate::registry); firing one schedules
//! the named command through the scheduler, so marker work runs alongside
//! the routine rather than inside it.

use std::{cell::RefCell, rc::Rc, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    commands::Command,
    follow::{FollowPathCommand, FollowerHandle, ProgressTracker},
    geometry::{HeadingInterpolation, PathChain, PathSegment, Point, Pose},
    groups::CommandError,
    registry, scheduler,
};

/// Field edge length, in the same units as the path file.
pub const FIELD_SIZE: f64 = 144.0;

/// The on-disk document, in the visualizer's coordinate frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathFile {
    pub start_point: StartPoint,
    pub lines: Vec<PathLine>,
    #[serde(default)]
    pub sequence: Vec<SequenceStep>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPoint {
    pub x: f64,
    pub y: f64,
    pub start_deg: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathLine {
    pub id: u32,
    pub name: String,
    pub end_point: EndPoint,
    #[serde(default)]
    pub control_points: Vec<RawPoint>,
    #[serde(default)]
    pub event_markers: Vec<EventMarker>,
    #[serde(default)]
    pub wait_before_ms: u64,
    #[serde(default)]
    pub wait_after_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub heading: HeadingInterpolation,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawPoint {
    pub x: f64,
    pub y: f64,
}

/// A named trigger point along a line, `position` in `[0, 1]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMarker {
    pub id: u32,
    pub name: String,
    pub position: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStep {
    pub kind: String,
    pub line_id: u32,
}

impl PathFile {
    /// The robot's starting pose in the field frame. The routine builder
    /// seeds its segment cursor from this; the host uses it to localize the
    /// robot before scheduling the routine, since the follower owns pose
    /// tracking from then on.
    #[must_use]
    pub fn start_pose(&self) -> Pose {
        to_field_pose(
            self.start_point.x,
            self.start_point.y,
            self.start_point.start_deg,
        )
    }
}

#[derive(Debug, Error)]
pub enum RoutineError {
    #[error("malformed path file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("sequence references unknown line {0}")]
    UnknownLine(u32),
    #[error("sequence step kind {0:?} is not supported")]
    UnsupportedStep(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Visualizer `(x, y, deg)` to robot field pose. The visualizer's frame is
/// rotated a quarter turn and measures headings from its own zero.
#[must_use]
pub fn to_field_pose(x: f64, y: f64, deg: f64) -> Pose {
    Pose {
        x: y,
        y: FIELD_SIZE - x,
        heading: (deg - 90.0).to_radians(),
    }
}

fn to_field_point(x: f64, y: f64) -> Point {
    Point {
        x: y,
        y: FIELD_SIZE - x,
    }
}

/// Parses a path-file document.
///
/// # Errors
/// - [`RoutineError::Parse`] if the JSON does not match the schema.
pub fn parse_path_file(json: &str) -> Result<PathFile, RoutineError> {
    Ok(serde_json::from_str(json)?)
}

/// Builds the routine command for `file`, to be scheduled as one root.
///
/// # Errors
/// - [`RoutineError::UnknownLine`] / [`RoutineError::UnsupportedStep`] if the
///   sequence is inconsistent with the lines.
pub fn build_routine(file: &PathFile, follower: FollowerHandle) -> Result<Command, RoutineError> {
    let ordered: Vec<&PathLine> = if file.sequence.is_empty() {
        file.lines.iter().collect()
    } else {
        file.sequence
            .iter()
            .map(|step| {
                if step.kind != "path" {
                    return Err(RoutineError::UnsupportedStep(step.kind.clone()));
                }
                file.lines
                    .iter()
                    .find(|line| line.id == step.line_id)
                    .ok_or(RoutineError::UnknownLine(step.line_id))
            })
            .collect::<Result<_, _>>()?
    };

    let start = file.start_pose();
    let mut cursor = Point {
        x: start.x,
        y: start.y,
    };
    let mut steps = Vec::with_capacity(ordered.len());
    for line in ordered {
        let end = to_field_point(line.end_point.x, line.end_point.y);
        let control_points = line
            .control_points
            .iter()
            .map(|point| to_field_point(point.x, point.y))
            .collect();
        let segment = PathSegment {
            start: cursor,
            end,
            control_points,
            heading: line.end_point.heading,
            reverse: line.end_point.reverse,
        };
        cursor = end;
        steps.push(line_command(
            line,
            PathChain::new(vec![segment]),
            follower,
        )?);
    }
    Ok(Command::sequential(steps).with_name("auto routine"))
}

/// One line's command: optional waits around a follow, with event markers
/// watching a shared progress tracker as deadline companions.
fn line_command(
    line: &PathLine,
    chain: PathChain,
    follower: FollowerHandle,
) -> Result<Command, RoutineError> {
    let follow: Command = FollowPathCommand::new(follower, chain.clone()).into();
    let body = if line.event_markers.is_empty() {
        follow
    } else {
        let tracker = Rc::new(RefCell::new(ProgressTracker::new(follower)));
        tracker.borrow_mut().bind_chain(&chain);
        let mut companions = Vec::with_capacity(line.event_markers.len());
        for marker in &line.event_markers {
            tracker
                .borrow_mut()
                .add_event(marker.name.as_str(), marker.position);
            let watch = {
                let tracker = tracker.clone();
                let name = marker.name.clone();
                Command::wait_until(move || tracker.borrow_mut().should_trigger(&name))
            };
            let fire = {
                let name = marker.name.clone();
                Command::instant(move || {
                    let handle = registry::get(&name);
                    if scheduler::schedule(&handle).is_err() {
                        tracing::warn!("no scheduler to run event marker {name:?}");
                    }
                })
            };
            companions.push(watch.and_then(fire));
        }
        Command::deadline(follow, companions)?
    };

    let mut parts = Vec::new();
    if line.wait_before_ms > 0 {
        parts.push(Command::wait(Duration::from_millis(line.wait_before_ms)));
    }
    parts.push(body);
    if line.wait_after_ms > 0 {
        parts.push(Command::wait(Duration::from_millis(line.wait_after_ms)));
    }
    let command = if parts.len() == 1 {
        parts.pop().unwrap_or_default()
    } else {
        Command::sequential(parts)
    };
    Ok(command.with_name(line.name.clone()))
}
