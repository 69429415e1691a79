//! Data carriers for paths and poses.
//!
//! The control math that actually tracks these shapes lives behind the
//! [`Follower`](crate::follow::Follower) capability; this module only moves
//! the geometry around.

use std::f64::consts::PI;

use serde::Deserialize;

/// A point on the field, in field units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A planar pose: position plus heading in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

/// Reduces an angle to `[-pi, pi]`.
#[must_use]
pub fn wrap_angle(radians: f64) -> f64 {
    let wrapped = radians.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// How the heading target evolves along a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadingInterpolation {
    /// Interpolate heading linearly across the segment.
    Linear,
    /// Face along the path's direction of travel.
    #[default]
    Tangential,
    /// Hold a fixed heading for the whole segment.
    Constant,
}

/// One drivable piece of a chain: a line or a Bezier-style curve between two
/// points, with a heading behavior and an optional reversed travel direction.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub start: Point,
    pub end: Point,
    pub control_points: Vec<Point>,
    pub heading: HeadingInterpolation,
    pub reverse: bool,
}

impl PathSegment {
    /// A straight segment from `start` to `end`.
    #[must_use]
    pub fn line(start: Point, end: Point) -> Self {
        Self {
            start,
            end,
            control_points: Vec::new(),
            heading: HeadingInterpolation::default(),
            reverse: false,
        }
    }

    /// A curved segment shaped by `control_points`.
    #[must_use]
    pub fn curve(start: Point, end: Point, control_points: Vec<Point>) -> Self {
        Self {
            start,
            end,
            control_points,
            heading: HeadingInterpolation::default(),
            reverse: false,
        }
    }

    #[must_use]
    pub fn with_heading(mut self, heading: HeadingInterpolation) -> Self {
        self.heading = heading;
        self
    }

    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// An ordered run of segments handed to a follower as one unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PathChain {
    segments: Vec<PathSegment>,
}

impl PathChain {
    #[must_use]
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Collects segments for a chain that is not materialized yet.
#[derive(Debug, Clone, Default)]
pub struct PathChainBuilder {
    segments: Vec<PathSegment>,
}

impl PathChainBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn build(self) -> PathChain {
        PathChain::new(self.segments)
    }
}
