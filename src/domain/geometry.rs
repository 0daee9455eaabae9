//! Geometry model
//!
//! A geometry is an ordered list of parts, each an ordered list of coordinates.
//! How many parts and points are legal depends on the owning layer's
//! [`GeometryType`], captured by a [`GeometryPolicy`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("{kind} geometry needs at least {min} points per part, part {part} has {found}")]
    TooFewPoints {
        kind: GeometryType,
        part: usize,
        min: usize,
        found: usize,
    },

    #[error("{kind} geometry allows at most {max} points")]
    TooManyPoints { kind: GeometryType, max: usize },

    #[error("{kind} geometry allows a single part")]
    SinglePart { kind: GeometryType },

    #[error("Ring {0} is not closed (first point differs from last)")]
    RingNotClosed(usize),

    #[error("Point index {index} out of range for part with {len} points")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("Coordinate {0} is not finite")]
    NonFinite(Coord),

    #[error("Unknown geometry type: {0}")]
    UnknownType(String),
}

/// Geometry type shared by all features of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    Point,
    Line,
    Polygon,
    Collection,
}

impl GeometryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "point",
            GeometryType::Line => "line",
            GeometryType::Polygon => "polygon",
            GeometryType::Collection => "collection",
        }
    }

    /// Returns the validation policy for this geometry type
    pub fn policy(&self) -> GeometryPolicy {
        GeometryPolicy::for_type(*self)
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeometryType {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "point" => Ok(GeometryType::Point),
            "line" | "linestring" => Ok(GeometryType::Line),
            "polygon" => Ok(GeometryType::Polygon),
            "collection" => Ok(GeometryType::Collection),
            other => Err(GeometryError::UnknownType(other.to_string())),
        }
    }
}

/// Structural rules a geometry must satisfy before it is written to a layer.
///
/// One engine handles every geometry kind; the differences between drawing a
/// point, a line or a polygon live entirely in this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPolicy {
    pub kind: GeometryType,
    /// Minimum points in each part
    pub min_points: usize,
    /// Maximum points in the whole geometry
    pub max_points: Option<usize>,
    /// Every part must be a closed ring (first == last)
    pub closed_ring: bool,
    /// More than one part may be started
    pub multi_part: bool,
    /// The feature is complete as soon as a single point is set
    pub single_point_closes: bool,
}

impl GeometryPolicy {
    pub fn for_type(kind: GeometryType) -> Self {
        match kind {
            GeometryType::Point => Self {
                kind,
                min_points: 1,
                max_points: Some(1),
                closed_ring: false,
                multi_part: false,
                single_point_closes: true,
            },
            GeometryType::Line => Self {
                kind,
                min_points: 2,
                max_points: None,
                closed_ring: false,
                multi_part: false,
                single_point_closes: false,
            },
            GeometryType::Polygon => Self {
                kind,
                min_points: 4,
                max_points: None,
                closed_ring: true,
                multi_part: true,
                single_point_closes: false,
            },
            GeometryType::Collection => Self {
                kind,
                min_points: 1,
                max_points: None,
                closed_ring: false,
                multi_part: true,
                single_point_closes: false,
            },
        }
    }

    /// Checks that one more point may be added to `geometry`
    pub fn check_can_add(&self, geometry: &Geometry) -> Result<(), GeometryError> {
        match self.max_points {
            Some(max) if geometry.point_count() >= max => Err(GeometryError::TooManyPoints {
                kind: self.kind,
                max,
            }),
            _ => Ok(()),
        }
    }

    /// Checks that a new part may be started on `geometry`
    pub fn check_can_begin_part(&self, geometry: &Geometry) -> Result<(), GeometryError> {
        if !self.multi_part && geometry.point_count() > 0 {
            return Err(GeometryError::SinglePart { kind: self.kind });
        }
        Ok(())
    }

    /// Validates a complete geometry
    pub fn validate(&self, geometry: &Geometry, epsilon: f64) -> Result<(), GeometryError> {
        if let Some(max) = self.max_points {
            if geometry.point_count() > max {
                return Err(GeometryError::TooManyPoints {
                    kind: self.kind,
                    max,
                });
            }
        }
        if !self.multi_part && geometry.parts.len() > 1 {
            return Err(GeometryError::SinglePart { kind: self.kind });
        }

        for (idx, part) in geometry.parts.iter().enumerate() {
            if let Some(c) = part.iter().find(|c| !c.is_finite()) {
                return Err(GeometryError::NonFinite(*c));
            }
            if part.len() < self.min_points {
                return Err(GeometryError::TooFewPoints {
                    kind: self.kind,
                    part: idx,
                    min: self.min_points,
                    found: part.len(),
                });
            }
            if self.closed_ring && !ring_is_closed(part, epsilon) {
                return Err(GeometryError::RingNotClosed(idx));
            }
        }

        Ok(())
    }
}

/// A coordinate pair or triple
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }

    /// True when every axis holds a finite number
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.map_or(true, f64::is_finite)
    }

    /// Compares two coordinates within `epsilon` on every axis
    pub fn approx_eq(&self, other: &Coord, epsilon: f64) -> bool {
        let z_eq = match (self.z, other.z) {
            (Some(a), Some(b)) => (a - b).abs() <= epsilon,
            (None, None) => true,
            _ => false,
        };
        (self.x - other.x).abs() <= epsilon && (self.y - other.y).abs() <= epsilon && z_eq
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.z {
            Some(z) => write!(f, "{},{},{}", self.x, self.y, z),
            None => write!(f, "{},{}", self.x, self.y),
        }
    }
}

impl FromStr for Coord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<f64> = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("Invalid coordinate '{}': {}", s, e))?;

        if values.iter().any(|v| !v.is_finite()) {
            return Err(format!("Invalid coordinate '{}': values must be finite", s));
        }

        match values.as_slice() {
            [x, y] => Ok(Coord::new(*x, *y)),
            [x, y, z] => Ok(Coord::with_z(*x, *y, *z)),
            _ => Err(format!("Invalid coordinate '{}': expected x,y or x,y,z", s)),
        }
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn of_point(c: &Coord) -> Self {
        Self {
            min_x: c.x,
            min_y: c.y,
            max_x: c.x,
            max_y: c.y,
        }
    }

    pub fn expand(&mut self, c: &Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    pub fn merge(&mut self, other: &Extent) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Merges optional extents, keeping whichever side is present
    pub fn union(a: Option<Extent>, b: Option<Extent>) -> Option<Extent> {
        match (a, b) {
            (Some(mut a), Some(b)) => {
                a.merge(&b);
                Some(a)
            }
            (a, b) => a.or(b),
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) - ({}, {})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Ring orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winding {
    Clockwise,
    CounterClockwise,
    /// Zero area (collinear or too few points)
    Degenerate,
}

/// Returns true if the ring's first and last points coincide
pub fn ring_is_closed(ring: &[Coord], epsilon: f64) -> bool {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 => first.approx_eq(last, epsilon),
        _ => false,
    }
}

/// Twice the signed area of a ring (shoelace). Positive means counter-clockwise.
pub fn signed_area2(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = &ring[i];
        let b = &ring[(i + 1) % ring.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum
}

pub fn winding(ring: &[Coord]) -> Winding {
    let area = signed_area2(ring);
    if area > 0.0 {
        Winding::CounterClockwise
    } else if area < 0.0 {
        Winding::Clockwise
    } else {
        Winding::Degenerate
    }
}

/// An editable geometry: a list of parts, each a list of points
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub parts: Vec<Vec<Coord>>,
}

impl Geometry {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn point(c: Coord) -> Self {
        Self {
            parts: vec![vec![c]],
        }
    }

    pub fn line(points: Vec<Coord>) -> Self {
        Self {
            parts: vec![points],
        }
    }

    pub fn polygon(rings: Vec<Vec<Coord>>) -> Self {
        Self { parts: rings }
    }

    /// Total number of points over all parts
    pub fn point_count(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }

    pub fn extent(&self) -> Option<Extent> {
        let mut points = self.parts.iter().flatten();
        let first = points.next()?;
        let mut extent = Extent::of_point(first);
        for c in points {
            extent.expand(c);
        }
        Some(extent)
    }

    /// Compares two geometries point by point within `epsilon`
    pub fn approx_eq(&self, other: &Geometry, epsilon: f64) -> bool {
        self.parts.len() == other.parts.len()
            && self.parts.iter().zip(&other.parts).all(|(a, b)| {
                a.len() == b.len() && a.iter().zip(b).all(|(p, q)| p.approx_eq(q, epsilon))
            })
    }

    /// Returns true if the exterior ring is clockwise and every hole is
    /// counter-clockwise. Degenerate rings are accepted as-is.
    pub fn has_conformant_winding(&self) -> bool {
        self.parts.iter().enumerate().all(|(idx, ring)| {
            let expected = if idx == 0 {
                Winding::Clockwise
            } else {
                Winding::CounterClockwise
            };
            let actual = winding(ring);
            actual == expected || actual == Winding::Degenerate
        })
    }

    /// Reorients rings so the exterior is clockwise and holes are
    /// counter-clockwise. Returns true if any ring was reversed.
    pub fn orient_rings(&mut self) -> bool {
        let mut changed = false;
        for (idx, ring) in self.parts.iter_mut().enumerate() {
            let wanted = if idx == 0 {
                Winding::Clockwise
            } else {
                Winding::CounterClockwise
            };
            let actual = winding(ring);
            if actual != wanted && actual != Winding::Degenerate {
                ring.reverse();
                changed = true;
            }
        }
        changed
    }
}

/// Resolves a `-1`-means-last position against a length.
///
/// `allow_end` permits `index == len` (insertion after the last point).
pub(crate) fn resolve_index(
    index: isize,
    len: usize,
    allow_end: bool,
) -> Result<usize, GeometryError> {
    let resolved = if index == -1 {
        if allow_end {
            Some(len)
        } else {
            len.checked_sub(1)
        }
    } else if index >= 0 {
        let idx = index as usize;
        let limit = if allow_end { len } else { len.saturating_sub(1) };
        if (allow_end || len > 0) && idx <= limit {
            Some(idx)
        } else {
            None
        }
    } else {
        None
    };

    resolved.ok_or(GeometryError::IndexOutOfRange { index, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn square_ccw() -> Vec<Coord> {
        vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 0.0),
            Coord::new(1.0, 1.0),
            Coord::new(0.0, 1.0),
            Coord::new(0.0, 0.0),
        ]
    }

    #[test]
    fn winding_of_square() {
        let ring = square_ccw();
        assert_eq!(winding(&ring), Winding::CounterClockwise);

        let mut reversed = ring.clone();
        reversed.reverse();
        assert_eq!(winding(&reversed), Winding::Clockwise);
    }

    #[test]
    fn orient_rings_fixes_exterior_and_holes() {
        let hole_cw = vec![
            Coord::new(0.2, 0.2),
            Coord::new(0.2, 0.8),
            Coord::new(0.8, 0.8),
            Coord::new(0.8, 0.2),
            Coord::new(0.2, 0.2),
        ];
        let mut geometry = Geometry::polygon(vec![square_ccw(), hole_cw]);
        assert!(!geometry.has_conformant_winding());

        assert!(geometry.orient_rings());
        assert_eq!(winding(&geometry.parts[0]), Winding::Clockwise);
        assert_eq!(winding(&geometry.parts[1]), Winding::CounterClockwise);
        assert!(geometry.has_conformant_winding());

        // Second pass is a no-op
        assert!(!geometry.orient_rings());
    }

    #[test]
    fn polygon_policy_requires_closed_ring() {
        let policy = GeometryType::Polygon.policy();
        let mut ring = square_ccw();
        assert!(policy.validate(&Geometry::polygon(vec![ring.clone()]), EPS).is_ok());

        ring.pop();
        ring.push(Coord::new(0.0, 0.5));
        assert_eq!(
            policy.validate(&Geometry::polygon(vec![ring]), EPS),
            Err(GeometryError::RingNotClosed(0))
        );
    }

    #[test]
    fn line_policy_requires_two_points() {
        let policy = GeometryType::Line.policy();
        let err = policy
            .validate(&Geometry::line(vec![Coord::new(0.0, 0.0)]), EPS)
            .unwrap_err();
        assert!(matches!(err, GeometryError::TooFewPoints { min: 2, found: 1, .. }));
    }

    #[test]
    fn point_policy_limits_to_one() {
        let policy = GeometryType::Point.policy();
        let geometry = Geometry::point(Coord::new(1.0, 2.0));
        assert!(policy.check_can_add(&geometry).is_err());
        assert!(policy.check_can_begin_part(&geometry).is_err());
        assert!(policy.single_point_closes);
    }

    #[test]
    fn resolve_index_rules() {
        assert_eq!(resolve_index(-1, 3, true), Ok(3));
        assert_eq!(resolve_index(-1, 3, false), Ok(2));
        assert_eq!(resolve_index(0, 0, true), Ok(0));
        assert!(resolve_index(0, 0, false).is_err());
        assert!(resolve_index(-1, 0, false).is_err());
        assert!(resolve_index(4, 3, true).is_err());
        assert!(resolve_index(3, 3, false).is_err());
        assert!(resolve_index(-2, 3, true).is_err());
    }

    #[test]
    fn parse_coord() {
        assert_eq!("1.5, 2".parse::<Coord>().unwrap(), Coord::new(1.5, 2.0));
        assert_eq!(
            "1,2,3".parse::<Coord>().unwrap(),
            Coord::with_z(1.0, 2.0, 3.0)
        );
        assert!("1".parse::<Coord>().is_err());
        assert!("a,b".parse::<Coord>().is_err());
        assert!("nan,1".parse::<Coord>().is_err());
        assert!("1,inf".parse::<Coord>().is_err());
        assert!("1,2,-inf".parse::<Coord>().is_err());
    }

    #[test]
    fn policy_rejects_non_finite_coordinates() {
        assert!(!Coord::new(f64::NAN, 0.0).is_finite());
        assert!(!Coord::with_z(0.0, 0.0, f64::INFINITY).is_finite());
        assert!(Coord::with_z(0.0, 0.0, 1.0).is_finite());

        let policy = GeometryType::Line.policy();
        let bad = Coord::new(1.0, f64::NEG_INFINITY);
        let err = policy
            .validate(&Geometry::line(vec![Coord::new(0.0, 0.0), bad]), EPS)
            .unwrap_err();
        assert!(matches!(err, GeometryError::NonFinite(c) if c.x == 1.0));
    }

    #[test]
    fn extent_covers_all_parts() {
        let geometry = Geometry::polygon(vec![
            square_ccw(),
            vec![Coord::new(-2.0, 5.0)],
        ]);
        let extent = geometry.extent().unwrap();
        assert_eq!(extent.min_x, -2.0);
        assert_eq!(extent.max_y, 5.0);
        assert!(Geometry::new().extent().is_none());
    }

    proptest! {
        #[test]
        fn orient_rings_always_conformant(
            pts in prop::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 3..12)
        ) {
            let mut ring: Vec<Coord> = pts.iter().map(|(x, y)| Coord::new(*x, *y)).collect();
            ring.push(ring[0]);
            let mut geometry = Geometry::polygon(vec![ring]);
            geometry.orient_rings();
            prop_assert!(geometry.has_conformant_winding());
        }
    }
}
