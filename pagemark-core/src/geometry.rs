//! Conversion between on-screen overlay pixels and document-normalized coordinates.
//!
//! Normalized coordinates are document user-space units at scale 1 and 0° rotation,
//! origin at the top-left corner of the unrotated page.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("rotation {0} is not a multiple of 90 degrees")]
    InvalidRotation(i32),
    #[error("viewport scale {0} must be finite and positive")]
    InvalidScale(f64),
    #[error("page size {width}x{height} must be finite and positive")]
    InvalidPageSize { width: f64, height: f64 },
    #[error("geometry contains a non-finite coordinate")]
    NonFinite,
    #[error("geometry has no points")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

/// Axis-aligned rectangle, always stored with `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x0: a.x.min(b.x),
            y0: a.y.min(b.y),
            x1: a.x.max(b.x),
            y1: a.y.max(b.y),
        }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) * 0.5, (self.y0 + self.y1) * 0.5)
    }

    /// Corners in top-left, top-right, bottom-right, bottom-left order.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x0, self.y0),
            Point::new(self.x1, self.y0),
            Point::new(self.x1, self.y1),
            Point::new(self.x0, self.y1),
        ]
    }

    pub fn contains(&self, point: &Point, tolerance: f64) -> bool {
        point.x >= self.x0 - tolerance
            && point.x <= self.x1 + tolerance
            && point.y >= self.y0 - tolerance
            && point.y <= self.y1 + tolerance
    }

    fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    fn is_finite(&self) -> bool {
        self.x0.is_finite() && self.y0.is_finite() && self.x1.is_finite() && self.y1.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Geometry {
    Point(Point),
    Rect(Rect),
    Polyline { points: Vec<Point> },
    Path { strokes: Vec<Vec<Point>> },
}

impl Geometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        let finite = match self {
            Geometry::Point(p) => p.is_finite(),
            Geometry::Rect(r) => r.is_finite(),
            Geometry::Polyline { points } => {
                if points.is_empty() {
                    return Err(GeometryError::Empty);
                }
                points.iter().all(Point::is_finite)
            }
            Geometry::Path { strokes } => {
                if strokes.iter().all(|s| s.is_empty()) {
                    return Err(GeometryError::Empty);
                }
                strokes.iter().flatten().all(Point::is_finite)
            }
        };
        if finite {
            Ok(())
        } else {
            Err(GeometryError::NonFinite)
        }
    }

    pub fn bounding_box(&self) -> Option<Rect> {
        match self {
            Geometry::Point(p) => Some(Rect::from_corners(*p, *p)),
            Geometry::Rect(r) => Some(*r),
            Geometry::Polyline { points } => bounds_of(points.iter()),
            Geometry::Path { strokes } => bounds_of(strokes.iter().flatten()),
        }
    }

    /// True when `point` lies on (or within `tolerance` of) the shape.
    pub fn hit_test(&self, point: &Point, tolerance: f64) -> bool {
        match self {
            Geometry::Point(p) => p.distance_to(point) <= tolerance,
            Geometry::Rect(r) => r.contains(point, tolerance),
            Geometry::Polyline { points } => near_polyline(points, point, tolerance),
            Geometry::Path { strokes } => strokes
                .iter()
                .any(|stroke| near_polyline(stroke, point, tolerance)),
        }
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Geometry {
        self.map_points(|p| p.offset(dx, dy))
    }

    fn map_points<F>(&self, f: F) -> Geometry
    where
        F: Fn(Point) -> Point,
    {
        match self {
            Geometry::Point(p) => Geometry::Point(f(*p)),
            Geometry::Rect(r) => Geometry::Rect(Rect::from_corners(
                f(Point::new(r.x0, r.y0)),
                f(Point::new(r.x1, r.y1)),
            )),
            Geometry::Polyline { points } => Geometry::Polyline {
                points: points.iter().copied().map(&f).collect(),
            },
            Geometry::Path { strokes } => Geometry::Path {
                strokes: strokes
                    .iter()
                    .map(|stroke| stroke.iter().copied().map(&f).collect())
                    .collect(),
            },
        }
    }
}

fn bounds_of<'a>(mut points: impl Iterator<Item = &'a Point>) -> Option<Rect> {
    let first = points.next()?;
    let start = Rect::from_corners(*first, *first);
    Some(points.fold(start, |acc, p| acc.union(&Rect::from_corners(*p, *p))))
}

fn near_polyline(points: &[Point], point: &Point, tolerance: f64) -> bool {
    match points {
        [] => false,
        [only] => only.distance_to(point) <= tolerance,
        _ => points
            .windows(2)
            .any(|pair| distance_to_segment(point, &pair[0], &pair[1]) <= tolerance),
    }
}

fn distance_to_segment(point: &Point, start: &Point, end: &Point) -> f64 {
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let length_sq = dx * dx + dy * dy;
    if length_sq == 0.0 {
        return point.distance_to(start);
    }
    let t = (((point.x - start.x) * dx + (point.y - start.y) * dy) / length_sq).clamp(0.0, 1.0);
    point.distance_to(&Point::new(start.x + t * dx, start.y + t * dy))
}

/// Geometry in document user space, the only form persisted or transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedGeometry(pub Geometry);

/// Geometry in overlay pixels for one page at its current zoom and rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenGeometry(pub Geometry);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Result<Self, GeometryError> {
        if degrees % 90 != 0 {
            return Err(GeometryError::InvalidRotation(degrees));
        }
        Ok(match degrees.rem_euclid(360) {
            0 => Rotation::R0,
            90 => Rotation::R90,
            180 => Rotation::R180,
            _ => Rotation::R270,
        })
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

/// Zoom and rotation of one rendered page, plus the unscaled page size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    scale: f64,
    rotation: Rotation,
    page_width: f64,
    page_height: f64,
}

impl Viewport {
    pub fn new(
        scale: f64,
        rotation: Rotation,
        page_width: f64,
        page_height: f64,
    ) -> Result<Self, GeometryError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(GeometryError::InvalidScale(scale));
        }
        if !page_width.is_finite()
            || !page_height.is_finite()
            || page_width <= 0.0
            || page_height <= 0.0
        {
            return Err(GeometryError::InvalidPageSize {
                width: page_width,
                height: page_height,
            });
        }
        Ok(Self {
            scale,
            rotation,
            page_width,
            page_height,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Size of the overlay surface in pixels.
    pub fn screen_size(&self) -> (f64, f64) {
        match self.rotation {
            Rotation::R0 | Rotation::R180 => {
                (self.page_width * self.scale, self.page_height * self.scale)
            }
            Rotation::R90 | Rotation::R270 => {
                (self.page_height * self.scale, self.page_width * self.scale)
            }
        }
    }

    pub fn screen_center(&self) -> Point {
        let (width, height) = self.screen_size();
        Point::new(width * 0.5, height * 0.5)
    }

    pub fn point_to_screen(&self, p: Point) -> Point {
        let (w, h, s) = (self.page_width, self.page_height, self.scale);
        match self.rotation {
            Rotation::R0 => Point::new(p.x * s, p.y * s),
            Rotation::R90 => Point::new((h - p.y) * s, p.x * s),
            Rotation::R180 => Point::new((w - p.x) * s, (h - p.y) * s),
            Rotation::R270 => Point::new(p.y * s, (w - p.x) * s),
        }
    }

    pub fn point_to_normalized(&self, q: Point) -> Point {
        let (w, h, s) = (self.page_width, self.page_height, self.scale);
        let (u, v) = (q.x / s, q.y / s);
        match self.rotation {
            Rotation::R0 => Point::new(u, v),
            Rotation::R90 => Point::new(v, h - u),
            Rotation::R180 => Point::new(w - u, h - v),
            Rotation::R270 => Point::new(w - v, u),
        }
    }

    /// Converts a screen-space length (stroke width, hit tolerance) to user space.
    pub fn length_to_normalized(&self, length: f64) -> f64 {
        length / self.scale
    }
}

pub fn to_normalized(screen: &ScreenGeometry, viewport: &Viewport) -> NormalizedGeometry {
    NormalizedGeometry(screen.0.map_points(|p| viewport.point_to_normalized(p)))
}

pub fn to_screen(normalized: &NormalizedGeometry, viewport: &Viewport) -> ScreenGeometry {
    ScreenGeometry(normalized.0.map_points(|p| viewport.point_to_screen(p)))
}
