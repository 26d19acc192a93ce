//! Marker lists.
//!
//! Markers are pixel positions picked against the unrotated camera image. A
//! marker file is plain JSON, either
//! `{"markers": [{"label": "top", "x": 1098, "y": 342}, ...]}` or a bare
//! array of `[x, y]` pairs.

use std::fs;
use std::path::Path;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::MarkerError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    #[serde(default)]
    pub label: String,
    pub x: f64,
    pub y: f64,
}

impl Marker {
    pub fn new(label: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            label: label.into(),
            x,
            y,
        }
    }

    /// Position in the processing frame; axes are swapped when the frame is rotated.
    pub fn control_point(&self, rotate: bool) -> Point2<f64> {
        swap_axes(Point2::new(self.x, self.y), rotate)
    }
}

/// `(x, y) -> (y, x)` when `rotate` is set, identity otherwise.
#[inline]
pub fn swap_axes(p: Point2<f64>, rotate: bool) -> Point2<f64> {
    if rotate {
        Point2::new(p.y, p.x)
    } else {
        p
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MarkerFile {
    Labeled { markers: Vec<Marker> },
    Pairs(Vec<[f64; 2]>),
}

/// Ordered marker collection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerList {
    pub markers: Vec<Marker>,
}

impl MarkerList {
    pub fn new(markers: Vec<Marker>) -> Self {
        Self { markers }
    }

    pub fn from_json_str(text: &str) -> Result<Self, MarkerError> {
        let markers = match serde_json::from_str::<MarkerFile>(text)? {
            MarkerFile::Labeled { markers } => markers,
            MarkerFile::Pairs(pairs) => pairs
                .into_iter()
                .enumerate()
                .map(|(i, [x, y])| Marker::new(i.to_string(), x, y))
                .collect(),
        };
        Ok(Self { markers })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MarkerError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| MarkerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Marker positions in list order, swapped once when `rotate` is set.
    pub fn control_points(&self, rotate: bool) -> Vec<Point2<f64>> {
        self.markers.iter().map(|m| m.control_point(rotate)).collect()
    }

    /// The four surface corners (top-left, top-right, bottom-right,
    /// bottom-left) for building a homography.
    pub fn corner_quad(&self, rotate: bool) -> Result<[Point2<f64>; 4], MarkerError> {
        match self.control_points(rotate).as_slice() {
            &[a, b, c, d] => Ok([a, b, c, d]),
            other => Err(MarkerError::CornerCount(other.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_swaps_axes_once() {
        let m = Marker::new("top", 10.0, 200.0);
        assert_eq!(m.control_point(true), Point2::new(200.0, 10.0));
        assert_eq!(m.control_point(false), Point2::new(10.0, 200.0));
    }

    #[test]
    fn both_file_shapes_parse_in_order() {
        let labeled = MarkerList::from_json_str(
            r#"{"markers": [{"label": "top", "x": 1098, "y": 342}, {"label": "left-1", "x": 5.5, "y": 7}]}"#,
        )
        .expect("labeled");
        assert_eq!(labeled.len(), 2);
        assert_eq!(labeled.markers[0], Marker::new("top", 1098.0, 342.0));
        assert_eq!(labeled.markers[1].label, "left-1");

        let pairs = MarkerList::from_json_str("[[1, 2], [3, 4], [5, 6]]").expect("pairs");
        assert_eq!(
            pairs.control_points(true),
            vec![
                Point2::new(2.0, 1.0),
                Point2::new(4.0, 3.0),
                Point2::new(6.0, 5.0)
            ]
        );
    }

    #[test]
    fn malformed_lists_are_errors() {
        assert!(matches!(
            MarkerList::from_json_str(r#"{"markers": [{"x": "a"}]}"#),
            Err(MarkerError::Parse(_))
        ));
        assert!(matches!(
            MarkerList::from_json_str("[[1, 2, 3]]"),
            Err(MarkerError::Parse(_))
        ));
    }

    #[test]
    fn corner_quad_needs_exactly_four() {
        let list = MarkerList::from_json_str("[[0,0],[10,0],[10,10]]").expect("parse");
        assert!(matches!(
            list.corner_quad(false),
            Err(MarkerError::CornerCount(3))
        ));
    }
}
