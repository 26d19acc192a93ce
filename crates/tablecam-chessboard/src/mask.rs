use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use nalgebra::{Point2, Vector2};

/// Push each vertex of a convex quad away from its centroid by `margin` pixels
/// along the vertex direction.
pub fn expand_quad(quad: &[Point2<f64>; 4], margin: f64) -> [Point2<f64>; 4] {
    let centroid = Point2::from(quad.iter().map(|p| p.coords).sum::<Vector2<f64>>() / 4.0);
    quad.map(|p| {
        let dir = p - centroid;
        let len = dir.norm();
        if len <= f64::EPSILON {
            p
        } else {
            p + dir * (margin / len)
        }
    })
}

/// Paint a quadrilateral with a constant gray level.
///
/// Returns `false` when the quad collapses to fewer than three distinct
/// pixels and nothing was drawn.
pub fn fill_quad(img: &mut GrayImage, quad: &[Point2<f64>; 4], value: u8) -> bool {
    let mut poly: Vec<Point<i32>> = quad
        .iter()
        .map(|p| Point::new(p.x.round() as i32, p.y.round() as i32))
        .collect();
    poly.dedup();
    while poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    if poly.len() < 3 {
        return false;
    }
    draw_polygon_mut(img, &poly, Luma([value]));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_covers_interior_and_spares_outside() {
        let mut img = GrayImage::from_pixel(40, 40, Luma([255]));
        let quad = [
            Point2::new(10.0, 10.0),
            Point2::new(30.0, 10.0),
            Point2::new(30.0, 30.0),
            Point2::new(10.0, 30.0),
        ];
        assert!(fill_quad(&mut img, &quad, 128));
        assert_eq!(img.get_pixel(20, 20).0[0], 128);
        assert_eq!(img.get_pixel(2, 2).0[0], 255);
        assert_eq!(img.get_pixel(35, 20).0[0], 255);
    }

    #[test]
    fn degenerate_quad_is_skipped() {
        let mut img = GrayImage::from_pixel(10, 10, Luma([0]));
        let p = Point2::new(4.2, 4.4);
        assert!(!fill_quad(&mut img, &[p, p, p, p], 128));
        assert!(img.pixels().all(|px| px.0[0] == 0));
    }

    #[test]
    fn expansion_moves_vertices_outward() {
        let quad = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        let grown = expand_quad(&quad, 2.0_f64.sqrt());
        approx::assert_relative_eq!(grown[0].x, -1.0, epsilon = 1e-12);
        approx::assert_relative_eq!(grown[2].y, 11.0, epsilon = 1e-12);
    }
}
