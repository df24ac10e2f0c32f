//! 3-D Axis Aligned Bounding Boxes

#![allow(dead_code)]

use crate::common::*;
use num_traits::Num;
use std::ops::Index;

use super::{Point3, Point3f, Ray, Vector3};

/// A 3-D axis aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds3<T> {
    /// Minimum bounds.
    pub p_min: Point3<T>,

    /// Maximum bounds.
    pub p_max: Point3<T>,
}

/// 3-D bounding box containing `Float` points.
pub type Bounds3f = Bounds3<Float>;

impl<T: Num + PartialOrd + Copy> Bounds3<T> {
    /// Creates a new bounding box from 2 points. The minimum and maximum
    /// bounds are used for each coordinate axis.
    ///
    /// * `p1` - First point.
    /// * `p2` - Second point.
    pub fn new(p1: Point3<T>, p2: Point3<T>) -> Self {
        Self {
            p_min: p1.min(&p2),
            p_max: p1.max(&p2),
        }
    }

    /// Returns true if the bounds are non-degenerate in the sense that every
    /// minimum coordinate is at most the corresponding maximum coordinate.
    pub fn is_valid(&self) -> bool {
        self.p_max.x >= self.p_min.x
            && self.p_max.y >= self.p_min.y
            && self.p_max.z >= self.p_min.z
    }

    /// Returns the vector along the box diagonal from the minimum point to
    /// the maximum point.
    pub fn diagonal(&self) -> Vector3<T> {
        self.p_max - self.p_min
    }

    /// Returns the surface area of the bounding box. Invalid boxes report
    /// zero area.
    pub fn surface_area(&self) -> T {
        if !self.is_valid() {
            return T::zero();
        }
        let d = self.diagonal();
        let h = d.x * d.y + d.x * d.z + d.y * d.z;
        h + h
    }

    /// Returns the axis with the largest extent.
    pub fn maximum_extent(&self) -> Axis {
        self.diagonal().max_dimension()
    }

    /// Returns true if a point is inside the bounding box.
    ///
    /// * `p` - The point.
    pub fn contains(&self, p: &Point3<T>) -> bool {
        (p.x >= self.p_min.x && p.x <= self.p_max.x)
            && (p.y >= self.p_min.y && p.y <= self.p_max.y)
            && (p.z >= self.p_min.z && p.z <= self.p_max.z)
    }

    /// Return a bounding box grown to also contain a point.
    ///
    /// * `p` - The point.
    pub fn union_point(&self, p: &Point3<T>) -> Self {
        Self {
            p_min: self.p_min.min(p),
            p_max: self.p_max.max(p),
        }
    }

    /// Return a bounding box containing both bounding boxes.
    ///
    /// * `other` - The other bounding box.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            p_min: self.p_min.min(&other.p_min),
            p_max: self.p_max.max(&other.p_max),
        }
    }

    /// Return the intersection of both bounding boxes. The result may be
    /// invalid when the boxes do not overlap.
    ///
    /// * `other` - The other bounding box.
    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            p_min: self.p_min.max(&other.p_min),
            p_max: self.p_max.min(&other.p_max),
        }
    }
}

impl Bounds3f {
    /// Returns a bounding box where minimum and maximum bounds are flipped
    /// infinities so it can be grown from nothing iteratively.
    pub fn empty() -> Self {
        Self {
            p_min: Point3f::new(INFINITY, INFINITY, INFINITY),
            p_max: Point3f::new(-INFINITY, -INFINITY, -INFINITY),
        }
    }

    /// Intersects a ray against the box and returns the parametric interval
    /// overlapping the ray segment, ignoring the segment's own `[mint, maxt]`
    /// except for the final overlap test.
    ///
    /// * `ray` - The ray.
    pub fn ray_intersect(&self, ray: &Ray) -> Option<(Float, Float)> {
        let mut near_t = -INFINITY;
        let mut far_t = INFINITY;

        for i in 0..3 {
            let origin = ray.o[i];
            let min_val = self.p_min[i];
            let max_val = self.p_max[i];

            if ray.d[i] == 0.0 {
                if origin < min_val || origin > max_val {
                    return None;
                }
            } else {
                let mut t0 = (min_val - origin) * ray.d_rcp[i];
                let mut t1 = (max_val - origin) * ray.d_rcp[i];
                if t0 > t1 {
                    std::mem::swap(&mut t0, &mut t1);
                }
                near_t = max(t0, near_t);
                far_t = min(t1, far_t);
                if near_t > far_t {
                    return None;
                }
            }
        }

        if ray.mint <= far_t && near_t <= ray.maxt {
            Some((near_t, far_t))
        } else {
            None
        }
    }
}

impl Default for Bounds3f {
    /// Returns the empty box.
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Index<usize> for Bounds3<T> {
    type Output = Point3<T>;

    /// Index the minimum and maximum bounds.
    ///
    /// * `i` - 0 for minimum and 1 for maximum.
    fn index(&self, i: usize) -> &Self::Output {
        match i {
            0 => &self.p_min,
            1 => &self.p_max,
            _ => panic!("Invalid index for std::Index on Bounds3<T>"),
        }
    }
}

impl<T: Num + PartialOrd + Copy> From<Point3<T>> for Bounds3<T> {
    /// Use a point as minimum and maximum bounds.
    ///
    /// * `p` - The point.
    fn from(p: Point3<T>) -> Self {
        Self { p_min: p, p_max: p }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vector3f;

    #[test]
    fn union_grows_from_empty() {
        let b = Bounds3f::empty()
            .union_point(&Point3f::new(1.0, 2.0, 3.0))
            .union_point(&Point3f::new(-1.0, 0.0, 5.0));
        assert_eq!(b.p_min, Point3f::new(-1.0, 0.0, 3.0));
        assert_eq!(b.p_max, Point3f::new(1.0, 2.0, 5.0));
    }

    #[test]
    fn surface_area_of_unit_cube() {
        let b = Bounds3f::new(Point3f::zero(), Point3f::new(1.0, 1.0, 1.0));
        assert_eq!(b.surface_area(), 6.0);
    }

    #[test]
    fn planar_box_has_nonzero_area() {
        let b = Bounds3f::new(Point3f::zero(), Point3f::new(2.0, 3.0, 0.0));
        assert_eq!(b.surface_area(), 12.0);
    }

    #[test]
    fn disjoint_intersection_is_invalid() {
        let b1 = Bounds3f::new(Point3f::zero(), Point3f::new(1.0, 1.0, 1.0));
        let b2 = Bounds3f::new(Point3f::new(2.0, 2.0, 2.0), Point3f::new(3.0, 3.0, 3.0));
        assert!(!b1.intersect(&b2).is_valid());
    }

    #[test]
    fn ray_through_box() {
        let b = Bounds3f::new(Point3f::new(-1.0, -1.0, -1.0), Point3f::new(1.0, 1.0, 1.0));
        let r = Ray::new(
            Point3f::new(-5.0, 0.0, 0.0),
            Vector3f::new(1.0, 0.0, 0.0),
            0.0,
            INFINITY,
        );
        let (near, far) = b.ray_intersect(&r).unwrap();
        assert_eq!(near, 4.0);
        assert_eq!(far, 6.0);
    }

    #[test]
    fn ray_parallel_outside_misses() {
        let b = Bounds3f::new(Point3f::new(-1.0, -1.0, -1.0), Point3f::new(1.0, 1.0, 1.0));
        let r = Ray::new(
            Point3f::new(-5.0, 2.0, 0.0),
            Vector3f::new(1.0, 0.0, 0.0),
            0.0,
            INFINITY,
        );
        assert!(b.ray_intersect(&r).is_none());
    }
}
