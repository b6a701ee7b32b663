use glam::{IVec3, UVec3, Vec2, Vec3, Vec3A, Vec3Swizzles as _};

/// An axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb3d {
    /// The minimum corner of the box
    pub min: Vec3,
    /// The maximum corner of the box
    pub max: Vec3,
}

impl Aabb3d {
    /// Creates a new AABB from a center and half extents.
    #[inline]
    pub fn new(center: impl Into<Vec3>, half_size: impl Into<Vec3>) -> Self {
        let center = center.into();
        let half_size = half_size.into();
        Self {
            min: center - half_size,
            max: center + half_size,
        }
    }

    /// Computes the AABB of a set of vertices.
    /// Returns `None` if `verts` is empty.
    pub fn from_verts<T>(verts: &[T]) -> Option<Self>
    where
        T: Into<Vec3> + Copy,
    {
        let mut iter = verts.iter().map(|v| (*v).into());
        let first: Vec3 = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), v| (min.min(v), max.max(v)));
        Some(Self { min, max })
    }

    /// Returns the extents of the box.
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Returns whether the two boxes overlap. Touching boxes count as overlapping.
    #[inline]
    pub fn intersects(&self, other: &Aabb3d) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Returns the smallest box containing both boxes.
    #[inline]
    pub fn union(&self, other: &Aabb3d) -> Aabb3d {
        Aabb3d {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// An axis-aligned rectangle on the xz-plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb2d {
    /// The minimum corner, `x` is the world x-axis and `y` the world z-axis
    pub min: Vec2,
    /// The maximum corner, `x` is the world x-axis and `y` the world z-axis
    pub max: Vec2,
}

impl Aabb2d {
    /// Returns whether the two rectangles overlap. Touching rectangles count as overlapping.
    #[inline]
    pub fn intersects(&self, other: &Aabb2d) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }
}

impl From<Aabb3d> for Aabb2d {
    fn from(aabb: Aabb3d) -> Self {
        Self {
            min: aabb.min.xz(),
            max: aabb.max.xz(),
        }
    }
}

pub(crate) trait TriangleIndices {
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A;
}

impl TriangleIndices for UVec3 {
    #[inline]
    fn normal(&self, vertices: &[Vec3A]) -> Vec3A {
        let a = vertices[self[0] as usize];
        let b = vertices[self[1] as usize];
        let c = vertices[self[2] as usize];
        let ab = b - a;
        let ac = c - a;
        ab.cross(ac).normalize_or_zero()
    }
}

pub(crate) trait TriangleVertices {
    fn aabb(&self) -> Aabb3d;
}

impl TriangleVertices for [Vec3A; 3] {
    #[inline]
    fn aabb(&self) -> Aabb3d {
        let min = self[0].min(self[1]).min(self[2]);
        let max = self[0].max(self[1]).max(self[2]);
        Aabb3d {
            min: min.into(),
            max: max.into(),
        }
    }
}

/// Gets the standard width (x-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The width offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_x(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [-1, 0, 1, 0];
    OFFSET[direction as usize & 0x03]
}

/// Gets the standard height (z-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The height offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_z(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [0, 1, 0, -1];
    OFFSET[direction as usize & 0x03]
}

/// Gets the direction for the specified offset. One of x and z should be 0.
/// # Returns
///
/// The direction that represents the offset. Returns 0 for offsets that are not cardinal.
#[inline]
pub(crate) fn dir_offset(offset_x: i32, offset_z: i32) -> u8 {
    const DIRS: [u8; 5] = [3, 0, 0xff, 2, 1];
    let index = (((offset_z + 1) << 1) + offset_x) as usize;
    DIRS.get(index).copied().filter(|dir| *dir != 0xff).unwrap_or(0)
}

#[inline]
pub(crate) fn next(i: usize, n: usize) -> usize {
    if i + 1 < n { i + 1 } else { 0 }
}

#[inline]
pub(crate) fn prev(i: usize, n: usize) -> usize {
    if i >= 1 { i - 1 } else { n - 1 }
}

/// Squared distance between a point and a line segment on the xz-plane.
pub(crate) fn distance_squared_between_point_and_line_vec2(point: Vec2, (p, q): (Vec2, Vec2)) -> f32 {
    let pq = q - p;
    let dx = point - p;
    let d = pq.length_squared();
    let mut t = pq.dot(dx);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let closest = p + pq * t - point;
    closest.length_squared()
}

/// Squared distance between a point and a line segment in 3D.
pub(crate) fn distance_squared_between_point_and_line_vec3(
    point: Vec3A,
    (p, q): (Vec3A, Vec3A),
) -> f32 {
    let pq = q - p;
    let dx = point - p;
    let d = pq.length_squared();
    let mut t = pq.dot(dx);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let closest = p + pq * t - point;
    closest.length_squared()
}

/// Squared distance between a point and a line segment on the integer grid, only using the x and z axes.
pub(crate) fn distance_squared_between_point_and_line_ivec2(
    point: (i32, i32),
    p: (i32, i32),
    q: (i32, i32),
) -> f32 {
    let pqx = (q.0 - p.0) as f32;
    let pqz = (q.1 - p.1) as f32;
    let dx = (point.0 - p.0) as f32;
    let dz = (point.1 - p.1) as f32;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p.0 as f32 + t * pqx - point.0 as f32;
    let dz = p.1 as f32 + t * pqz - point.1 as f32;
    dx * dx + dz * dz
}

/// Twice the signed area of the triangle `a, b, c` on the xz-plane.
/// Positive when `c` lies to the left of the directed line `a -> b` when looking down on the grid.
#[inline]
pub(crate) fn area2(a: IVec3, b: IVec3, c: IVec3) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

/// Returns true if `c` is strictly to the left of the directed line through `a` to `b`.
#[inline]
pub(crate) fn left(a: IVec3, b: IVec3, c: IVec3) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: IVec3, b: IVec3, c: IVec3) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: IVec3, b: IVec3, c: IVec3) -> bool {
    area2(a, b, c) == 0
}

/// Returns true if `ab` properly intersects `cd`: they share a point interior to both segments.
/// The properness of the intersection is ensured by using strict leftness.
pub(crate) fn intersect_prop(a: IVec3, b: IVec3, c: IVec3, d: IVec3) -> bool {
    // Eliminate improper cases.
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// Returns true if (a, b, c) are collinear and point `c` lies on the closed segment `ab`.
pub(crate) fn between(a: IVec3, b: IVec3, c: IVec3) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    // If ab not vertical, check betweenness on x; else on z.
    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
    }
}

/// Returns true if segments `ab` and `cd` intersect, properly or improperly.
pub(crate) fn intersect(a: IVec3, b: IVec3, c: IVec3, d: IVec3) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

#[inline]
pub(crate) fn vequal_xz(a: IVec3, b: IVec3) -> bool {
    a.x == b.x && a.z == b.z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_offsets_round_trip() {
        for dir in 0..4 {
            let dx = dir_offset_x(dir) as i32;
            let dz = dir_offset_z(dir) as i32;
            assert_eq!(dir_offset(dx, dz), dir);
        }
    }

    #[test]
    fn opposite_directions_cancel_out() {
        for dir in 0..4_u8 {
            let opposite = (dir + 2) & 0x3;
            assert_eq!(dir_offset_x(dir) + dir_offset_x(opposite), 0);
            assert_eq!(dir_offset_z(dir) + dir_offset_z(opposite), 0);
        }
    }

    #[test]
    fn aabb_from_verts() {
        let verts = [
            Vec3A::new(1.0, 2.0, 3.0),
            Vec3A::new(-1.0, 5.0, 0.0),
            Vec3A::new(0.0, 0.0, 4.0),
        ];
        let aabb = Aabb3d::from_verts(&verts).unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 5.0, 4.0));
        assert!(Aabb3d::from_verts::<Vec3A>(&[]).is_none());
    }

    #[test]
    fn segment_intersection() {
        let a = IVec3::new(0, 0, 0);
        let b = IVec3::new(4, 0, 4);
        let c = IVec3::new(0, 0, 4);
        let d = IVec3::new(4, 0, 0);
        assert!(intersect_prop(a, b, c, d));
        assert!(intersect(a, b, c, d));
        let e = IVec3::new(5, 0, 5);
        let f = IVec3::new(6, 0, 9);
        assert!(!intersect(a, b, e, f));
        // Touching at an endpoint is an improper intersection.
        assert!(!intersect_prop(a, b, b, f));
        assert!(intersect(a, b, b, f));
    }

    #[test]
    fn point_segment_distance() {
        let d = distance_squared_between_point_and_line_vec2(
            Vec2::new(1.0, 1.0),
            (Vec2::new(0.0, 0.0), Vec2::new(2.0, 0.0)),
        );
        assert!((d - 1.0).abs() < 1e-6);
        let d = distance_squared_between_point_and_line_ivec2((3, 0), (0, 0), (1, 0));
        assert!((d - 4.0).abs() < 1e-6);
    }
}
