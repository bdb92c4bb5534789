use glam::{IVec3, Vec3};

/// Size-aligned floor of `point`.
///
/// Uses Euclidean division so that negative coordinates round toward
/// negative infinity: `align_down(-1, 2) == -2`.
pub fn align_down(point: IVec3, size: i32) -> IVec3 {
    IVec3::new(
        point.x.div_euclid(size) * size,
        point.y.div_euclid(size) * size,
        point.z.div_euclid(size) * size,
    )
}

/// Grid coordinate of a world-space position.
///
/// When `track_y` is false the vertical axis is pinned to 0, so moving up
/// or down never crosses a cell boundary.
pub fn grid_coord(position: Vec3, chunk_size: f32, track_y: bool) -> IVec3 {
    let cell = (position / chunk_size).floor();
    IVec3::new(
        cell.x as i32,
        if track_y { cell.y as i32 } else { 0 },
        cell.z as i32,
    )
}
