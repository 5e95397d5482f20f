//! Dispatch planning: how many thread groups cover a logical domain.
//!
//! A domain of `n` items split into groups of `g` threads needs
//! `ceil(n / g)` groups along that axis. Any non-positive axis makes the
//! whole domain empty, in which case nothing is launched.

use crate::error::{ComputeError, ComputeResult};

/// Logical size of a work domain, one count per axis.
///
/// Counts are signed so that callers passing a computed size (which may be
/// zero or negative) get the "nothing to do" behaviour instead of a wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Items along x.
    pub x: i32,
    /// Items along y.
    pub y: i32,
    /// Items along z.
    pub z: i32,
}

impl Extent {
    /// A three-dimensional extent.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// A one-dimensional extent (`y = z = 1`).
    pub const fn linear(x: i32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// A two-dimensional extent (`z = 1`).
    pub const fn planar(x: i32, y: i32) -> Self {
        Self { x, y, z: 1 }
    }

    /// True when any axis is zero or negative.
    pub fn is_empty(&self) -> bool {
        self.x <= 0 || self.y <= 0 || self.z <= 0
    }

    /// Total number of items, zero for an empty extent.
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<i32> for Extent {
    fn from(x: i32) -> Self {
        Self::linear(x)
    }
}

impl From<u32> for Extent {
    fn from(x: u32) -> Self {
        Self::linear(i32::try_from(x).unwrap_or(i32::MAX))
    }
}

impl From<usize> for Extent {
    fn from(x: usize) -> Self {
        Self::linear(i32::try_from(x).unwrap_or(i32::MAX))
    }
}

impl From<(i32, i32)> for Extent {
    fn from((x, y): (i32, i32)) -> Self {
        Self::planar(x, y)
    }
}

impl From<(i32, i32, i32)> for Extent {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self::new(x, y, z)
    }
}

impl From<[i32; 2]> for Extent {
    fn from([x, y]: [i32; 2]) -> Self {
        Self::planar(x, y)
    }
}

impl From<[i32; 3]> for Extent {
    fn from([x, y, z]: [i32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

/// Number of thread groups to launch along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExecutionGrid {
    /// Groups along x.
    pub x: u32,
    /// Groups along y.
    pub y: u32,
    /// Groups along z.
    pub z: u32,
}

impl ExecutionGrid {
    /// The grid of an empty domain.
    pub const EMPTY: Self = Self { x: 0, y: 0, z: 0 };

    /// A grid with explicit group counts.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Builds a grid from caller-supplied group counts. Returns `None` if any
    /// count is zero or negative.
    pub fn from_groups(groups: impl Into<Extent>) -> Option<Self> {
        let groups = groups.into();
        if groups.is_empty() {
            return None;
        }
        Some(Self::new(groups.x as u32, groups.y as u32, groups.z as u32))
    }

    /// True when there is nothing to launch.
    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    /// Total number of groups.
    pub fn total_groups(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Total invocations when every axis uses `group_size` threads per group.
    pub fn total_invocations(&self, group_size: [u32; 3]) -> u64 {
        let [gx, gy, gz] = group_size.map(u64::from);
        (self.x as u64 * gx) * (self.y as u64 * gy) * (self.z as u64 * gz)
    }

    /// Group counts as an array, in the order the backends take them.
    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Groups needed to cover `count` items with `group_size` threads each.
fn dispatch_size(count: i32, group_size: u32) -> u32 {
    if count <= 0 {
        return 0;
    }
    // div_ceil instead of (n + g - 1) / g: the sum overflows near i32::MAX.
    (count as u32).div_ceil(group_size)
}

/// Validates a group size, returning it as an unsigned value.
pub fn validate_group_size(group_size: i32) -> ComputeResult<u32> {
    if group_size <= 0 {
        return Err(ComputeError::InvalidGroupSize(group_size));
    }
    Ok(group_size as u32)
}

/// Plans the execution grid for `extent` items per axis with a uniform
/// `group_size` threads per group on every axis.
///
/// The group size is validated before the extent is looked at, so an
/// invalid size is reported even for an empty domain. An empty domain
/// yields [`ExecutionGrid::EMPTY`].
pub fn plan_grid(extent: impl Into<Extent>, group_size: i32) -> ComputeResult<ExecutionGrid> {
    let group_size = validate_group_size(group_size)?;
    let extent = extent.into();
    if extent.is_empty() {
        return Ok(ExecutionGrid::EMPTY);
    }
    Ok(ExecutionGrid {
        x: dispatch_size(extent.x, group_size),
        y: dispatch_size(extent.y, group_size),
        z: dispatch_size(extent.z, group_size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_every_item_with_minimal_groups() {
        for g in [1, 2, 7, 32, 64, 256] {
            for n in 1..=1000 {
                let grid = plan_grid(n, g).unwrap();
                let covered = grid.x as i64 * g as i64;
                assert!(covered >= n as i64, "n={n} g={g} under-covered");
                assert!(
                    (grid.x as i64 - 1) * (g as i64) < n as i64,
                    "n={n} g={g} over-provisioned"
                );
            }
        }
    }

    #[test]
    fn linear_extent_keeps_unit_axes() {
        let grid = plan_grid(500, 64).unwrap();
        assert_eq!(grid, ExecutionGrid::new(8, 1, 1));
    }

    #[test]
    fn empty_axis_gives_empty_grid() {
        assert_eq!(plan_grid(0, 64).unwrap(), ExecutionGrid::EMPTY);
        assert_eq!(plan_grid(-5, 64).unwrap(), ExecutionGrid::EMPTY);
        assert_eq!(plan_grid((10, 0), 8).unwrap(), ExecutionGrid::EMPTY);
        assert_eq!(plan_grid((10, 10, -1), 8).unwrap(), ExecutionGrid::EMPTY);
    }

    #[test]
    fn group_size_checked_before_extent() {
        assert!(matches!(plan_grid(0, 0), Err(ComputeError::InvalidGroupSize(0))));
        assert!(matches!(plan_grid(100, -4), Err(ComputeError::InvalidGroupSize(-4))));
    }

    #[test]
    fn large_counts_do_not_overflow() {
        let grid = plan_grid(i32::MAX, 256).unwrap();
        assert_eq!(grid.x, (i32::MAX as u32).div_ceil(256));
        assert_eq!(plan_grid(i32::MAX, 1).unwrap().x, i32::MAX as u32);
    }

    #[test]
    fn three_dimensional_plan() {
        let grid = plan_grid((17, 9, 3), 4).unwrap();
        assert_eq!(grid.as_array(), [5, 3, 1]);
        assert_eq!(grid.total_groups(), 15);
        assert_eq!(grid.total_invocations([4, 4, 4]), 20 * 12 * 4);
    }

    #[test]
    fn explicit_groups_reject_non_positive() {
        assert_eq!(ExecutionGrid::from_groups((2, 3, 4)), Some(ExecutionGrid::new(2, 3, 4)));
        assert_eq!(ExecutionGrid::from_groups(0), None);
        assert_eq!(ExecutionGrid::from_groups((4, -1)), None);
    }

    #[test]
    fn unsigned_conversions_saturate() {
        assert_eq!(Extent::from(u32::MAX).x, i32::MAX);
        assert_eq!(Extent::from(12usize), Extent::linear(12));
        assert_eq!(Extent::from([3, 4]).volume(), 12);
    }
}
