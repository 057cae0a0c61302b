//! # Walker Programming
//!
//! Translates thread spaces into MEDIA_OBJECT_WALKER and GPGPU_WALKER
//! parameters.
//!
//! The media walker covers the thread space with a single global block
//! and lets the local loop carry the walk order:
//!
//! | Pattern      | Outer stride | Inner unit | Local loops        |
//! |--------------|--------------|------------|--------------------|
//! | Raster       | (0, 1)       | (1, 0)     | h - 1              |
//! | Horizontal   | (0, 1)       | (1, 0)     | h - 1              |
//! | Vertical     | (1, 0)       | (0, 1)     | w - 1              |
//! | Wavefront 45 | (1, 0)       | (-1, 1)    | w + (h - 1) - 1    |
//! | Wavefront 26 | (1, 0)       | (-2, 1)    | w + 2 (h - 1) - 1  |

use cm_cmd::{GpgpuWalker, MediaObjectWalker, WalkerPoint};
use cm_core::{Error, Result};

use crate::params::{ThreadGroupSpace, ThreadSpace, WalkingPattern};

fn coord(value: u32) -> Result<i16> {
    i16::try_from(value).map_err(|_| Error::InvalidParameter)
}

fn loops(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::InvalidParameter)
}

/// Media walker for one kernel
pub fn media_walker(interface_descriptor: u8, space: &ThreadSpace) -> Result<MediaObjectWalker> {
    if space.width == 0 || space.height == 0 || space.color_count == 0 {
        return Err(Error::InvalidParameter);
    }
    let (w, h) = (space.width, space.height);
    let resolution = WalkerPoint::new(coord(w)?, coord(h)?);

    let (outer, inner, local_loops) = match space.walking_pattern() {
        WalkingPattern::Raster | WalkingPattern::Horizontal => {
            (WalkerPoint::new(0, 1), WalkerPoint::new(1, 0), h - 1)
        }
        WalkingPattern::Vertical => (WalkerPoint::new(1, 0), WalkerPoint::new(0, 1), w - 1),
        WalkingPattern::Wavefront45 => (WalkerPoint::new(1, 0), WalkerPoint::new(-1, 1), w + h - 2),
        WalkingPattern::Wavefront26 => {
            (WalkerPoint::new(1, 0), WalkerPoint::new(-2, 1), w + 2 * (h - 1) - 1)
        }
    };

    Ok(MediaObjectWalker {
        interface_descriptor,
        scoreboard_mask: space.dependency.scoreboard_mask(),
        color_count_minus_one: (space.color_count - 1) as u8,
        group_id_loop_select: 0,
        mid_loop_unit_x: 0,
        mid_loop_unit_y: 0,
        local_loop_exec_count: loops(local_loops)?,
        global_loop_exec_count: 0,
        block_resolution: resolution,
        local_start: WalkerPoint::new(0, 0),
        local_outer_loop_stride: outer,
        local_inner_loop_unit: inner,
        global_resolution: resolution,
        global_start: WalkerPoint::new(0, 0),
        global_outer_loop_stride: WalkerPoint::new(resolution.x, 0),
        global_inner_loop_unit: WalkerPoint::new(0, resolution.y),
    })
}

/// Execution mask for a SIMD width
const fn simd_mask(simd_width: u8) -> u32 {
    match simd_width {
        8 => 0xFF,
        16 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// GPGPU walker for one kernel
pub fn gpgpu_walker(interface_descriptor: u8, simd_width: u8, space: &ThreadGroupSpace) -> GpgpuWalker {
    let mask = simd_mask(simd_width);
    GpgpuWalker {
        interface_descriptor,
        simd_width,
        thread_width: space.thread_width,
        thread_height: space.thread_height,
        thread_depth: space.thread_depth,
        group_width: space.group_width,
        group_height: space.group_height,
        group_depth: space.group_depth,
        right_mask: mask,
        bottom_mask: mask,
    }
}
