// SPDX-License-Identifier: GPL-3.0-only

//! Texture coordinate and matrix math for sinks
//!
//! A sink samples the camera texture through a quad of four texture
//! coordinates, one per corner of the full-target rectangle
//! `[-1,-1, 1,-1, -1,1, 1,1]` drawn as a triangle strip. Cropping, the
//! 90° axis swap and mirroring are all expressed by choosing those four
//! coordinates; nothing here touches the graphics context.
//!
//! Matrices are 4x4, column-major, matching what a GL uniform expects.

use crate::config::{Crop, MirrorAxis, Rotation, SinkConfiguration};

/// Four (x, y) texture coordinate pairs
pub type Quad = [f32; 8];

/// Column-major 4x4 matrix
pub type Mat4 = [f32; 16];

/// Full-target rectangle in clip space, drawn as a triangle strip
pub const VERTEX_QUAD: Quad = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Texture coordinates selecting `crop` from a source at `rotation`
///
/// For 90° and 270° the pairs are (x, y) in the order bottom-left,
/// bottom-right, top-left, top-right. For 0° and 180° the sensor is read
/// sideways, so pairs are (y, x) in the order bottom-right, top-right,
/// bottom-left, top-left. Both forms flip y because the crop origin is
/// top-left while texture space starts bottom-left.
pub fn texture_coordinates(rotation: Rotation, crop: &Crop) -> Quad {
    let Crop {
        x,
        y,
        width: w,
        height: h,
    } = *crop;

    if rotation.is_transposed() {
        [
            x,
            1.0 - (h + y),
            x + w,
            1.0 - (h + y),
            x,
            1.0 - y,
            x + w,
            1.0 - y,
        ]
    } else {
        [
            1.0 - (h + y),
            1.0 - (w + x),
            1.0 - y,
            1.0 - (w + x),
            1.0 - (h + y),
            1.0 - x,
            1.0 - y,
            1.0 - x,
        ]
    }
}

/// Mirror a quad by permuting its coordinate pairs
///
/// Under a 90° or 270° rotation the horizontal and vertical axes of the
/// target correspond to the opposite texture axes, so they are swapped
/// before permuting.
pub fn mirror(rotation: Rotation, axis: MirrorAxis, quad: &Quad) -> Quad {
    let axis = if rotation.is_transposed() {
        axis.swapped()
    } else {
        axis
    };

    let order: [usize; 4] = match axis {
        MirrorAxis::None => return *quad,
        MirrorAxis::Horizontal => [2, 3, 0, 1],
        MirrorAxis::Vertical => [1, 0, 3, 2],
        MirrorAxis::Both => [3, 2, 1, 0],
    };

    let mut out = [0.0; 8];
    for (dst, &src) in order.iter().enumerate() {
        out[dst * 2] = quad[src * 2];
        out[dst * 2 + 1] = quad[src * 2 + 1];
    }
    out
}

/// Crop then mirror, the quad a sink draws with
pub fn sink_quad(rotation: Rotation, config: &SinkConfiguration) -> Quad {
    mirror(
        rotation,
        config.mirror,
        &texture_coordinates(rotation, &config.crop),
    )
}

/// Exact sine and cosine for quarter turns, libm for anything else
fn sin_cos(degrees: f32) -> (f32, f32) {
    let whole = degrees as i32;
    if whole as f32 == degrees && whole % 90 == 0 {
        return match whole.rem_euclid(360) {
            0 => (0.0, 1.0),
            90 => (1.0, 0.0),
            180 => (0.0, -1.0),
            _ => (-1.0, 0.0),
        };
    }
    degrees.to_radians().sin_cos()
}

/// Rotation about the z axis by `degrees`, counter-clockwise
pub fn rotation_z(degrees: f32) -> Mat4 {
    let (s, c) = sin_cos(degrees);
    let mut m = IDENTITY;
    m[0] = c;
    m[1] = s;
    m[4] = -s;
    m[5] = c;
    m
}

/// Non-uniform scale
pub fn scale(x: f32, y: f32, z: f32) -> Mat4 {
    let mut m = IDENTITY;
    m[0] = x;
    m[5] = y;
    m[10] = z;
    m
}

/// `a * b`
pub fn mat4_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [0.0; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
        }
    }
    out
}

/// Apply `m` to the point (x, y, 0, 1), returning (x, y)
pub fn transform_point(m: &Mat4, x: f32, y: f32) -> (f32, f32) {
    (
        m[0] * x + m[4] * y + m[12],
        m[1] * x + m[5] * y + m[13],
    )
}

/// Preview orientation: compensates sensor mounting only when asked to
pub fn preview_matrix(normalize: bool, rotation: Rotation, sensor: Rotation) -> Mat4 {
    if normalize {
        rotation_z((rotation.degrees() - sensor.degrees()) as f32)
    } else {
        IDENTITY
    }
}

/// Video orientation
pub fn video_matrix(rotation: Rotation, sensor: Rotation) -> Mat4 {
    rotation_z((rotation.degrees() - sensor.degrees()) as f32)
}

/// Analysis orientation: the opposite turn, flipped vertically so the
/// bottom-first framebuffer reads back top row first
pub fn analysis_matrix(rotation: Rotation, sensor: Rotation) -> Mat4 {
    mat4_mul(
        &rotation_z((sensor.degrees() - rotation.degrees()) as f32),
        &scale(1.0, -1.0, 1.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ROTATIONS: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];
    const ALL_AXES: [MirrorAxis; 4] = [
        MirrorAxis::None,
        MirrorAxis::Horizontal,
        MirrorAxis::Vertical,
        MirrorAxis::Both,
    ];

    #[test]
    fn test_full_frame_is_base_quad() {
        let quad = sink_quad(Rotation::Deg0, &SinkConfiguration::default());
        assert_eq!(quad, [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let quad = sink_quad(Rotation::Deg90, &SinkConfiguration::default());
        assert_eq!(quad, [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_half_width_crop() {
        let quad = texture_coordinates(Rotation::Deg0, &Crop::new(0.0, 0.0, 0.5, 1.0));
        assert_eq!(quad, [0.0, 0.5, 1.0, 0.5, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_crop_under_rotation_flips_y() {
        let quad = texture_coordinates(Rotation::Deg270, &Crop::new(0.25, 0.0, 0.5, 0.5));
        assert_eq!(quad, [0.25, 0.5, 0.75, 0.5, 0.25, 1.0, 0.75, 1.0]);
    }

    #[test]
    fn test_mirror_permutations() {
        let quad: Quad = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        assert_eq!(mirror(Rotation::Deg0, MirrorAxis::None, &quad), quad);
        assert_eq!(
            mirror(Rotation::Deg0, MirrorAxis::Horizontal, &quad),
            [4.0, 5.0, 6.0, 7.0, 0.0, 1.0, 2.0, 3.0]
        );
        assert_eq!(
            mirror(Rotation::Deg0, MirrorAxis::Vertical, &quad),
            [2.0, 3.0, 0.0, 1.0, 6.0, 7.0, 4.0, 5.0]
        );
        assert_eq!(
            mirror(Rotation::Deg180, MirrorAxis::Both, &quad),
            [6.0, 7.0, 4.0, 5.0, 2.0, 3.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_mirror_axis_swaps_when_transposed() {
        let quad: Quad = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        for axis in ALL_AXES {
            for rotated in [Rotation::Deg90, Rotation::Deg270] {
                assert_eq!(
                    mirror(rotated, axis, &quad),
                    mirror(Rotation::Deg0, axis.swapped(), &quad),
                    "axis {:?} at {:?}",
                    axis,
                    rotated
                );
            }
        }
    }

    #[test]
    fn test_mirror_twice_is_identity() {
        let quad = texture_coordinates(Rotation::Deg0, &Crop::new(0.1, 0.2, 0.3, 0.4));
        for rotation in ALL_ROTATIONS {
            for axis in ALL_AXES {
                let once = mirror(rotation, axis, &quad);
                assert_eq!(mirror(rotation, axis, &once), quad);
            }
        }
    }

    #[test]
    fn test_quarter_turn_rotation_is_exact() {
        let m = rotation_z(90.0);
        assert_eq!(transform_point(&m, 1.0, 0.0), (0.0, 1.0));
        let m = rotation_z(-90.0);
        assert_eq!(transform_point(&m, 1.0, 0.0), (0.0, -1.0));
        assert_eq!(rotation_z(360.0), IDENTITY);
    }

    #[test]
    fn test_analysis_matrix_flips_y() {
        let m = analysis_matrix(Rotation::Deg0, Rotation::Deg0);
        assert_eq!(transform_point(&m, 0.5, 0.5), (0.5, -0.5));
    }

    #[test]
    fn test_preview_matrix_identity_without_normalization() {
        assert_eq!(
            preview_matrix(false, Rotation::Deg90, Rotation::Deg270),
            IDENTITY
        );
        assert_eq!(
            preview_matrix(true, Rotation::Deg90, Rotation::Deg90),
            IDENTITY
        );
    }

    #[test]
    fn test_mat4_mul_identity() {
        let r = rotation_z(30.0);
        assert_eq!(mat4_mul(&IDENTITY, &r), r);
        assert_eq!(mat4_mul(&r, &IDENTITY), r);
    }
}
