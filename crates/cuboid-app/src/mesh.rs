// SPDX-License-Identifier: CEPL-1.0
//! Cube geometry, built face by face so every face gets its own vertices
//! and a full 0..1 UV quad.

use cuboid_render::{Mesh, Vertex};

/// Unit cube centered on the origin: 6 faces, 24 vertices, 36 indices.
pub fn cube() -> Mesh {
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for axis in 0..3usize {
        for negate in [false, true] {
            let sign: f32 = if negate { -1.0 } else { 1.0 };
            let mut normal = [0.0f32; 3];
            normal[axis] = sign;
            let mut tangent = [0.0f32; 3];
            tangent[(axis + 1) % 3] = 1.0;
            let mut bitangent = [0.0f32; 3];
            bitangent[(axis + 2) % 3] = 1.0;

            let base = vertices.len() as u32;
            for (u, v) in [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let mut position = [0.0f32; 3];
                for i in 0..3 {
                    position[i] = 0.5 * (normal[i] + u * tangent[i] + v * bitangent[i]);
                }
                vertices.push(Vertex {
                    position,
                    uv: [(u + 1.0) * 0.5, (v + 1.0) * 0.5],
                });
            }

            // Counter-clockwise seen from outside; negated faces flip.
            let winding: [u32; 6] = if negate {
                [0, 2, 1, 0, 3, 2]
            } else {
                [0, 1, 2, 0, 2, 3]
            };
            indices.extend(winding.iter().map(|i| base + i));
        }
    }

    Mesh { vertices, indices }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_expected_counts() {
        let mesh = cube();
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
    }

    #[test]
    fn indices_stay_in_range() {
        let mesh = cube();
        assert!(mesh
            .indices
            .iter()
            .all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn every_face_is_planar_at_half_extent() {
        let mesh = cube();
        for face in mesh.vertices.chunks(4) {
            // One coordinate is constant at +-0.5 across the face.
            let planar = (0..3).any(|axis| {
                let c = face[0].position[axis];
                c.abs() == 0.5 && face.iter().all(|v| v.position[axis] == c)
            });
            assert!(planar, "face {face:?} is not axis-aligned at half extent");
        }
    }

    #[test]
    fn uvs_cover_the_unit_square() {
        let mesh = cube();
        for face in mesh.vertices.chunks(4) {
            let mut corners: Vec<[f32; 2]> = face.iter().map(|v| v.uv).collect();
            corners.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(
                corners,
                vec![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]
            );
        }
    }

    #[test]
    fn triangles_wind_outward() {
        let mesh = cube();
        for tri in mesh.indices.chunks(3) {
            let [a, b, c] =
                [tri[0], tri[1], tri[2]].map(|i| glam::Vec3::from(mesh.vertices[i as usize].position));
            let normal = (b - a).cross(c - a);
            let center = (a + b + c) / 3.0;
            assert!(
                normal.dot(center) > 0.0,
                "inward-facing triangle {tri:?}"
            );
        }
    }
}
