//! Structured orthogonal partitions for tests and demonstrations.
//!
//! Shared faces carry exactly opposite normals and the same vertex ids, listed
//! in opposite order for the two adjacent quads, so face-dof permutations are
//! exercised.

use super::{Cell, CellFace, FaceNeighbor, Grid, Vector3};
use hashbrown::HashMap;

pub const XMIN: u64 = 0;
pub const XMAX: u64 = 1;
pub const YMIN: u64 = 2;
pub const YMAX: u64 = 3;

/// 1-D slab along x with cell `i` spanning `nodes[i]..nodes[i+1]`.
///
/// `partition_of_cell[i]` names the owning rank of cell `i`; only the cells
/// owned by `rank` are materialised.
pub fn slab(nodes: &[f64], partition_of_cell: &[usize], rank: usize) -> Grid {
    let num_cells = nodes.len().saturating_sub(1);
    assert_eq!(partition_of_cell.len(), num_cells, "one partition id per cell");

    let neighbor = |i: isize, bndry: u64| -> FaceNeighbor {
        if i < 0 || i as usize >= num_cells {
            FaceNeighbor::Boundary(bndry)
        } else {
            FaceNeighbor::Cell {
                global_id: i as u64,
                partition: partition_of_cell[i as usize],
            }
        }
    };

    let mut cells = Vec::new();
    let mut vertices = HashMap::new();
    for i in 0..num_cells {
        if partition_of_cell[i] != rank {
            continue;
        }
        let (xl, xr) = (nodes[i], nodes[i + 1]);
        vertices.insert(i as u64, Vector3::new(xl, 0.0, 0.0));
        vertices.insert(i as u64 + 1, Vector3::new(xr, 0.0, 0.0));
        let left = CellFace {
            vertex_ids: vec![i as u64],
            normal: Vector3::new(-1.0, 0.0, 0.0),
            centroid: Vector3::new(xl, 0.0, 0.0),
            neighbor: neighbor(i as isize - 1, XMIN),
        };
        let right = CellFace {
            vertex_ids: vec![i as u64 + 1],
            normal: Vector3::new(1.0, 0.0, 0.0),
            centroid: Vector3::new(xr, 0.0, 0.0),
            neighbor: neighbor(i as isize + 1, XMAX),
        };
        cells.push(Cell {
            global_id: i as u64,
            local_id: 0,
            partition: rank,
            centroid: Vector3::new(0.5 * (xl + xr), 0.0, 0.0),
            faces: vec![left, right],
        });
    }
    Grid::new(rank, 1, cells, vertices)
}

/// `nx × ny` unit-spaced quads; cell `(i, j)` has global id `j * nx + i`.
///
/// Faces are listed counter-clockwise: bottom, right, top, left.
pub fn quad_grid(nx: usize, ny: usize, partition_of_cell: &[usize], rank: usize) -> Grid {
    assert_eq!(partition_of_cell.len(), nx * ny, "one partition id per cell");
    let vid = |i: usize, j: usize| (j * (nx + 1) + i) as u64;
    let cid = |i: usize, j: usize| j * nx + i;
    let neighbor = |i: isize, j: isize, bndry: u64| -> FaceNeighbor {
        if i < 0 || j < 0 || i as usize >= nx || j as usize >= ny {
            FaceNeighbor::Boundary(bndry)
        } else {
            let g = cid(i as usize, j as usize);
            FaceNeighbor::Cell {
                global_id: g as u64,
                partition: partition_of_cell[g],
            }
        }
    };

    let mut cells = Vec::new();
    let mut vertices = HashMap::new();
    for j in 0..ny {
        for i in 0..nx {
            if partition_of_cell[cid(i, j)] != rank {
                continue;
            }
            for (a, b) in [(i, j), (i + 1, j), (i + 1, j + 1), (i, j + 1)] {
                vertices.insert(vid(a, b), Vector3::new(a as f64, b as f64, 0.0));
            }
            let (x, y) = (i as f64, j as f64);
            let (ii, jj) = (i as isize, j as isize);
            let faces = vec![
                CellFace {
                    vertex_ids: vec![vid(i, j), vid(i + 1, j)],
                    normal: Vector3::new(0.0, -1.0, 0.0),
                    centroid: Vector3::new(x + 0.5, y, 0.0),
                    neighbor: neighbor(ii, jj - 1, YMIN),
                },
                CellFace {
                    vertex_ids: vec![vid(i + 1, j), vid(i + 1, j + 1)],
                    normal: Vector3::new(1.0, 0.0, 0.0),
                    centroid: Vector3::new(x + 1.0, y + 0.5, 0.0),
                    neighbor: neighbor(ii + 1, jj, XMAX),
                },
                CellFace {
                    vertex_ids: vec![vid(i + 1, j + 1), vid(i, j + 1)],
                    normal: Vector3::new(0.0, 1.0, 0.0),
                    centroid: Vector3::new(x + 0.5, y + 1.0, 0.0),
                    neighbor: neighbor(ii, jj + 1, YMAX),
                },
                CellFace {
                    vertex_ids: vec![vid(i, j + 1), vid(i, j)],
                    normal: Vector3::new(-1.0, 0.0, 0.0),
                    centroid: Vector3::new(x, y + 0.5, 0.0),
                    neighbor: neighbor(ii - 1, jj, XMIN),
                },
            ];
            cells.push(Cell {
                global_id: cid(i, j) as u64,
                local_id: 0,
                partition: rank,
                centroid: Vector3::new(x + 0.5, y + 0.5, 0.0),
                faces,
            });
        }
    }
    Grid::new(rank, 2, cells, vertices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_faces_link_across_partitions() {
        let g = slab(&[0.0, 1.0, 2.0, 3.0], &[0, 0, 1], 0);
        assert_eq!(g.num_local_cells(), 2);
        let c1 = &g.local_cells()[1];
        assert_eq!(c1.faces[1].neighbor_partition(), Some(1));
        assert!(!g.is_face_local(&c1.faces[1]));
        assert_eq!(g.associated_face(c1, 0), Some(1));
        assert_eq!(g.boundary_ids().into_iter().collect::<Vec<_>>(), vec![XMIN]);
    }

    #[test]
    fn quad_shared_edges_reverse_vertex_order() {
        let g = quad_grid(2, 1, &[0, 0], 0);
        let c0 = &g.local_cells()[0];
        let c1 = &g.local_cells()[1];
        let f = g.associated_face(c0, 1).unwrap();
        assert_eq!(f, 3);
        let mut rev = c1.faces[f].vertex_ids.clone();
        rev.reverse();
        assert_eq!(c0.faces[1].vertex_ids, rev);
        assert_eq!(c0.faces[1].normal, -c1.faces[f].normal);
        assert_eq!(g.face_size_histogram(), vec![(2, 8)]);
    }
}
