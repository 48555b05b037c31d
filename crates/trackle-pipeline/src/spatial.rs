//! Per-frame spatial relations between particles: neighbour graphs and
//! tessellation areas.
//!
//! Neighbour lists are symmetric in principle, but the cutoff filter is
//! applied independently per side — downstream code must treat each
//! particle's list as authoritative only for that particle and never
//! assume symmetry.

use std::collections::HashMap;

use geo::{Area, Coord, LineString, Polygon};
use petgraph::graph::{NodeIndex, UnGraph};
use rstar::RTree;
use rstar::primitives::GeomWithData;
use spade::handles::VoronoiVertex;
use spade::{DelaunayTriangulation, Point2, Triangulation};

/// Errors raised by spatial computations.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// An input position has a NaN or infinite coordinate.
    #[error("point {index} has a non-finite coordinate")]
    NonFinite {
        /// Index into the input slice.
        index: usize,
    },

    /// Triangulation failed (degenerate input beyond what is handled).
    #[error("triangulation failed: {detail}")]
    Triangulation {
        /// Underlying description.
        detail: String,
    },
}

/// One particle's position within a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePoint {
    /// Particle identity.
    pub particle: u64,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

/// The area of one tessellation cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellArea {
    /// A closed cell with the given area.
    Finite(f64),
    /// A cell open to infinity (its particle sits on the hull with no
    /// bounding neighbour). Reported explicitly, never clipped to a
    /// finite number.
    Unbounded,
}

impl CellArea {
    /// Whether the cell is open to infinity.
    #[must_use]
    pub const fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }

    /// Numeric form for storage in an `f64` column: the area, or `+∞`
    /// for unbounded cells.
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Finite(area) => area,
            Self::Unbounded => f64::INFINITY,
        }
    }
}

fn check_finite(points: &[FramePoint]) -> Result<(), SpatialError> {
    for (index, point) in points.iter().enumerate() {
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(SpatialError::NonFinite { index });
        }
    }
    Ok(())
}

/// Cutoff k-nearest-neighbour lists.
///
/// For every particle: query its `k` nearest other particles, then drop
/// any result farther than `cutoff`. The returned list (one per input
/// point, input order) holds at most `k` identities and never one beyond
/// the cutoff.
///
/// # Errors
///
/// Returns [`SpatialError::NonFinite`] for NaN/infinite positions.
pub fn kdtree_neighbours(
    points: &[FramePoint],
    k: usize,
    cutoff: f64,
) -> Result<Vec<Vec<u64>>, SpatialError> {
    check_finite(points)?;
    if points.len() < 2 || k == 0 {
        return Ok(vec![Vec::new(); points.len()]);
    }
    let entries: Vec<GeomWithData<[f64; 2], usize>> = points
        .iter()
        .enumerate()
        .map(|(index, p)| GeomWithData::new([p.x, p.y], index))
        .collect();
    let tree = RTree::bulk_load(entries);
    let cutoff_sq = cutoff * cutoff;

    let lists = points
        .iter()
        .enumerate()
        .map(|(index, p)| {
            tree.nearest_neighbor_iter_with_distance_2(&[p.x, p.y])
                .filter(|(entry, _)| entry.data != index)
                .take(k)
                .filter(|&(_, distance_sq)| distance_sq <= cutoff_sq)
                .map(|(entry, _)| points[entry.data].particle)
                .collect()
        })
        .collect();
    Ok(lists)
}

/// Triangulate a point set, tracking coincident-point merges.
///
/// Returns the triangulation plus, per input point, the index of the
/// spade vertex it landed on (coincident inputs share a vertex).
fn triangulate(
    points: &[FramePoint],
) -> Result<(DelaunayTriangulation<Point2<f64>>, Vec<usize>), SpatialError> {
    let mut triangulation: DelaunayTriangulation<Point2<f64>> = DelaunayTriangulation::new();
    let mut vertex_of_point = Vec::with_capacity(points.len());
    for point in points {
        let handle = triangulation
            .insert(Point2::new(point.x, point.y))
            .map_err(|e| SpatialError::Triangulation {
                detail: format!("{e:?}"),
            })?;
        vertex_of_point.push(handle.index());
    }
    Ok((triangulation, vertex_of_point))
}

/// Cutoff proximity-graph neighbour lists.
///
/// Builds a Delaunay triangulation over all positions in the frame, then
/// drops every edge whose Euclidean length exceeds `cutoff`. Denser and
/// cheaper per edge than the k-NN variant; the default for roughly
/// uniform particle density. A cutoff of 0 yields empty lists.
///
/// Coincident input points are merged by the triangulation and share one
/// neighbour list; merged points are not each other's neighbours.
///
/// # Errors
///
/// Returns [`SpatialError::NonFinite`] for NaN/infinite positions.
pub fn proximity_graph_neighbours(
    points: &[FramePoint],
    cutoff: f64,
) -> Result<Vec<Vec<u64>>, SpatialError> {
    check_finite(points)?;
    if points.len() < 2 {
        return Ok(vec![Vec::new(); points.len()]);
    }
    let (triangulation, vertex_of_point) = triangulate(points)?;

    // Input points sharing one triangulation vertex.
    let mut points_of_vertex: HashMap<usize, Vec<usize>> = HashMap::new();
    for (point_index, vertex_index) in vertex_of_point.iter().enumerate() {
        points_of_vertex
            .entry(*vertex_index)
            .or_default()
            .push(point_index);
    }

    let mut graph: UnGraph<usize, ()> = UnGraph::new_undirected();
    let nodes: Vec<NodeIndex> = (0..points.len()).map(|index| graph.add_node(index)).collect();

    for edge in triangulation.undirected_edges() {
        let [a, b] = edge.vertices();
        let (pa, pb) = (a.position(), b.position());
        let length = (pa.x - pb.x).hypot(pa.y - pb.y);
        if length > cutoff {
            continue;
        }
        let empty = Vec::new();
        let left = points_of_vertex.get(&a.fix().index()).unwrap_or(&empty);
        let right = points_of_vertex.get(&b.fix().index()).unwrap_or(&empty);
        for &i in left {
            for &j in right {
                graph.add_edge(nodes[i], nodes[j], ());
            }
        }
    }

    let lists = nodes
        .iter()
        .map(|&node| {
            graph
                .neighbors(node)
                .map(|neighbour| points[graph[neighbour]].particle)
                .collect()
        })
        .collect();
    Ok(lists)
}

/// Tessellation cell areas: one Voronoi cell per particle.
///
/// Returns exactly one entry per input point, in input order — a finite
/// positive area for interior particles, [`CellArea::Unbounded`] for
/// cells open to infinity. Fewer than three points (or a fully collinear
/// set) leaves every cell unbounded.
///
/// # Errors
///
/// Returns [`SpatialError::NonFinite`] for NaN/infinite positions.
pub fn tessellation_areas(points: &[FramePoint]) -> Result<Vec<CellArea>, SpatialError> {
    check_finite(points)?;
    if points.len() < 3 {
        return Ok(vec![CellArea::Unbounded; points.len()]);
    }
    let (triangulation, vertex_of_point) = triangulate(points)?;
    if triangulation.all_vertices_on_line() {
        return Ok(vec![CellArea::Unbounded; points.len()]);
    }

    // Area per triangulation vertex, then fan back out to input points
    // (coincident inputs share a cell).
    let mut area_of_vertex: HashMap<usize, CellArea> = HashMap::new();
    for vertex in triangulation.vertices() {
        let mut ring: Vec<Coord<f64>> = Vec::new();
        let mut unbounded = false;
        for edge in vertex.as_voronoi_face().adjacent_edges() {
            match edge.to() {
                VoronoiVertex::Inner(face) => {
                    let center = face.circumcenter();
                    ring.push(Coord {
                        x: center.x,
                        y: center.y,
                    });
                }
                VoronoiVertex::Outer(_) => unbounded = true,
            }
        }
        let area = if unbounded || ring.len() < 3 {
            CellArea::Unbounded
        } else {
            CellArea::Finite(Polygon::new(LineString::from(ring), Vec::new()).unsigned_area())
        };
        area_of_vertex.insert(vertex.fix().index(), area);
    }

    Ok(vertex_of_point
        .iter()
        .map(|vertex_index| {
            area_of_vertex
                .get(vertex_index)
                .copied()
                .unwrap_or(CellArea::Unbounded)
        })
        .collect())
}
