//! Index buffers for terrain patches
//!
//! A patch is an `(R + 1) x (R + 1)` vertex grid, vertex `(x, y)` at index
//! `y * (R + 1) + x`, with grid `x` along +x and grid `y` along +z. Each 2x2
//! cell block is drawn as a fan of eight triangles around its centre vertex.
//! When an edge of the patch borders a coarser neighbour, the blocks along it
//! skip the edge midpoint so the seam only uses vertices the neighbour has.
//!
//! All sixteen edge masks are generated into one index list.

use super::quadtree::Edge;

/// Number of distinct edge masks
pub const MASK_COUNT: usize = 16;

/// Index data for all sixteen stitching variants of a patch
#[derive(Debug, Clone)]
pub struct TriangleFans {
    resolution: u32,
    indices: Vec<u16>,
    ranges: [(u32, u32); MASK_COUNT],
}

impl TriangleFans {
    /// Fans for a patch of `resolution` cells per edge, rounded up to even
    pub fn new(resolution: u32) -> Self {
        let resolution = (resolution.max(2) + 1) & !1;
        let mut indices = Vec::new();
        let mut ranges = [(0, 0); MASK_COUNT];
        for (mask, range) in (0u8..).zip(ranges.iter_mut()) {
            let offset = indices.len();
            append_patch(&mut indices, resolution, mask);
            *range = (offset as u32, (indices.len() - offset) as u32);
        }
        Self {
            resolution,
            indices,
            ranges,
        }
    }

    /// Cells per patch edge
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Vertices in the patch grid
    pub fn vertex_count(&self) -> u32 {
        (self.resolution + 1) * (self.resolution + 1)
    }

    /// All indices, variant after variant
    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    /// First index and index count of the variant for `mask`
    pub fn range(&self, mask: u8) -> (u32, u32) {
        self.ranges[usize::from(mask & 0xF)]
    }
}

fn append_patch(indices: &mut Vec<u16>, resolution: u32, mask: u8) {
    let row = resolution + 1;
    let index = |x: u32, y: u32| (y * row + x) as u16;
    let dropped = |edge: Edge, on_border: bool| on_border && mask & edge.bit() != 0;

    for y0 in (0..resolution).step_by(2) {
        for x0 in (0..resolution).step_by(2) {
            let (x1, y1, x2, y2) = (x0 + 1, y0 + 1, x0 + 2, y0 + 2);
            // Counter-clockwise ring starting at the (-x, -z) corner, with
            // each midpoint tagged by the edge it may be dropped for
            let ring = [
                ((x0, y0), None),
                ((x1, y0), Some((Edge::Back, y0 == 0))),
                ((x2, y0), None),
                ((x2, y1), Some((Edge::Right, x2 == resolution))),
                ((x2, y2), None),
                ((x1, y2), Some((Edge::Forward, y2 == resolution))),
                ((x0, y2), None),
                ((x0, y1), Some((Edge::Left, x0 == 0))),
            ];
            let kept: Vec<u16> = ring
                .iter()
                .filter(|(_, midpoint)| !midpoint.is_some_and(|(edge, border)| dropped(edge, border)))
                .map(|&((x, y), _)| index(x, y))
                .collect();
            let center = index(x1, y1);
            for (i, &a) in kept.iter().enumerate() {
                let b = kept[(i + 1) % kept.len()];
                indices.extend_from_slice(&[center, a, b]);
            }
        }
    }
}
