//! Fixed, versioned, little-endian wire types for setup-time exchanges.
//!
//! Sweep payloads themselves are raw `f64` blocks; everything structured
//! (dependency edges, topological orders, compact cell views) goes through the
//! records in this module.

use crate::sweep_error::SweepError;
use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a received byte buffer into records without assuming alignment.
pub fn decode_pod_vec<T: Pod>(raw: &[u8]) -> Result<Vec<T>, SweepError> {
    if raw.len() % size_of::<T>() != 0 {
        return Err(SweepError::WireDecode(format!(
            "{} bytes is not a multiple of the {}-byte record",
            raw.len(),
            size_of::<T>()
        )));
    }
    let mut out = vec![T::zeroed(); raw.len() / size_of::<T>()];
    cast_slice_mut(&mut out).copy_from_slice(raw);
    Ok(out)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Record kind carried in [`WireHdr`].
pub const KIND_CELL_VIEWS: u16 = 1;

/// All multi-byte integers in these structs are **little-endian** on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Encode a list of location indices.
pub fn encode_locations(locs: &[usize]) -> Vec<u8> {
    let words: Vec<u32> = locs.iter().map(|&l| (l as u32).to_le()).collect();
    cast_slice(&words).to_vec()
}

pub fn decode_locations(raw: &[u8]) -> Result<Vec<usize>, SweepError> {
    Ok(decode_pod_vec::<u32>(raw)?
        .into_iter()
        .map(|w| u32::from_le(w) as usize)
        .collect())
}

// ===== Compact cell views (FLUDS beta pass) ================================

/// A face of a cell as seen by a downstream location: its dof offset in the
/// outgoing buffer and its vertex ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaceView {
    pub slot: usize,
    pub vertex_ids: Vec<u64>,
}

/// A cell as seen by a downstream location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellView {
    pub global_id: u64,
    pub faces: Vec<FaceView>,
}

/// Serialize views as a header followed by little-endian `u64` words:
/// `num_cells, {global_id, num_faces, {slot, num_verts, verts..}..}..`.
pub fn encode_cell_views(views: &[CellView]) -> Vec<u8> {
    let mut words: Vec<u64> = vec![views.len() as u64];
    for cell in views {
        words.push(cell.global_id);
        words.push(cell.faces.len() as u64);
        for face in &cell.faces {
            words.push(face.slot as u64);
            words.push(face.vertex_ids.len() as u64);
            words.extend_from_slice(&face.vertex_ids);
        }
    }
    for w in &mut words {
        *w = w.to_le();
    }
    let mut out = cast_slice(&[WireHdr::new(KIND_CELL_VIEWS)]).to_vec();
    out.extend_from_slice(cast_slice(&words));
    out
}

pub fn decode_cell_views(raw: &[u8]) -> Result<Vec<CellView>, SweepError> {
    let hdr_len = size_of::<WireHdr>();
    if raw.len() < hdr_len {
        return Err(SweepError::WireDecode("cell-view payload shorter than header".into()));
    }
    let hdr: WireHdr = bytemuck::pod_read_unaligned(&raw[..hdr_len]);
    if hdr.version() != WIRE_VERSION || hdr.kind() != KIND_CELL_VIEWS {
        return Err(SweepError::WireDecode(format!(
            "unexpected header: version {} kind {}",
            hdr.version(),
            hdr.kind()
        )));
    }
    let words: Vec<u64> = decode_pod_vec::<u64>(&raw[hdr_len..])?
        .into_iter()
        .map(u64::from_le)
        .collect();
    let mut it = words.into_iter();
    let mut next = |what: &str| {
        it.next()
            .ok_or_else(|| SweepError::WireDecode(format!("truncated cell views at {what}")))
    };

    let num_cells = next("cell count")? as usize;
    let mut views = Vec::with_capacity(num_cells);
    for _ in 0..num_cells {
        let global_id = next("cell id")?;
        let num_faces = next("face count")? as usize;
        let mut faces = Vec::with_capacity(num_faces);
        for _ in 0..num_faces {
            let slot = next("face slot")? as usize;
            let nv = next("vertex count")? as usize;
            let vertex_ids = (0..nv)
                .map(|_| next("vertex id"))
                .collect::<Result<Vec<_>, _>>()?;
            faces.push(FaceView { slot, vertex_ids });
        }
        views.push(CellView { global_id, faces });
    }
    Ok(views)
}

// ===== Compile-time sanity checks =========================================

static_assertions::assert_eq_size!(WireHdr, u64);
static_assertions::assert_eq_size!(WireCount, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_views_survive_unaligned_buffers() {
        let views = vec![
            CellView {
                global_id: 42,
                faces: vec![
                    FaceView { slot: 0, vertex_ids: vec![7, 8] },
                    FaceView { slot: 2, vertex_ids: vec![8, 9] },
                ],
            },
            CellView { global_id: 3, faces: vec![] },
        ];
        let bytes = encode_cell_views(&views);
        // shift by one byte so the payload is not 8-byte aligned
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(decode_cell_views(&shifted[1..]).unwrap(), views);
    }

    #[test]
    fn truncated_views_are_rejected() {
        let bytes = encode_cell_views(&[CellView {
            global_id: 1,
            faces: vec![FaceView { slot: 0, vertex_ids: vec![1, 2, 3] }],
        }]);
        let err = decode_cell_views(&bytes[..bytes.len() - 8]).unwrap_err();
        assert!(matches!(err, SweepError::WireDecode(_)));
    }

    #[test]
    fn locations_and_counts() {
        let c = [WireCount::new(17)];
        let back = decode_pod_vec::<WireCount>(cast_slice(&c)).unwrap();
        assert_eq!(back[0].get(), 17);
        assert_eq!(decode_locations(&encode_locations(&[0, 5, 2])).unwrap(), vec![0, 5, 2]);
        assert!(decode_pod_vec::<u32>(&[1, 2, 3]).is_err());
    }

    #[test]
    fn version_guard() {
        let hdr = WireHdr::new(KIND_CELL_VIEWS);
        assert_eq!(hdr.version(), WIRE_VERSION);
    }
}
