use sn_sweep::algs::communicator::CommTag;
use sn_sweep::algs::wire::{
    cast_slice, decode_cell_views, decode_locations, decode_pod_vec, encode_cell_views,
    encode_locations, CellView, FaceView, WireCount,
};
use sn_sweep::sweep_error::SweepError;

#[test]
fn commtag_offset_does_not_wrap() {
    assert_eq!(CommTag::new(u16::MAX).offset(1), None);
    assert_eq!(CommTag::new(10).offset(5), Some(15));
}

#[test]
fn locations_roundtrip() {
    let locs = [0usize, 3, 17, 1];
    assert_eq!(decode_locations(&encode_locations(&locs)).unwrap(), locs);
}

#[test]
fn ragged_payload_is_rejected() {
    let raw = cast_slice(&[1.0f64, 2.0]).to_vec();
    assert!(matches!(
        decode_pod_vec::<f64>(&raw[..11]),
        Err(SweepError::WireDecode(_))
    ));
    let counts = decode_pod_vec::<WireCount>(&raw[..8]).unwrap();
    assert_eq!(counts.len(), 2);
}

#[test]
fn truncated_cell_views_are_rejected() {
    let views = vec![CellView {
        global_id: 5,
        faces: vec![FaceView { slot: 1, vertex_ids: vec![10, 11] }],
    }];
    let bytes = encode_cell_views(&views);
    assert_eq!(decode_cell_views(&bytes).unwrap(), views);
    assert!(decode_cell_views(&bytes[..bytes.len() - 8]).is_err());
    assert!(decode_cell_views(&bytes[..4]).is_err());

    let mut bad_kind = bytes.clone();
    bad_kind[2] ^= 0xFF;
    assert!(decode_cell_views(&bad_kind).is_err());
}
