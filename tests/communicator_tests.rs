mod util;
use sn_sweep::algs::communicator::{tags, CommTag, Communicator, NoComm, RayonComm, Test, Wait};
use util::run_ranks;

#[test]
fn rayon_round_trip() {
    let tag = CommTag(0x1000);
    let world = RayonComm::world(2);

    let msg = b"hello";
    let _s = world[0].isend(1, tag.base(), msg);
    let h = world[1].irecv(0, tag.base(), msg.len());
    assert_eq!(h.wait().unwrap(), msg.to_vec());
}

#[test]
fn rayon_fifo_order() {
    let tag = CommTag(0x1001);
    let world = RayonComm::world(2);

    for i in 0..10u8 {
        let _ = world[0].isend(1, tag.base(), &[i]);
    }
    let out: Vec<u8> = (0..10)
        .map(|_| world[1].irecv(0, tag.base(), 1).wait().unwrap()[0])
        .collect();
    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
}

#[test]
fn truncation_is_ok() {
    let tag = CommTag(0x1002);
    let world = RayonComm::world(2);

    let _ = world[0].isend(1, tag.base(), &[1, 2, 3, 4, 5, 6]);
    let got = world[1].irecv(0, tag.base(), 4).wait().unwrap();
    assert_eq!(got, vec![1, 2, 3, 4]);
}

#[test]
fn receive_matches_on_completion() {
    let tag = CommTag(0x1003);
    let world = RayonComm::world(2);

    let mut h = world[1].irecv(0, tag.base(), 8);
    assert!(!h.test());
    assert!(!h.test());
    let _ = world[0].isend(1, tag.base(), &7u64.to_le_bytes());
    assert!(h.test());
    assert_eq!(h.wait().unwrap(), 7u64.to_le_bytes().to_vec());
}

#[test]
fn tags_are_kept_apart() {
    let world = RayonComm::world(2);
    let _ = world[0].isend(1, tags::SWEEP_BASE.base(), &[1]);
    let _ = world[0].isend(1, tags::BETA_PASS.base(), &[2]);
    assert_eq!(world[1].irecv(0, tags::BETA_PASS.base(), 1).wait(), Some(vec![2]));
    assert_eq!(world[1].irecv(0, tags::SWEEP_BASE.base(), 1).wait(), Some(vec![1]));
}

#[test]
fn serial_collectives_are_identities() {
    let c = NoComm;
    c.barrier();
    assert_eq!(c.allreduce_max_f64(2.5), 2.5);
    assert_eq!(c.allreduce_sum_u64(4), 4);
    assert_eq!(c.broadcast_bytes(0, vec![1, 2]), vec![1, 2]);
    assert_eq!(c.gather_bytes(0, vec![3]), Some(vec![vec![3]]));
}

#[test]
fn gather_on_four_threads() {
    let out = run_ranks(4, |c| {
        let gathered = c.gather_bytes(0, vec![c.rank() as u8; c.rank()]);
        let max = c.allreduce_max_f64(-(c.rank() as f64));
        (c.rank(), gathered, max)
    });
    for (rank, gathered, max) in out {
        assert_eq!(max, 0.0);
        if rank == 0 {
            let want: Vec<Vec<u8>> = (0..4).map(|r| vec![r as u8; r]).collect();
            assert_eq!(gathered, Some(want));
        } else {
            assert!(gathered.is_none());
        }
    }
}
