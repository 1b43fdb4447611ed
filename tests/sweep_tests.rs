mod util;
use hashbrown::HashMap;
use sn_sweep::algs::communicator::{Communicator, NoComm, RayonComm};
use sn_sweep::config::{AngleAggregationType, SchedulingAlgorithm, SweepConfig};
use sn_sweep::grid::{ortho, Cell, CellFace, FaceNeighbor, Grid, Vector3};
use sn_sweep::quadrature::AngularQuadrature;
use sn_sweep::sweep::angle_aggregation::AngleAggregation;
use sn_sweep::sweep::boundary::{BoundaryMap, SweepBoundary};
use sn_sweep::sweep::scheduler::SweepScheduler;
use sn_sweep::sweep::spds::Spds;
use sn_sweep::sweep_error::SweepError;
use std::sync::Arc;
use util::*;

const SIGMA_T: f64 = 1.0;
const SOURCE: f64 = 0.5;

#[derive(Copy, Clone)]
enum Ends {
    IncidentLeft,
    ReflectLeft,
    ReflectBoth,
}

fn slab_boundaries(ends: Ends, num_groups: usize) -> BoundaryMap {
    let left_normal = Vector3::new(-1.0, 0.0, 0.0);
    let right_normal = Vector3::new(1.0, 0.0, 0.0);
    let mut b = BoundaryMap::new();
    match ends {
        Ends::IncidentLeft => {
            let values = (0..num_groups).map(|g| 1.0 / (g + 1) as f64).collect();
            b.insert(ortho::XMIN, SweepBoundary::isotropic(values));
            b.insert(ortho::XMAX, SweepBoundary::vacuum(num_groups));
        }
        Ends::ReflectLeft => {
            b.insert(ortho::XMIN, SweepBoundary::reflecting(left_normal, num_groups));
            b.insert(ortho::XMAX, SweepBoundary::vacuum(num_groups));
        }
        Ends::ReflectBoth => {
            b.insert(ortho::XMIN, SweepBoundary::reflecting(left_normal, num_groups));
            b.insert(ortho::XMAX, SweepBoundary::reflecting(right_normal, num_groups));
        }
    }
    b
}

fn quad_boundaries() -> BoundaryMap {
    let mut b = BoundaryMap::new();
    b.insert(ortho::XMIN, SweepBoundary::isotropic(vec![1.0]));
    for id in [ortho::XMAX, ortho::YMIN, ortho::YMAX] {
        b.insert(id, SweepBoundary::vacuum(1));
    }
    b
}

struct Outcome {
    phi: HashMap<u64, Vec<f64>>,
    norms: Vec<f64>,
    permutation_errors: usize,
    delayed_dofs: (usize, usize),
}

/// Build a scheduler on `comm`'s share of `grid` and sweep up to
/// `max_sweeps` times, stopping once the delayed data stops changing.
fn run<C: Communicator>(
    comm: C,
    grid: Grid,
    quadrature: AngularQuadrature,
    num_groups: usize,
    boundaries: BoundaryMap,
    config: &SweepConfig,
    max_sweeps: usize,
) -> Result<Outcome, SweepError> {
    let mut chunk = UpwindChunk::new(&quadrature, num_groups, SIGMA_T, SOURCE);
    let agg = AngleAggregation::build(
        Arc::new(grid),
        quadrature,
        num_groups,
        boundaries,
        config,
        &comm,
    )?;
    let delayed_dofs = agg.num_delayed_angular_dofs(&comm);
    let mut scheduler = SweepScheduler::new(config.scheduling_algorithm, agg, comm)?;
    let mut norms = Vec::new();
    for _ in 0..max_sweeps {
        chunk.start_sweep();
        scheduler.sweep(&mut chunk)?;
        let norm = scheduler.delayed_psi_norm();
        norms.push(norm);
        if norm < 1e-13 {
            break;
        }
    }
    Ok(Outcome {
        phi: chunk.phi,
        norms,
        permutation_errors: chunk.permutation_errors,
        delayed_dofs,
    })
}

fn slab_nodes(n: usize) -> Vec<f64> {
    (0..=n).map(|i| i as f64).collect()
}

fn slab_on_ranks(
    partition: &[usize],
    ends: Ends,
    config: &SweepConfig,
    max_sweeps: usize,
) -> Vec<Outcome> {
    let nranks = partition.iter().max().map_or(1, |m| m + 1);
    let nodes = slab_nodes(partition.len());
    run_ranks(nranks, |comm: RayonComm| {
        let grid = ortho::slab(&nodes, partition, comm.rank());
        run(
            comm,
            grid,
            AngularQuadrature::gauss_legendre_slab(4),
            2,
            slab_boundaries(ends, 2),
            config,
            max_sweeps,
        )
        .unwrap()
    })
}

fn quad_on_ranks(
    nx: usize,
    ny: usize,
    partition: &[usize],
    config: &SweepConfig,
) -> Vec<Outcome> {
    quad_with_quadrature(nx, ny, partition, config, || {
        AngularQuadrature::product_gauss_legendre_chebyshev(4, 2)
    })
}

fn quad_with_quadrature(
    nx: usize,
    ny: usize,
    partition: &[usize],
    config: &SweepConfig,
    quadrature: impl Fn() -> AngularQuadrature + Sync,
) -> Vec<Outcome> {
    let nranks = partition.iter().max().map_or(1, |m| m + 1);
    run_ranks(nranks, |comm: RayonComm| {
        let grid = ortho::quad_grid(nx, ny, partition, comm.rank());
        run(
            comm,
            grid,
            quadrature(),
            1,
            quad_boundaries(),
            config,
            1,
        )
        .unwrap()
    })
}

fn merged(outcomes: Vec<Outcome>) -> HashMap<u64, Vec<f64>> {
    for o in &outcomes {
        assert_eq!(o.permutation_errors, 0, "face dofs matched to the wrong vertices");
    }
    merge_phi(outcomes.into_iter().map(|o| o.phi).collect())
}

#[test]
fn two_rank_slab_matches_serial() {
    let config = SweepConfig::default();
    let serial = merged(slab_on_ranks(&[0; 8], Ends::IncidentLeft, &config, 1));
    let outcomes = slab_on_ranks(&[0, 0, 0, 0, 1, 1, 1, 1], Ends::IncidentLeft, &config, 1);
    for o in &outcomes {
        assert_eq!(o.norms, vec![0.0]);
        assert_eq!(o.delayed_dofs.1, 0);
    }
    assert_phi_close(&merged(outcomes), &serial, 1e-14);

    // flux decays away from the incident face
    let g0: Vec<f64> = (0..8).map(|c| serial[&c][0]).collect();
    assert!(g0.windows(2).all(|w| w[0] > w[1]));
}

#[test]
fn interleaved_partition_converges_to_serial() {
    let config = SweepConfig::default();
    let serial = merged(slab_on_ranks(&[0; 6], Ends::IncidentLeft, &config, 1));
    let outcomes = slab_on_ranks(&[0, 1, 0, 1, 0, 1], Ends::IncidentLeft, &config, 20);

    for o in &outcomes {
        assert!(o.delayed_dofs.1 > 0, "rank-level cycle must leave delayed data");
        assert!(o.norms[0] > 0.0);
        assert!(*o.norms.last().unwrap() < 1e-13, "no convergence: {:?}", o.norms);
        assert!(
            o.norms.windows(2).all(|w| w[1] <= w[0]),
            "norm grew between sweeps: {:?}",
            o.norms
        );
    }
    let global: Vec<usize> = outcomes.iter().map(|o| o.delayed_dofs.1).collect();
    assert!(global.windows(2).all(|w| w[0] == w[1]));
    let local_sum: usize = outcomes.iter().map(|o| o.delayed_dofs.0).sum();
    assert_eq!(local_sum, global[0]);

    assert_phi_close(&merged(outcomes), &serial, 1e-12);
}

#[test]
fn cycles_are_rejected_when_disallowed() {
    let config = SweepConfig {
        allow_cycles: false,
        ..Default::default()
    };
    let nodes = slab_nodes(4);
    let partition = [0, 1, 0, 1];
    let results = run_ranks(2, |comm: RayonComm| {
        let grid = ortho::slab(&nodes, &partition, comm.rank());
        run(
            comm,
            grid,
            AngularQuadrature::gauss_legendre_slab(2),
            1,
            slab_boundaries(Ends::IncidentLeft, 1),
            &config,
            1,
        )
        .err()
    });
    for err in results {
        assert!(matches!(err, Some(SweepError::CyclicDependencies { .. })), "{err:?}");
    }
}

#[test]
fn reflecting_end_mirrors_a_doubled_slab() {
    let config = SweepConfig::default();
    let half = merged(slab_on_ranks(&[0; 3], Ends::ReflectLeft, &config, 1));

    // vacuum on both ends of [-3, 3]
    let nodes: Vec<f64> = (-3..=3).map(f64::from).collect();
    let doubled = run(
        sn_sweep::algs::communicator::NoComm,
        ortho::slab(&nodes, &[0; 6], 0),
        AngularQuadrature::gauss_legendre_slab(4),
        2,
        {
            let mut b = BoundaryMap::new();
            b.insert(ortho::XMIN, SweepBoundary::vacuum(2));
            b.insert(ortho::XMAX, SweepBoundary::vacuum(2));
            b
        },
        &config,
        1,
    )
    .unwrap();

    let shifted: HashMap<u64, Vec<f64>> = (0..3u64).map(|c| (c, doubled.phi[&(c + 3)].clone())).collect();
    assert_phi_close(&half, &shifted, 1e-12);
}

#[test]
fn reflecting_and_vacuum_needs_one_sweep() {
    let config = SweepConfig::default();
    let serial = merged(slab_on_ranks(&[0; 6], Ends::ReflectLeft, &config, 1));
    let outcomes = slab_on_ranks(&[0, 0, 0, 1, 1, 1], Ends::ReflectLeft, &config, 1);
    for o in &outcomes {
        assert_eq!(o.norms, vec![0.0]);
    }
    assert_phi_close(&merged(outcomes), &serial, 1e-14);
}

#[test]
fn opposing_reflectors_converge_to_infinite_medium() {
    let config = SweepConfig::default();
    let outcomes = slab_on_ranks(&[0, 0, 0, 1, 1, 1], Ends::ReflectBoth, &config, 200);
    for o in &outcomes {
        assert!(o.norms.len() > 1, "lagged boundary must need iterations");
        assert!(o.norms.last().unwrap() < &o.norms[0]);
        assert!(*o.norms.last().unwrap() < 1e-13);
    }
    // Σw = 2 for the slab set
    let want = 2.0 * SOURCE / SIGMA_T;
    for (id, phi) in merged(outcomes) {
        for v in phi {
            assert!((v - want).abs() < 1e-10, "cell {id}: {v}");
        }
    }
}

#[test]
fn quad_partitions_match_serial() {
    let config = SweepConfig::default();
    let serial = merged(quad_on_ranks(4, 4, &[0; 16], &config));
    assert_eq!(serial.len(), 16);

    let columns: Vec<usize> = (0..16).map(|c| usize::from(c % 4 >= 2)).collect();
    assert_phi_close(&merged(quad_on_ranks(4, 4, &columns, &config)), &serial, 1e-13);

    let quadrants: Vec<usize> = (0..16)
        .map(|c| usize::from(c % 4 >= 2) + 2 * usize::from(c / 4 >= 2))
        .collect();
    assert_phi_close(&merged(quad_on_ranks(4, 4, &quadrants, &config)), &serial, 1e-13);
}

#[test]
fn scheduling_policies_agree() {
    let quadrants: Vec<usize> = (0..16)
        .map(|c| usize::from(c % 4 >= 2) + 2 * usize::from(c / 4 >= 2))
        .collect();
    let fifo = SweepConfig {
        scheduling_algorithm: SchedulingAlgorithm::FirstInFirstOut,
        ..Default::default()
    };
    let dog = SweepConfig {
        scheduling_algorithm: SchedulingAlgorithm::DepthOfGraph,
        ..Default::default()
    };
    let a = merged(quad_on_ranks(4, 4, &quadrants, &fifo));
    let b = merged(quad_on_ranks(4, 4, &quadrants, &dog));
    assert_phi_close(&a, &b, 1e-13);
}

#[test]
fn polar_aggregation_matches_single() {
    // two polar levels per hemisphere, so polar sets hold two angles
    let quadrature = || AngularQuadrature::product_gauss_legendre_chebyshev(4, 4);
    let columns: Vec<usize> = (0..9).map(|c| usize::from(c % 3 >= 1)).collect();
    let single = merged(quad_with_quadrature(3, 3, &columns, &SweepConfig::default(), quadrature));
    let polar = SweepConfig {
        angle_aggregation: AngleAggregationType::Polar,
        ..Default::default()
    };
    assert_phi_close(
        &merged(quad_with_quadrature(3, 3, &columns, &polar, quadrature)),
        &single,
        1e-13,
    );
}

#[test]
fn small_eager_limit_splits_messages() {
    let columns: Vec<usize> = (0..16).map(|c| usize::from(c % 4 >= 2)).collect();
    let reference = merged(quad_on_ranks(4, 4, &columns, &SweepConfig::default()));
    let split = SweepConfig {
        eager_limit_bytes: 16,
        ..Default::default()
    };
    assert_phi_close(&merged(quad_on_ranks(4, 4, &columns, &split)), &reference, 1e-14);
}

#[test]
fn group_subsets_cover_all_groups() {
    let config = SweepConfig {
        num_group_subsets: 2,
        ..Default::default()
    };
    let one = merged(slab_on_ranks(&[0, 0, 1, 1], Ends::IncidentLeft, &SweepConfig::default(), 1));
    let two = merged(slab_on_ranks(&[0, 0, 1, 1], Ends::IncidentLeft, &config, 1));
    assert_phi_close(&two, &one, 1e-14);
}

#[test]
fn two_rank_spds_orders_locations_by_direction() {
    let nodes = slab_nodes(2);
    let spds = run_ranks(2, |comm: RayonComm| {
        let grid = Arc::new(ortho::slab(&nodes, &[0, 1], comm.rank()));
        let right = Spds::new(grid.clone(), Vector3::new(1.0, 0.0, 0.0), true, &comm).unwrap();
        let left = Spds::new(grid, Vector3::new(-1.0, 0.0, 0.0), true, &comm).unwrap();
        (right, left)
    });
    let (right0, left0) = &spds[0];
    let (right1, left1) = &spds[1];

    // +x: rank 0 feeds rank 1
    assert!(right0.location_dependencies().is_empty());
    assert_eq!(right0.location_successors(), &[1]);
    assert_eq!(right1.location_dependencies(), &[0]);
    assert!(right1.location_successors().is_empty());
    for s in [right0, right1] {
        assert_eq!(s.global_sweep_planes(), &[vec![0], vec![1]]);
        assert!(s.delayed_location_dependencies().is_empty());
    }
    assert_eq!((right0.depth_of_graph(), right1.depth_of_graph()), (2, 1));

    // -x: the reverse
    assert_eq!(left0.location_dependencies(), &[1]);
    assert!(left1.location_dependencies().is_empty());
    for s in [left0, left1] {
        assert_eq!(s.global_sweep_planes(), &[vec![1], vec![0]]);
    }
    assert_eq!((left0.depth_of_graph(), left1.depth_of_graph()), (1, 2));
}

#[test]
fn copy_upwind_adds_one_per_cell_across_ranks() {
    let nodes = slab_nodes(4);
    let partition = [0, 0, 1, 1];
    let chunks = run_ranks(2, |comm: RayonComm| {
        let grid = ortho::slab(&nodes, &partition, comm.rank());
        let quadrature = AngularQuadrature::from_directions(
            vec![Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)],
            vec![1.0, 1.0],
        )
        .unwrap();
        let mut b = BoundaryMap::new();
        b.insert(ortho::XMIN, SweepBoundary::isotropic(vec![2.0]));
        b.insert(ortho::XMAX, SweepBoundary::vacuum(1));
        let config = SweepConfig::default();
        let agg =
            AngleAggregation::build(Arc::new(grid), quadrature, 1, b, &config, &comm).unwrap();
        let mut scheduler = SweepScheduler::new(config.scheduling_algorithm, agg, comm).unwrap();
        let mut chunk = CopyUpwindChunk::default();
        scheduler.sweep(&mut chunk).unwrap();
        chunk
    });
    let (a, b) = (&chunks[0], &chunks[1]);

    // angle 0 runs +x from rank 0 into rank 1
    assert_eq!(a.read[&(0, 0)], 2.0);
    assert_eq!(b.read[&(2, 0)], a.written[&(1, 0)]);
    assert_eq!(b.written[&(3, 0)], a.read[&(0, 0)] + 4.0);

    // angle 1 runs -x from rank 1 into rank 0
    assert_eq!(b.read[&(3, 1)], 0.0);
    assert_eq!(a.read[&(1, 1)], b.written[&(2, 1)]);
    assert_eq!(a.written[&(0, 1)], b.read[&(3, 1)] + 4.0);
    assert_eq!(a.written.len() + b.written.len(), 8);
}

/// Three cells on one rank whose +x faces chain 0 -> 1 -> 2 -> 0.
fn ring_grid() -> Grid {
    let x = Vector3::new(1.0, 0.0, 0.0);
    let cells = (0..3u64)
        .map(|i| {
            let (prev, next) = ((i + 2) % 3, (i + 1) % 3);
            let at = |v: f64| Vector3::new(v, 0.0, 0.0);
            Cell {
                global_id: i,
                local_id: 0,
                partition: 0,
                centroid: at(i as f64 + 0.5),
                faces: vec![
                    CellFace {
                        vertex_ids: vec![i],
                        normal: -x,
                        centroid: at(i as f64),
                        neighbor: FaceNeighbor::Cell {
                            global_id: prev,
                            partition: 0,
                        },
                    },
                    CellFace {
                        vertex_ids: vec![next],
                        normal: x,
                        centroid: at(i as f64 + 1.0),
                        neighbor: FaceNeighbor::Cell {
                            global_id: next,
                            partition: 0,
                        },
                    },
                ],
            }
        })
        .collect();
    let vertices = (0..3u64)
        .map(|v| (v, Vector3::new(v as f64, 0.0, 0.0)))
        .collect();
    Grid::new(0, 1, cells, vertices)
}

#[test]
fn local_cycle_is_lagged_and_converges() {
    let quadrature =
        || AngularQuadrature::from_directions(vec![Vector3::new(1.0, 0.0, 0.0)], vec![1.0]).unwrap();
    let config = SweepConfig::default();

    let agg = AngleAggregation::build(
        Arc::new(ring_grid()),
        quadrature(),
        1,
        BoundaryMap::new(),
        &config,
        &NoComm,
    )
    .unwrap();
    assert_eq!(agg.num_angle_sets(), 1);
    for set in agg.angle_sets() {
        assert_eq!(set.spds().local_cyclic_dependencies().len(), 1);
        assert_eq!(set.spds().spls().len(), 3);
    }

    let o = run(NoComm, ring_grid(), quadrature(), 1, BoundaryMap::new(), &config, 100).unwrap();
    assert_eq!(o.delayed_dofs, (1, 1));
    assert_eq!(o.permutation_errors, 0);
    assert_eq!(o.norms[0], 1.0);
    assert!(o.norms.len() > 2, "lagged face must need iterations");
    assert!(
        o.norms.windows(2).all(|w| w[1] <= w[0]),
        "norm grew between sweeps: {:?}",
        o.norms
    );
    assert!(*o.norms.last().unwrap() < 1e-13);

    // no leakage around a ring: psi tends to q / sigma
    assert_eq!(o.phi.len(), 3);
    for (id, phi) in &o.phi {
        assert!((phi[0] - SOURCE / SIGMA_T).abs() < 1e-12, "cell {id}: {}", phi[0]);
    }
}
