#![allow(dead_code)]
use hashbrown::HashMap;
use sn_sweep::{
    algs::communicator::RayonComm,
    grid::Vector3,
    quadrature::AngularQuadrature,
    sweep::chunk::{AngleSetInfo, SweepChunk, SweepContext},
    sweep::spds::FaceOrientation,
};

/// Offset added to flux written across cell-to-cell faces, per vertex id.
/// Readers subtract it again; a face-dof permutation error shows up as
/// unequal values across the face.
pub const VERTEX_MARK: f64 = 1.0e-6;

/// Run `f` once per rank of a fresh in-process world, one thread per rank,
/// and collect the results in rank order.
pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(RayonComm) -> T + Sync,
{
    let world = RayonComm::world(size);
    std::thread::scope(|s| {
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Upwind balance on unit-area faces and unit-volume cells:
/// `psi = (Σ_in |ω·n| psi_in + q) / (Σ_out ω·n + σ)`, written to every
/// outgoing face vertex. Accumulates the scalar flux per global cell id.
pub struct UpwindChunk {
    pub omegas: Vec<Vector3>,
    pub weights: Vec<f64>,
    pub sigma_t: f64,
    pub source: f64,
    pub num_groups: usize,
    pub phi: HashMap<u64, Vec<f64>>,
    pub permutation_errors: usize,
    pub cells_swept: usize,
}

impl UpwindChunk {
    pub fn new(quadrature: &AngularQuadrature, num_groups: usize, sigma_t: f64, source: f64) -> Self {
        Self {
            omegas: quadrature.omegas.clone(),
            weights: quadrature.weights.clone(),
            sigma_t,
            source,
            num_groups,
            phi: HashMap::new(),
            permutation_errors: 0,
            cells_swept: 0,
        }
    }

    /// Forget the scalar flux of the previous sweep.
    pub fn start_sweep(&mut self) {
        self.phi.clear();
    }
}

impl SweepChunk for UpwindChunk {
    fn set_angle_set(&mut self, info: &AngleSetInfo) {
        assert!(info.groups.end <= self.num_groups);
    }

    fn sweep_cell(&mut self, ctx: &mut SweepContext<'_>) {
        self.cells_swept += 1;
        let cell = ctx.cell().clone();
        let info = ctx.angle_set().clone();
        let num_groups = info.groups.len();
        let phi = self
            .phi
            .entry(cell.global_id)
            .or_insert_with(|| vec![0.0; self.num_groups]);

        for (n, &angle) in info.angles.iter().enumerate() {
            let omega = self.omegas[angle];
            let mut inflow = vec![0.0; num_groups];
            let mut leakage = 0.0;
            for (f, face) in cell.faces.iter().enumerate() {
                let mu = face.normal.dot(&omega);
                match ctx.face_orientation(f) {
                    FaceOrientation::Incoming => {
                        let nv = face.num_vertices();
                        let mut per_dof = Vec::with_capacity(nv);
                        for (dof, &vid) in face.vertex_ids.iter().enumerate() {
                            let mark = if face.has_neighbor() {
                                VERTEX_MARK * vid as f64
                            } else {
                                0.0
                            };
                            let up = ctx.upwind_psi(f, dof, n);
                            per_dof.push(up.iter().map(|v| v - mark).collect::<Vec<_>>());
                        }
                        if face.has_neighbor()
                            && per_dof
                                .windows(2)
                                .any(|w| w[0].iter().zip(&w[1]).any(|(a, b)| (a - b).abs() > 1e-9))
                        {
                            self.permutation_errors += 1;
                        }
                        for g in 0..num_groups {
                            let avg = per_dof.iter().map(|d| d[g]).sum::<f64>() / nv as f64;
                            inflow[g] += mu.abs() * avg;
                        }
                    }
                    FaceOrientation::Outgoing => leakage += mu,
                    FaceOrientation::Parallel => {}
                }
            }

            let psi: Vec<f64> = inflow
                .iter()
                .map(|s| (s + self.source) / (leakage + self.sigma_t))
                .collect();
            for (g, p) in psi.iter().enumerate() {
                phi[info.groups.start + g] += self.weights[angle] * p;
            }

            for (f, face) in cell.faces.iter().enumerate() {
                if ctx.face_orientation(f) != FaceOrientation::Outgoing {
                    continue;
                }
                for (dof, &vid) in face.vertex_ids.iter().enumerate() {
                    let mark = if face.has_neighbor() {
                        VERTEX_MARK * vid as f64
                    } else {
                        0.0
                    };
                    if let Some(out) = ctx.outgoing_psi(f, dof, n) {
                        for (o, p) in out.iter_mut().zip(&psi) {
                            *o = p + mark;
                        }
                    }
                }
            }
        }
    }
}

/// Writes `upwind + 1` to every outgoing face, so a direction's exit flux is
/// its entry flux plus the number of cells crossed. Records the upwind value
/// read and the value written per `(cell global id, angle)`.
#[derive(Default)]
pub struct CopyUpwindChunk {
    pub read: HashMap<(u64, usize), f64>,
    pub written: HashMap<(u64, usize), f64>,
}

impl SweepChunk for CopyUpwindChunk {
    fn sweep_cell(&mut self, ctx: &mut SweepContext<'_>) {
        let cell = ctx.cell().clone();
        let angles = ctx.angle_set().angles.clone();
        for (n, &angle) in angles.iter().enumerate() {
            let upwind: f64 = (0..cell.faces.len())
                .filter(|&f| ctx.face_orientation(f) == FaceOrientation::Incoming)
                .map(|f| ctx.upwind_psi(f, 0, n)[0])
                .sum();
            let value = upwind + 1.0;
            for f in 0..cell.faces.len() {
                if let Some(out) = ctx.outgoing_psi(f, 0, n) {
                    out.fill(value);
                }
            }
            self.read.insert((cell.global_id, angle), upwind);
            self.written.insert((cell.global_id, angle), value);
        }
    }
}

/// Merge per-rank scalar fluxes into one map keyed by global cell id.
pub fn merge_phi(parts: Vec<HashMap<u64, Vec<f64>>>) -> HashMap<u64, Vec<f64>> {
    let mut all = HashMap::new();
    for part in parts {
        for (k, v) in part {
            assert!(all.insert(k, v).is_none(), "cell {k} swept on two ranks");
        }
    }
    all
}

pub fn assert_phi_close(got: &HashMap<u64, Vec<f64>>, want: &HashMap<u64, Vec<f64>>, tol: f64) {
    assert_eq!(got.len(), want.len(), "different cell counts");
    for (id, w) in want {
        let g = got.get(id).unwrap_or_else(|| panic!("cell {id} missing"));
        for (a, b) in g.iter().zip(w) {
            assert!((a - b).abs() <= tol * b.abs().max(1.0), "cell {id}: {a} vs {b}");
        }
    }
}
