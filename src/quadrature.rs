//! Discrete-ordinates angular quadrature: ordered directions and weights.

use crate::grid::Vector3;
use crate::sweep_error::SweepError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AngularQuadrature {
    pub omegas: Vec<Vector3>,
    pub weights: Vec<f64>,
}

impl AngularQuadrature {
    /// Quadrature from explicit directions; directions are normalised.
    ///
    /// Fails when the weight count differs from the direction count or a
    /// direction is zero.
    pub fn from_directions(omegas: Vec<Vector3>, weights: Vec<f64>) -> Result<Self, SweepError> {
        if omegas.len() != weights.len() {
            return Err(SweepError::Config(format!(
                "quadrature has {} directions but {} weights",
                omegas.len(),
                weights.len()
            )));
        }
        if let Some(n) = omegas.iter().position(|o| o.norm() == 0.0) {
            return Err(SweepError::Config(format!("quadrature direction {n} is zero")));
        }
        Ok(Self {
            omegas: omegas.iter().map(Vector3::normalized).collect(),
            weights,
        })
    }

    /// Gauss-Legendre set for slab geometry with directions along x.
    pub fn gauss_legendre_slab(n: usize) -> Self {
        let (mu, w) = gauss_legendre(n);
        Self {
            omegas: mu.iter().map(|&m| Vector3::new(m, 0.0, 0.0)).collect(),
            weights: w,
        }
    }

    /// Product set: Gauss-Legendre in the polar cosine, equally spaced
    /// (Chebyshev) azimuths. Weights sum to 4π.
    pub fn product_gauss_legendre_chebyshev(n_azimuthal: usize, n_polar: usize) -> Self {
        let (mu, wp) = gauss_legendre(n_polar);
        let dphi = 2.0 * PI / n_azimuthal as f64;
        let mut omegas = Vec::with_capacity(n_azimuthal * n_polar);
        let mut weights = Vec::with_capacity(n_azimuthal * n_polar);
        for k in 0..n_azimuthal {
            let phi = PI * (2 * k + 1) as f64 / n_azimuthal as f64;
            for (p, &m) in mu.iter().enumerate() {
                let s = (1.0 - m * m).max(0.0).sqrt();
                omegas.push(Vector3::new(s * phi.cos(), s * phi.sin(), m));
                weights.push(wp[p] * dphi);
            }
        }
        Self { omegas, weights }
    }

    pub fn num_angles(&self) -> usize {
        self.omegas.len()
    }
}

/// Sign key of a direction: 2 for a non-negative component, 1 otherwise.
/// Components beyond `dimension` read as 0 so that, say, 2-D quadrants
/// ignore `z`.
pub fn octant_key(omega: &Vector3, dimension: usize) -> [u8; 3] {
    let sign = |v: f64| if v >= 0.0 { 2 } else { 1 };
    let a = omega.as_array();
    let mut key = [0; 3];
    for (k, slot) in key.iter_mut().enumerate().take(dimension.min(3)) {
        *slot = sign(a[k]);
    }
    key
}

/// Gauss-Legendre nodes (ascending) and weights on [-1, 1].
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    for i in 0..n.div_ceil(2) {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 0.0;
        for _ in 0..100 {
            let (p, d) = legendre_with_derivative(n, x);
            dp = d;
            let dx = p / d;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        nodes[i] = -x;
        nodes[n - 1 - i] = x;
        weights[i] = w;
        weights[n - 1 - i] = w;
    }
    (nodes, weights)
}

fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let (mut p0, mut p1) = (1.0, x);
    for k in 2..=n {
        let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
        p0 = p1;
        p1 = p2;
    }
    if n == 0 {
        return (1.0, 0.0);
    }
    let d = n as f64 * (x * p1 - p0) / (x * x - 1.0);
    (p1, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauss_legendre_integrates_polynomials() {
        let (x, w) = gauss_legendre(4);
        let sum: f64 = w.iter().sum();
        assert!((sum - 2.0).abs() < 1e-13);
        let m2: f64 = x.iter().zip(&w).map(|(x, w)| w * x * x).sum();
        assert!((m2 - 2.0 / 3.0).abs() < 1e-13);
        assert!(x.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn octant_keys_respect_dimension() {
        let o = Vector3::new(-0.5, 0.5, -0.7);
        assert_eq!(octant_key(&o, 3), [1, 2, 1]);
        assert_eq!(octant_key(&o, 2), [1, 2, 0]);
        assert_eq!(octant_key(&o, 1), [1, 0, 0]);
    }

    #[test]
    fn explicit_directions_are_checked() {
        let q = AngularQuadrature::from_directions(
            vec![Vector3::new(2.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)],
            vec![1.0, 1.0],
        )
        .unwrap();
        assert_eq!(q.omegas[0], Vector3::new(1.0, 0.0, 0.0));

        let short = AngularQuadrature::from_directions(vec![Vector3::new(1.0, 0.0, 0.0)], vec![]);
        assert!(matches!(short, Err(SweepError::Config(_))));
        let zero = AngularQuadrature::from_directions(vec![Vector3::new(0.0, 0.0, 0.0)], vec![1.0]);
        assert!(matches!(zero, Err(SweepError::Config(_))));
    }

    #[test]
    fn product_set_weights_sum_to_four_pi() {
        let q = AngularQuadrature::product_gauss_legendre_chebyshev(4, 2);
        assert_eq!(q.num_angles(), 8);
        let sum: f64 = q.weights.iter().sum();
        assert!((sum - 4.0 * PI).abs() < 1e-12);
        for o in &q.omegas {
            assert!((o.norm() - 1.0).abs() < 1e-12);
        }
    }
}
