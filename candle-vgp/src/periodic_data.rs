//! Synthetic periodic process: `D` coupled coordinates whose
//! covariance rotates with time over `(0, 2]`.

use candle_core::{Device, Tensor};
use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

pub struct PeriodicProcess {
    /// `N` time points `2k / N`, k = 1..N
    pub times: Vec<f64>,
    /// `M x (N * D)`, experiment `m` flattened time-major
    pub data: DMatrix<f32>,
    pub num_times: usize,
    pub num_dims: usize,
}

impl PeriodicProcess {
    pub fn to_tensor(&self, device: &Device) -> anyhow::Result<Tensor> {
        let (nrow, ncol) = self.data.shape();
        let data: Vec<f32> = self.data.transpose().as_slice().to_vec();
        Ok(Tensor::from_vec(data, (nrow, ncol), device)?)
    }
}

/// evenly spaced points in `(0, 2]`
pub fn periodic_times(num_times: usize) -> Vec<f64> {
    (1..=num_times)
        .map(|k| 2. * k as f64 / num_times as f64)
        .collect()
}

///
/// Covariance of the process at time `t`
///
/// L(i,j) = (-1)^(i+1) sin((i+1) π t / D) (-1)^(j+1) cos((j+1) π t / D), j <= i
/// Σ = (L Lᵀ) ⊘ S, S(i,j) = |i - j| + 1
///
pub fn periodic_covariance(t: f64, num_dims: usize) -> DMatrix<f64> {
    let dd = num_dims as f64;
    let sign = |k: usize| if (k + 1) % 2 == 0 { 1. } else { -1. };

    let l = DMatrix::from_fn(num_dims, num_dims, |i, j| {
        if j > i {
            return 0.;
        }
        let row = sign(i) * ((i + 1) as f64 * t * PI / dd).sin();
        let col = sign(j) * ((j + 1) as f64 * t * PI / dd).cos();
        row * col
    });

    let llt = &l * l.transpose();
    DMatrix::from_fn(num_dims, num_dims, |i, j| {
        llt[(i, j)] / (i.abs_diff(j) + 1) as f64
    })
}

/// `A` with `A Aᵀ = Σ` after clamping negative eigenvalues at zero
fn psd_square_root(sigma: &DMatrix<f64>) -> DMatrix<f64> {
    let eigen = sigma.clone().symmetric_eigen();
    if eigen.eigenvalues.iter().any(|&x| x < -1e-10) {
        debug!("clamping negative eigenvalues {:?}", eigen.eigenvalues.as_slice());
    }
    let sqrt_lambda = DVector::from_iterator(
        eigen.eigenvalues.len(),
        eigen.eigenvalues.iter().map(|&x| x.max(0.).sqrt()),
    );
    &eigen.eigenvectors * DMatrix::from_diagonal(&sqrt_lambda)
}

///
/// Draw `num_experiments` independent runs of the periodic process
///
/// * `num_experiments` - M
/// * `num_times` - N
/// * `num_dims` - D
/// * `rng` - noise source
///
pub fn simulate_periodic_process<R>(
    num_experiments: usize,
    num_times: usize,
    num_dims: usize,
    rng: &mut R,
) -> anyhow::Result<PeriodicProcess>
where
    R: Rng + ?Sized,
{
    if num_experiments == 0 || num_times == 0 || num_dims == 0 {
        return Err(anyhow::anyhow!(
            "empty process: {} experiments, {} times, {} dims",
            num_experiments,
            num_times,
            num_dims
        ));
    }

    let times = periodic_times(num_times);
    let roots: Vec<DMatrix<f64>> = times
        .iter()
        .map(|&t| psd_square_root(&periodic_covariance(t, num_dims)))
        .collect();

    let ncol = num_times * num_dims;
    let mut data = DMatrix::<f32>::zeros(num_experiments, ncol);

    for m in 0..num_experiments {
        for (n, root) in roots.iter().enumerate() {
            let eps = DVector::<f64>::from_iterator(
                num_dims,
                (0..num_dims).map(|_| rng.sample::<f64, _>(StandardNormal)),
            );
            let y = root * eps;
            for (d, &y_d) in y.iter().enumerate() {
                data[(m, n * num_dims + d)] = y_d as f32;
            }
        }
    }

    Ok(PeriodicProcess {
        times,
        data,
        num_times,
        num_dims,
    })
}
