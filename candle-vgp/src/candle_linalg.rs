//! Half-vectorization and small dense matrix routines on `Tensor`.
//!
//! Packing convention: the lower triangle (diagonal included) read
//! row by row, `(0,0), (1,0), (1,1), (2,0), ...`. Packing and
//! unpacking are `index_select` gathers, so gradients flow through
//! them.

use crate::error::{Result, VgpError};
use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;

/// Smallest ridge added to any matrix before inversion
pub const MIN_JITTER: f64 = 1e-5;

/// Frobenius condition number beyond which a matrix counts as singular
pub const MAX_CONDITION: f64 = 1e12;

/// number of packed entries for a `d x d` matrix
pub fn vech_len(d: usize) -> usize {
    d * (d + 1) / 2
}

/// `d` such that `d(d+1)/2 == len`
pub fn vech_dim(len: usize) -> Result<usize> {
    let guess = ((((8 * len + 1) as f64).sqrt() - 1.) / 2.).round() as usize;
    if guess > 0 && vech_len(guess) == len {
        Ok(guess)
    } else {
        Err(VgpError::shape(format!(
            "vech length {} is not d(d+1)/2 for any d",
            len
        )))
    }
}

/// offset of `(i, j)`, `j <= i`, inside the packed vector
pub fn vech_pos(i: usize, j: usize) -> usize {
    debug_assert!(j <= i);
    i * (i + 1) / 2 + j
}

/// offsets of the diagonal entries inside the packed vector
pub fn vech_diag_positions(d: usize) -> Vec<u32> {
    (0..d).map(|i| vech_pos(i, i) as u32).collect()
}

fn index_tensor(idx: Vec<u32>, device: &Device) -> Result<Tensor> {
    let n = idx.len();
    Ok(Tensor::from_vec(idx, n, device)?)
}

fn split_last(v: &Tensor) -> Result<(Vec<usize>, usize)> {
    match v.dims().split_last() {
        Some((&n, prefix)) => Ok((prefix.to_vec(), n)),
        None => Err(VgpError::shape("expected at least a vector, got a scalar")),
    }
}

///
/// Pack the lower triangle of `(..., d, d)` into `(..., d(d+1)/2)`
///
pub fn vech(m: &Tensor) -> Result<Tensor> {
    let dims = m.dims();
    let r = dims.len();
    if r < 2 || dims[r - 1] != dims[r - 2] {
        return Err(VgpError::shape(format!(
            "vech needs square trailing dims, got {:?}",
            dims
        )));
    }
    let d = dims[r - 1];
    let mut flat_dims = dims[..r - 2].to_vec();
    flat_dims.push(d * d);

    let idx = (0..d)
        .flat_map(|i| (0..=i).map(move |j| (i * d + j) as u32))
        .collect();

    Ok(m.reshape(flat_dims)?
        .index_select(&index_tensor(idx, m.device())?, r - 2)?)
}

///
/// Unpack `(..., d(d+1)/2)` into the symmetric `(..., d, d)`
///
pub fn ivech(v: &Tensor) -> Result<Tensor> {
    let (mut prefix, n) = split_last(v)?;
    let d = vech_dim(n)?;
    let idx = (0..d)
        .flat_map(|i| (0..d).map(move |j| vech_pos(i.max(j), i.min(j)) as u32))
        .collect();
    let full = v
        .contiguous()?
        .index_select(&index_tensor(idx, v.device())?, prefix.len())?;
    prefix.extend([d, d]);
    Ok(full.reshape(prefix)?)
}

///
/// Unpack `(..., d(d+1)/2)` into the lower-triangular `(..., d, d)`;
/// entries above the diagonal are exactly zero.
///
pub fn ivech_lower(v: &Tensor) -> Result<Tensor> {
    let (mut prefix, n) = split_last(v)?;
    let d = vech_dim(n)?;
    let axis = prefix.len();

    let mut pad_dims = prefix.clone();
    pad_dims.push(1);
    let pad = Tensor::zeros(pad_dims, v.dtype(), v.device())?;
    let padded = Tensor::cat(&[&v.contiguous()?, &pad], axis)?;

    let idx = (0..d)
        .flat_map(|i| {
            (0..d).map(move |j| (if j <= i { vech_pos(i, j) } else { n }) as u32)
        })
        .collect();

    let full = padded.index_select(&index_tensor(idx, v.device())?, axis)?;
    prefix.extend([d, d]);
    Ok(full.reshape(prefix)?)
}

///
/// `(b, d(d+1)/2)` packed Cholesky factors to dense `(b, d, d)` `L`
///
pub fn batched_vech_to_cholesky_factor(covh: &Tensor) -> Result<Tensor> {
    if covh.rank() != 2 {
        return Err(VgpError::shape(format!(
            "expected (batch, packed) factors, got {:?}",
            covh.dims()
        )));
    }
    ivech_lower(covh)
}

///
/// `(b, d(d+1)/2)` packed Cholesky factors to dense `(b, d, d)` `L Lᵀ`
///
pub fn batched_vech_to_covariance(covh: &Tensor) -> Result<Tensor> {
    let l_bdd = batched_vech_to_cholesky_factor(covh)?;
    let lt_bdd = l_bdd.transpose(1, 2)?.contiguous()?;
    Ok(l_bdd.matmul(&lt_bdd)?)
}

/// per-example trace of `(b, d, d)`, returns `(b,)`
pub fn batch_trace(m: &Tensor) -> Result<Tensor> {
    let (_, d, d2) = m.dims3()?;
    if d != d2 {
        return Err(VgpError::shape(format!("trace of non-square {:?}", m.dims())));
    }
    let eye_dd = Tensor::eye(d, m.dtype(), m.device())?;
    Ok(m.broadcast_mul(&eye_dd)?.sum(2)?.sum(1)?)
}

/// Copy a 2D tensor into a dense `f64` matrix
pub fn tensor_to_dmatrix(m: &Tensor) -> Result<DMatrix<f64>> {
    let (nrow, ncol) = m.dims2()?;
    let data: Vec<f64> = m.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
    Ok(DMatrix::from_row_slice(nrow, ncol, &data))
}

/// Copy a dense matrix into a 2D tensor
pub fn dmatrix_to_tensor(m: &DMatrix<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f64> = m.transpose().as_slice().to_vec();
    Ok(Tensor::from_vec(data, (m.nrows(), m.ncols()), device)?.to_dtype(dtype)?)
}

///
/// Inverse of a dense matrix, refusing singular, non-finite or
/// badly conditioned input
///
pub fn dense_inverse(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !m.iter().all(|x| x.is_finite()) {
        return Err(VgpError::singular("matrix has non-finite entries"));
    }

    let inv = m
        .clone()
        .try_inverse()
        .ok_or_else(|| VgpError::singular(format!("{} x {} matrix", m.nrows(), m.ncols())))?;

    let cond = m.norm() * inv.norm();
    if !cond.is_finite() || cond > MAX_CONDITION {
        return Err(VgpError::singular(format!("condition number {:.3e}", cond)));
    }
    Ok(inv)
}

/// Lower Cholesky factor of a symmetric positive definite matrix
pub fn dense_cholesky(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    m.clone()
        .cholesky()
        .map(|chol| chol.l())
        .ok_or_else(|| VgpError::singular("matrix is not positive definite"))
}

///
/// Per-example inverse of `(b, d, d)` after adding
/// `max(jitter, MIN_JITTER) * I`.
///
/// The inverse `X0` is computed off-graph and then refined by one
/// Newton-Schulz step `2 X0 - X0 A X0`, which carries the gradient
/// `-A⁻¹ dA A⁻¹` back to the input.
///
pub fn batch_inverse(m: &Tensor, jitter: f64) -> Result<Tensor> {
    let (nb, d, d2) = m.dims3()?;
    if d != d2 {
        return Err(VgpError::shape(format!("inverse of non-square {:?}", m.dims())));
    }

    let jitter = jitter.max(MIN_JITTER);
    let ridge = (Tensor::eye(d, m.dtype(), m.device())? * jitter)?;
    let a_bdd = m.broadcast_add(&ridge)?;

    let x0 = (0..nb)
        .map(|b| -> Result<Tensor> {
            let inv = dense_inverse(&tensor_to_dmatrix(&a_bdd.get(b)?)?)?;
            dmatrix_to_tensor(&inv, m.dtype(), m.device())
        })
        .collect::<Result<Vec<_>>>()?;
    let x0_bdd = Tensor::stack(&x0, 0)?;

    let x0ax0 = x0_bdd.matmul(&a_bdd)?.matmul(&x0_bdd)?;
    Ok(((x0_bdd * 2.)? - x0ax0)?)
}

/// `inverse` of a single `(d, d)` matrix, see [`batch_inverse`]
pub fn inverse(m: &Tensor, jitter: f64) -> Result<Tensor> {
    Ok(batch_inverse(&m.unsqueeze(0)?, jitter)?.squeeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    #[test]
    fn vech_reads_lower_triangle_by_rows() -> Result<()> {
        let m = Tensor::new(&[[1f32, 2., 4.], [2., 3., 5.], [4., 5., 6.]], &Device::Cpu)?;
        let v = vech(&m)?;
        assert_eq!(v.to_vec1::<f32>()?, vec![1., 2., 3., 4., 5., 6.]);
        Ok(())
    }

    #[test]
    fn vech_ivech_round_trip() -> Result<()> {
        for d in 1..6 {
            let n = vech_len(d);
            let data: Vec<f32> = (0..(2 * n)).map(|i| (i as f32).sin()).collect();
            let v = Tensor::from_vec(data, (2, n), &Device::Cpu)?;
            let m = ivech(&v)?;
            assert_eq!(m.dims(), &[2, d, d]);
            assert_eq!(vech(&m)?.to_vec2::<f32>()?, v.to_vec2::<f32>()?);

            let mt = m.transpose(1, 2)?.contiguous()?;
            assert_eq!(m.to_vec3::<f32>()?, mt.to_vec3::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn non_triangular_length_is_a_shape_error() -> Result<()> {
        let v = Tensor::zeros(5, DType::F32, &Device::Cpu)?;
        assert!(matches!(ivech(&v), Err(VgpError::Shape(_))));
        assert!(matches!(vech_dim(0), Err(VgpError::Shape(_))));
        assert_eq!(vech_dim(10)?, 4);
        Ok(())
    }

    #[test]
    fn packed_factor_is_lower_triangular() -> Result<()> {
        let covh = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;
        let l = batched_vech_to_cholesky_factor(&covh)?;
        assert_eq!(l.to_vec3::<f32>()?, vec![vec![vec![1., 0.], vec![2., 3.]]]);

        let s = batched_vech_to_covariance(&covh)?;
        assert_eq!(s.to_vec3::<f32>()?, vec![vec![vec![1., 2.], vec![2., 13.]]]);
        Ok(())
    }

    #[test]
    fn trace_of_batch() -> Result<()> {
        let m = Tensor::new(
            &[[[1f32, 9.], [9., 2.]], [[-1., 0.], [3., 5.]]],
            &Device::Cpu,
        )?;
        assert_eq!(batch_trace(&m)?.to_vec1::<f32>()?, vec![3., 4.]);
        Ok(())
    }

    #[test]
    fn ridge_alone_is_inverted() -> Result<()> {
        let zeros = Tensor::zeros((2, 3, 3), DType::F64, &Device::Cpu)?;
        let inv = batch_inverse(&zeros, 0.5)?;
        assert_eq!(inv.dtype(), DType::F64);
        for tr in batch_trace(&inv)?.to_vec1::<f64>()? {
            approx::assert_abs_diff_eq!(tr, 6., epsilon = 1e-10);
        }
        let off = inv.get(1)?.to_vec2::<f64>()?;
        approx::assert_abs_diff_eq!(off[0][2], 0., epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn inverse_recovers_identity() -> Result<()> {
        let m = Tensor::new(&[[[4f32, 1.], [1., 3.]]], &Device::Cpu)?;
        let inv = batch_inverse(&m, 0.)?;
        let prod = m.matmul(&inv)?.to_vec3::<f32>()?;
        approx::assert_abs_diff_eq!(prod[0][0][0], 1., epsilon = 1e-4);
        approx::assert_abs_diff_eq!(prod[0][0][1], 0., epsilon = 1e-4);
        approx::assert_abs_diff_eq!(prod[0][1][1], 1., epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn singular_matrix_is_reported() -> Result<()> {
        // the ridge exactly cancels the first pivot
        let ridge = 2f64.powi(-16);
        let m = Tensor::new(&[[-(ridge as f32), 0.], [0., 1.]], &Device::Cpu)?;
        assert!(matches!(inverse(&m, ridge), Err(VgpError::SingularMatrix(_))));
        Ok(())
    }

    #[test]
    fn inverse_is_differentiable() -> Result<()> {
        let a = Var::from_tensor(&Tensor::new(&[[[2f32]]], &Device::Cpu)?)?;
        let inv = batch_inverse(a.as_tensor(), MIN_JITTER)?;
        let grads = inv.sum_all()?.backward()?;
        let grad = grads
            .get(a.as_tensor())
            .expect("gradient")
            .flatten_all()?
            .to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(grad[0], -0.25, epsilon = 1e-3);
        Ok(())
    }
}
