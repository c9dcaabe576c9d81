use crate::candle_linalg::{
    batch_trace, batched_vech_to_cholesky_factor, vech, vech_diag_positions, vech_dim,
};
use crate::candle_prior_kernel::PriorKernel;
use crate::error::{Result, VgpError};
use candle_core::Tensor;

const LN_2PI: f64 = 1.8378770664093453;

fn batch_size(x: &Tensor) -> Result<f64> {
    match x.dims().first() {
        Some(&n) if n > 0 => Ok(n as f64),
        _ => Err(VgpError::shape(format!("empty batch {:?}", x.dims()))),
    }
}

/// Fail with `NumericInstability` unless the scalar loss is finite
pub fn ensure_finite(loss: &Tensor, what: &str) -> Result<()> {
    let v = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    if v.is_finite() {
        Ok(())
    } else {
        Err(VgpError::unstable(format!("{} is {}", what, v)))
    }
}

/// KL divergence between two diagonal Gaussians, averaged over the batch
///
/// 0.5 * Σ [ ls1 - ls0 - 1 + exp(ls0 - ls1) + (mu0 - mu1)^2 exp(-ls1) ] / n
///
/// * `mu0`, `lnvar0` - q
/// * `mu1`, `lnvar1` - p
///
pub fn diag_gaussian_kl(
    mu0: &Tensor,
    lnvar0: &Tensor,
    mu1: &Tensor,
    lnvar1: &Tensor,
) -> Result<Tensor> {
    let n = batch_size(mu0)?;
    let ratio = lnvar0.sub(lnvar1)?.exp()?;
    let quad = mu0.sub(mu1)?.sqr()?.mul(&lnvar1.neg()?.exp()?)?;
    let kl = ((lnvar1.sub(lnvar0)? - 1.)? + ratio)?.add(&quad)?;
    Ok(kl.sum_all()?.affine(0.5 / n, 0.)?)
}

///
/// KL divergence of the block latent q(z) = N(M_b, S_b ⊗ I) against
/// the prior N(M₀, K ⊗ I), averaged over the batch. Each row of `M₀`
/// is vech(I_d).
///
/// 0.5 * [ d2h Σ_b tr(K⁻¹ S_b) + Σ_b tr((M₀ - M_b)ᵀ K⁻¹ (M₀ - M_b))
///         - b t d2h + b d2h log|K| - d2h Σ_b log|S_b| ] / b
///
/// * `z_mean` - `(b, t * d2h)`
/// * `covh` - `(b, t(t+1)/2)` packed lower factors `L_b`, `S_b = L_b L_bᵀ`
/// * `prior` - static kernel `K`
///
pub fn block_gaussian_kl(z_mean: &Tensor, covh: &Tensor, prior: &PriorKernel) -> Result<Tensor> {
    let t_dim = prior.dim();
    let (nb, z_dim) = z_mean.dims2()?;
    if z_dim % t_dim != 0 {
        return Err(VgpError::shape(format!(
            "latent width {} not divisible into {} blocks",
            z_dim, t_dim
        )));
    }
    let d2h_dim = z_dim / t_dim;
    let d_dim = vech_dim(d2h_dim)?;

    let (nb_covh, _) = covh.dims2()?;
    if nb_covh != nb {
        return Err(VgpError::shape(format!(
            "{} covariance factors for {} latent means",
            nb_covh, nb
        )));
    }

    let l_btt = batched_vech_to_cholesky_factor(covh)?;
    if l_btt.dims()[1] != t_dim {
        return Err(VgpError::shape(format!(
            "covariance factor is {} x {}, expected {} x {}",
            l_btt.dims()[1],
            l_btt.dims()[1],
            t_dim,
            t_dim
        )));
    }

    let dtype = z_mean.dtype();
    let k_inv_tt = prior.inverse().to_dtype(dtype)?;

    // trace term
    let s_btt = l_btt.matmul(&l_btt.transpose(1, 2)?.contiguous()?)?;
    let tr_b = batch_trace(&s_btt.broadcast_matmul(&k_inv_tt.unsqueeze(0)?)?)?;
    let trace = (tr_b.sum_all()? * d2h_dim as f64)?;

    // quadratic term
    let m0 = vech(&Tensor::eye(d_dim, dtype, z_mean.device())?)?.reshape((1, 1, d2h_dim))?;
    let delta_btk = z_mean.reshape((nb, t_dim, d2h_dim))?.broadcast_sub(&m0)?;
    let quad = k_inv_tt
        .unsqueeze(0)?
        .broadcast_matmul(&delta_btk)?
        .mul(&delta_btk)?
        .sum_all()?;

    // log determinants
    let diag_idx = vech_diag_positions(t_dim);
    let diag_idx = Tensor::from_vec(diag_idx, t_dim, covh.device())?;
    let log_diag = covh.index_select(&diag_idx, 1)?.abs()?.log()?.sum_all()?;
    let logdet_q = (log_diag * (2. * d2h_dim as f64))?;

    let nb = nb as f64;
    let d2h = d2h_dim as f64;
    let constant = nb * d2h * (prior.log_det() - t_dim as f64);

    let kl = ((trace + quad)? - logdet_q)?;
    Ok(kl.affine(0.5 / nb, 0.5 * constant / nb)?)
}

/// Diagonal Gaussian negative log-likelihood, averaged over the batch
///
/// 0.5 * Σ [ lnvar + (x - μ)^2 / exp(lnvar) + ln 2π ] / n
///
pub fn gaussian_nll(x_nd: &Tensor, mean_nd: &Tensor, lnvar_nd: &Tensor) -> Result<Tensor> {
    let n = batch_size(x_nd)?;
    let quad = x_nd.sub(mean_nd)?.sqr()?.mul(&lnvar_nd.neg()?.exp()?)?;
    let llik = (lnvar_nd.add(&quad)? + LN_2PI)?;
    Ok(llik.sum_all()?.affine(0.5 / n, 0.)?)
}

/// Binary cross-entropy with logits, summed over features and
/// averaged over the batch
///
/// Σ [ max(l, 0) - l x + log(1 + exp(-|l|)) ] / n
///
pub fn bernoulli_nll_with_logits(x_nd: &Tensor, logits_nd: &Tensor) -> Result<Tensor> {
    let n = batch_size(x_nd)?;
    let relu = logits_nd.relu()?;
    let softplus_neg_abs = (logits_nd.abs()?.neg()?.exp()? + 1.)?.log()?;
    let nll = relu.sub(&logits_nd.mul(x_nd)?)?.add(&softplus_neg_abs)?;
    Ok(nll.sum_all()?.affine(1. / n, 0.)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_linalg::{tensor_to_dmatrix, vech_len};
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use nalgebra::DMatrix;

    fn scalar(t: &Tensor) -> f64 {
        t.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap()
    }

    #[test]
    fn diag_kl_vanishes_at_equality() -> Result<()> {
        let mu = Tensor::randn(0f32, 1., (3, 7), &Device::Cpu)?;
        let ls = Tensor::randn(0f32, 1., (3, 7), &Device::Cpu)?;
        let kl = diag_gaussian_kl(&mu, &ls, &mu, &ls)?;
        assert_abs_diff_eq!(scalar(&kl), 0., epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn diag_kl_standard_normal() -> Result<()> {
        // KL(N(1, e) || N(0, 1)) = 0.5 (e - 1 - 1 + 1) per entry
        let mu = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        let ls = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        let zero = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let kl = diag_gaussian_kl(&mu, &ls, &zero, &zero)?;
        let expected = 3. * 0.5 * (1f64.exp() - 1.);
        assert_abs_diff_eq!(scalar(&kl), expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn block_kl_vanishes_at_prior() -> Result<()> {
        let t_dim = 4;
        let d_dim = 3;
        let prior = PriorKernel::periodic_phases(t_dim, 2f64.sqrt(), 1e-4, &Device::Cpu)?;

        let covh = vech(prior.cholesky())?.unsqueeze(0)?.repeat((2, 1))?;
        let m0 = vech(&Tensor::eye(d_dim, DType::F64, &Device::Cpu)?)?;
        let z_mean = m0.unsqueeze(0)?.repeat((2, t_dim))?;

        let kl = block_gaussian_kl(&z_mean, &covh, &prior)?;
        assert_abs_diff_eq!(scalar(&kl), 0., epsilon = 1e-6);
        Ok(())
    }

    /// dense KL between N(m, S ⊗ I) and N(m0, K ⊗ I) on the row-major
    /// flattening of a `t x k` matrix
    fn dense_kl(m: &DMatrix<f64>, s: &DMatrix<f64>, m0: &DMatrix<f64>, k: &DMatrix<f64>) -> f64 {
        let (t, c) = m.shape();
        let eye = DMatrix::<f64>::identity(c, c);
        let sq = s.kronecker(&eye);
        let kp = k.kronecker(&eye);
        let kp_inv = kp.clone().try_inverse().unwrap();

        let flat = |x: &DMatrix<f64>| DMatrix::from_row_slice(t * c, 1, x.transpose().as_slice());
        let delta = flat(m0) - flat(m);

        let tr = (&kp_inv * &sq).trace();
        let quad = (delta.transpose() * &kp_inv * &delta)[(0, 0)];
        let n = (t * c) as f64;
        0.5 * (tr + quad - n + kp.determinant().ln() - sq.determinant().ln())
    }

    #[test]
    fn block_kl_matches_dense() -> Result<()> {
        let t_dim = 3;
        let d_dim = 2;
        let d2h = vech_len(d_dim);
        let nb = 2;
        let dev = Device::Cpu;
        let prior = PriorKernel::periodic_phases(t_dim, 2f64.sqrt(), 1e-4, &dev)?;

        let z_mean = Tensor::randn(0f64, 1., (nb, t_dim * d2h), &dev)?;
        let covh = Tensor::randn(0f64, 0.5, (nb, vech_len(t_dim)), &dev)?;
        // keep the factors well away from singular
        let diag_shift = Tensor::new(&[1f64, 0., 1., 0., 0., 1.], &dev)?;
        let covh = covh.broadcast_add(&diag_shift)?;

        let kl = scalar(&block_gaussian_kl(&z_mean, &covh, &prior)?);

        let k = tensor_to_dmatrix(prior.kernel())?;
        let l_all = batched_vech_to_cholesky_factor(&covh)?;
        let m0_row = vech(&Tensor::eye(d_dim, DType::F64, &dev)?)?.to_vec1::<f64>()?;
        let m0 = DMatrix::from_fn(t_dim, d2h, |_, j| m0_row[j]);

        let mut expected = 0.;
        for b in 0..nb {
            let l = tensor_to_dmatrix(&l_all.get(b)?)?;
            let s = &l * l.transpose();
            let m = tensor_to_dmatrix(&z_mean.get(b)?.reshape((t_dim, d2h))?)?;
            expected += dense_kl(&m, &s, &m0, &k);
        }
        expected /= nb as f64;

        assert_abs_diff_eq!(kl, expected, epsilon = 1e-6 * expected.abs().max(1.));
        Ok(())
    }

    #[test]
    fn block_kl_rejects_batch_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let prior = PriorKernel::periodic_phases(4, 2f64.sqrt(), 1e-4, &dev)?;
        let z_mean = Tensor::zeros((2, 40), DType::F32, &dev)?;
        let covh = Tensor::ones((5, 10), DType::F32, &dev)?;
        assert!(matches!(
            block_gaussian_kl(&z_mean, &covh, &prior),
            Err(VgpError::Shape(_))
        ));
        Ok(())
    }

    #[test]
    fn gaussian_nll_unit_variance() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2.], [0., 0.]], &Device::Cpu)?;
        let mu = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let lnvar = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let nll = gaussian_nll(&x, &mu, &lnvar)?;
        let expected = 0.5 * (5. + 4. * LN_2PI) / 2.;
        assert_abs_diff_eq!(scalar(&nll), expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn bce_matches_log_sigmoid() -> Result<()> {
        let x = Tensor::new(&[[1f32, 0.]], &Device::Cpu)?;
        let logits = Tensor::new(&[[2f32, -3.]], &Device::Cpu)?;
        let nll = bernoulli_nll_with_logits(&x, &logits)?;
        let sig = |l: f64| 1. / (1. + (-l).exp());
        let expected = -(sig(2.).ln()) - (1. - sig(-3.)).ln();
        assert_abs_diff_eq!(scalar(&nll), expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn non_finite_loss_is_unstable() -> Result<()> {
        let nan = Tensor::new(f32::NAN, &Device::Cpu)?;
        let err = ensure_finite(&nan, "kld").unwrap_err();
        assert!(matches!(err, VgpError::NumericInstability(_)));
        Ok(())
    }
}
