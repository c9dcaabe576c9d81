use crate::candle_linalg::{batched_vech_to_cholesky_factor, vech_len};
use crate::candle_noise::randn_like;
use crate::error::{Result, VgpError};
use candle_core::Tensor;
use rand::Rng;

/// Diagonal Gaussian reparameterization
///
/// z = μ + exp(0.5 * lnvar) * eps
/// where eps ~ N(0, 1)
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
/// * `rng` - noise source
/// * `train` - sample if true, return the mean otherwise
pub fn reparameterize_nm<R>(z_mean: &Tensor, z_lnvar: &Tensor, rng: &mut R, train: bool) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    if train {
        let eps = randn_like(rng, z_mean)?;
        Ok((z_mean + (z_lnvar * 0.5)?.exp()?.mul(&eps)?)?)
    } else {
        Ok(z_mean.clone())
    }
}

///
/// Block latent reparameterization. `z_mean` `(b, t * k)` is read as
/// `b` row-major `t x k` matrices `M`, `covh` `(b, t(t+1)/2)` packs
/// their lower factors `L`.
///
/// Z = M + L E, E ~ N(0, I) of shape `(b, t, k)`
///
/// so the rows of `Z` are coupled by `L Lᵀ` and the columns are
/// independent.
///
pub fn reparameterize_lt<R>(
    z_mean: &Tensor,
    covh: &Tensor,
    t_dim: usize,
    rng: &mut R,
    train: bool,
) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let (nb, z_dim) = z_mean.dims2()?;
    let (nb_covh, n_covh) = covh.dims2()?;
    if t_dim == 0 || z_dim % t_dim != 0 || nb != nb_covh || n_covh != vech_len(t_dim) {
        return Err(VgpError::shape(format!(
            "mean {:?} and factor {:?} do not fit {} blocks",
            z_mean.dims(),
            covh.dims(),
            t_dim
        )));
    }

    if !train {
        return Ok(z_mean.clone());
    }

    let m_btk = z_mean.reshape((nb, t_dim, z_dim / t_dim))?;
    let l_btt = batched_vech_to_cholesky_factor(covh)?;
    let eps_btk = randn_like(rng, &m_btk)?;
    let z_btk = m_btk.add(&l_btt.matmul(&eps_btk)?)?;
    Ok(z_btk.reshape((nb, z_dim))?)
}
