use crate::error::Result;
use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

///
/// Standard normal noise drawn from an explicit generator, so that
/// a seeded `rng` reproduces every stochastic layer
///
pub fn randn<R, S>(rng: &mut R, shape: S, dtype: DType, device: &Device) -> Result<Tensor>
where
    R: Rng + ?Sized,
    S: Into<Shape>,
{
    let shape: Shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

/// `randn` with the shape, dtype and device of `like`
pub fn randn_like<R>(rng: &mut R, like: &Tensor) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    randn(rng, like.shape().clone(), like.dtype(), like.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn seeded_noise_is_reproducible() -> Result<()> {
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let a = randn(&mut rng1, (3, 4), DType::F32, &Device::Cpu)?;
        let b = randn(&mut rng2, (3, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(a.dims(), &[3, 4]);
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);

        let c = randn_like(&mut rng1, &a)?;
        assert_ne!(a.to_vec2::<f32>()?, c.to_vec2::<f32>()?);
        Ok(())
    }
}
