use crate::error::Result;
use candle_core::Tensor;
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

///
/// `h = ReLU(Linear(x))` followed by two linear heads. The second
/// head is a log-variance when `lnvar_range` is set (clamped into
/// it), otherwise an unconstrained output.
///
pub struct GaussianHeads {
    fc: StackLayers<Linear>,
    mean: Linear,
    second: Linear,
    lnvar_range: Option<(f64, f64)>,
}

impl GaussianHeads {
    /// Will create these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `mean.weight`
    /// * `lnvar.weight` or `raw.weight`
    ///
    /// # Arguments
    /// * `n_input` - input dim
    /// * `layers` - hidden widths, each followed by ReLU
    /// * `n_mean` - width of the mean head
    /// * `n_second` - width of the second head
    /// * `lnvar_range` - clamp for a log-variance head
    /// * `vs` - variable builder
    pub fn new(
        n_input: usize,
        layers: &[usize],
        n_mean: usize,
        n_second: usize,
        lnvar_range: Option<(f64, f64)>,
        vs: VarBuilder,
    ) -> Result<Self> {
        debug_assert!(!layers.is_empty());

        let mut fc = StackLayers::<Linear>::new();
        let mut prev_dim = n_input;
        for (j, &next_dim) in layers.iter().enumerate() {
            fc.push_with_act(
                candle_nn::linear(prev_dim, next_dim, vs.pp(format!("fc.{}", j)))?,
                Activation::Relu,
            );
            prev_dim = next_dim;
        }

        let second_name = if lnvar_range.is_some() { "lnvar" } else { "raw" };
        let mean = candle_nn::linear(prev_dim, n_mean, vs.pp("mean"))?;
        let second = candle_nn::linear(prev_dim, n_second, vs.pp(second_name))?;

        Ok(Self {
            fc,
            mean,
            second,
            lnvar_range,
        })
    }

    /// `(mean, second)` for a batch of inputs
    pub fn forward(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let h_nl = self.fc.forward(x_nd)?;
        let mean = self.mean.forward(&h_nl)?;
        let second = self.second.forward(&h_nl)?;
        let second = match self.lnvar_range {
            Some((lb, ub)) => second.clamp(lb, ub)?,
            None => second,
        };
        Ok((mean, second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn heads_have_requested_widths() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let heads = GaussianHeads::new(5, &[8], 3, 6, Some((-1., 1.)), vs)?;
        assert_eq!(heads.fc.len(), 1);

        let x = Tensor::randn(0f32, 10., (4, 5), &Device::Cpu)?;
        let (mean, lnvar) = heads.forward(&x)?;
        assert_eq!(mean.dims(), &[4, 3]);
        assert_eq!(lnvar.dims(), &[4, 6]);

        let lnvar = lnvar.flatten_all()?.to_vec1::<f32>()?;
        assert!(lnvar.iter().all(|&v| (-1. ..=1.).contains(&v)));
        Ok(())
    }
}
