use crate::candle_linalg::vech_len;
use crate::error::{Result, VgpError};

///
/// Model dimensions and fixed hyperparameters. Everything here is
/// decided at construction; the derived widths follow from
/// `x_dim` and `t_dim`:
///
/// * `d_dim = x_dim / t_dim`
/// * `d2h_dim = d_dim (d_dim + 1) / 2`
/// * `z_dim = t_dim * d2h_dim`
/// * `covh_dim = t_dim (t_dim + 1) / 2`
///
#[derive(Clone, Debug)]
pub struct VgpConfig {
    pub x_dim: usize,
    pub h_dim: usize,
    pub t_dim: usize,
    pub f_in: usize,
    pub f_out: usize,
    pub num_pseudo: usize,
    pub sigma2: f64,
    pub prior_lengthscale: f64,
    pub prior_jitter: f64,
    pub gp_jitter: f64,
}

impl VgpConfig {
    /// * `x_dim` - observation width, a multiple of `t_dim`
    /// * `h_dim` - hidden width of every network
    /// * `t_dim` - number of latent blocks
    pub fn new(x_dim: usize, h_dim: usize, t_dim: usize) -> Self {
        Self {
            x_dim,
            h_dim,
            t_dim,
            f_in: 20,
            f_out: 100,
            num_pseudo: 16,
            sigma2: 0.1,
            prior_lengthscale: 2f64.sqrt(),
            prior_jitter: 1e-4,
            gp_jitter: 1e-5,
        }
    }

    pub fn with_gp_dims(mut self, f_in: usize, f_out: usize) -> Self {
        self.f_in = f_in;
        self.f_out = f_out;
        self
    }

    pub fn with_num_pseudo(mut self, num_pseudo: usize) -> Self {
        self.num_pseudo = num_pseudo;
        self
    }

    pub fn with_sigma2(mut self, sigma2: f64) -> Self {
        self.sigma2 = sigma2;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("x_dim", self.x_dim),
            ("h_dim", self.h_dim),
            ("t_dim", self.t_dim),
            ("f_in", self.f_in),
            ("f_out", self.f_out),
            ("num_pseudo", self.num_pseudo),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(VgpError::shape(format!("{} must be positive", name)));
        }
        if self.x_dim % self.t_dim != 0 {
            return Err(VgpError::shape(format!(
                "x_dim {} is not divisible by t_dim {}",
                self.x_dim, self.t_dim
            )));
        }
        if !(self.sigma2 > 0. && self.prior_lengthscale > 0.) {
            return Err(VgpError::shape("σ² and the prior lengthscale must be positive"));
        }
        if !(self.prior_jitter >= 0. && self.gp_jitter >= 0.) {
            return Err(VgpError::shape("jitter must be non-negative"));
        }
        Ok(())
    }

    pub fn d_dim(&self) -> usize {
        self.x_dim / self.t_dim
    }

    pub fn d2h_dim(&self) -> usize {
        vech_len(self.d_dim())
    }

    pub fn z_dim(&self) -> usize {
        self.t_dim * self.d2h_dim()
    }

    pub fn covh_dim(&self) -> usize {
        vech_len(self.t_dim)
    }
}
