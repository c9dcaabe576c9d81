pub mod candle_ard_kernel;
pub mod candle_aux_layers;
pub mod candle_data_loader;
pub mod candle_gp_reparameterize;
pub mod candle_inference;
pub mod candle_linalg;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_noise;
pub mod candle_prior_kernel;
pub mod candle_reparameterize;
pub mod candle_vgp_config;
pub mod candle_vgp_decoder;
pub mod candle_vgp_encoder;
pub mod candle_vgp_inference;
pub mod candle_vgp_model;
pub mod cli;
pub mod error;
pub mod periodic_data;

pub use candle_core;
pub use candle_nn;
