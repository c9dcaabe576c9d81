pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 100,
            num_epochs: 100,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            seed: 42,
        }
    }
}
