use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

pub struct MinibatchData {
    pub input: Tensor,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_data(&self) -> usize;

    /// every row stacked in the original order
    fn full_data(&self, target_device: &Device) -> anyhow::Result<Tensor>;

    fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrix.  Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    shuffled_input_data: Option<Vec<Tensor>>,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;
        if data.is_empty() {
            return Err(anyhow::anyhow!("no rows to learn from"));
        }
        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            shuffled_input_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<MinibatchData> {
        let Some(shuffled) = self.shuffled_input_data.as_ref() else {
            return Err(anyhow::anyhow!("need to shuffle data"));
        };

        if let Some(x) = shuffled.get(batch_idx) {
            Ok(MinibatchData {
                input: x.to_device(target_device)?,
            })
        } else {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                shuffled.len()
            ))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.input_data.len()
    }

    fn full_data(&self, target_device: &Device) -> anyhow::Result<Tensor> {
        Ok(Tensor::cat(&self.input_data, 0)?.to_device(target_device)?)
    }

    fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size, rng)?;

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let shuffled = self
            .minibatches
            .chunks
            .iter()
            .map(|samples| -> anyhow::Result<Tensor> {
                let chunk: Vec<Tensor> = samples.iter().map(|&i| self.input_data[i].clone()).collect();
                Ok(Tensor::cat(&chunk, 0)?)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.shuffled_input_data = Some(shuffled);
        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` holds
/// `ceil(n / batch_size)` index sets of exactly `batch_size` rows
/// each, drawn with replacement.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) -> anyhow::Result<()> {
        if batch_size == 0 || self.samples.is_empty() {
            return Err(anyhow::anyhow!(
                "batch size {} over {} samples",
                batch_size,
                self.size()
            ));
        }

        self.samples.shuffle(rng);
        let nbatch = self.size().div_ceil(batch_size);
        let ntot = nbatch * batch_size;

        let indexes: Vec<usize> = (0..ntot)
            .map(|_| self.samples[rng.random_range(0..self.size())])
            .collect();

        self.chunks = indexes.chunks(batch_size).map(|c| c.to_vec()).collect();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let rows: Vec<Vec<f32>> = self.row_iter().map(|row| row.iter().copied().collect()).collect();
        let ncol = self.ncols();

        rows.into_par_iter()
            .map(|row| -> anyhow::Result<Tensor> { Ok(Tensor::from_vec(row, (1, ncol), &Device::Cpu)?) })
            .collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> anyhow::Result<Vec<Tensor>> {
        let (nrow, _) = self.dims2()?;
        (0..nrow)
            .map(|i| -> anyhow::Result<Tensor> { Ok(self.narrow(0, i, 1)?.to_device(&Device::Cpu)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn minibatches_have_fixed_size() -> anyhow::Result<()> {
        let data = DMatrix::<f32>::from_fn(10, 3, |i, j| (i * 3 + j) as f32);
        let mut loader = InMemoryData::new(&data)?;
        let mut rng = StdRng::seed_from_u64(11);
        loader.shuffle_minibatch(4, &mut rng)?;

        assert_eq!(loader.num_data(), 10);
        assert_eq!(loader.num_minibatch(), 3);
        for b in 0..loader.num_minibatch() {
            let mb = loader.minibatch_data(b, &Device::Cpu)?;
            assert_eq!(mb.input.dims(), &[4, 3]);
        }
        assert!(loader.minibatch_data(3, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn rows_stay_intact() -> anyhow::Result<()> {
        let data = DMatrix::<f32>::from_fn(5, 2, |i, j| (10 * i + j) as f32);
        let mut loader = InMemoryData::new(&data)?;
        loader.shuffle_minibatch(5, &mut StdRng::seed_from_u64(1))?;

        let x = loader.minibatch_data(0, &Device::Cpu)?.input.to_vec2::<f32>()?;
        for row in x {
            assert_eq!(row[1] - row[0], 1.);
            assert_eq!(row[0] % 10., 0.);
        }

        let full = loader.full_data(&Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(full[3], vec![30., 31.]);
        Ok(())
    }

    #[test]
    fn seeded_shuffles_repeat() -> anyhow::Result<()> {
        let data = Tensor::arange(0f32, 24., &Device::Cpu)?.reshape((12, 2))?;
        let mut a = InMemoryData::new(&data)?;
        let mut b = InMemoryData::new(&data)?;
        a.shuffle_minibatch(3, &mut StdRng::seed_from_u64(5))?;
        b.shuffle_minibatch(3, &mut StdRng::seed_from_u64(5))?;

        let xa = a.minibatch_data(2, &Device::Cpu)?.input.to_vec2::<f32>()?;
        let xb = b.minibatch_data(2, &Device::Cpu)?.input.to_vec2::<f32>()?;
        assert_eq!(xa, xb);
        Ok(())
    }

    #[test]
    fn loader_needs_shuffle_first() -> anyhow::Result<()> {
        let data = DMatrix::<f32>::zeros(3, 2);
        let loader = InMemoryData::new(&data)?;
        assert!(loader.minibatch_data(0, &Device::Cpu).is_err());
        Ok(())
    }
}
