use crate::common_io::{read_records, write_lines, Delimiter};
use crate::traits::IoOps;
use candle_core::{DType, Device, Tensor};

impl IoOps for Tensor {
    type Scalar = f32;
    type Mat = Self;

    /// Each line becomes one row of an `n x d` f32 tensor on CPU
    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let hdr_line = match skip {
            Some(skip) => skip as i64,
            None => -1,
        };

        let records = read_records::<f32>(file, delim, hdr_line)?;

        if records.rows.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", file));
        }

        let nrows = records.rows.len();
        let ncols = records.width;
        let data = records.rows.into_iter().flatten().collect::<Vec<_>>();

        Ok(Tensor::from_vec(data, (nrows, ncols), &Device::Cpu)?)
    }

    /// Writes rows of a 1D or 2D tensor; 1D tensors become a single column
    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        let mat = match self.rank() {
            1 => self.unsqueeze(1)?,
            2 => self.clone(),
            r => return Err(anyhow::anyhow!("Expected 1 or 2 dimensions, got {}", r)),
        };

        let rows: Vec<Vec<f32>> = mat.to_dtype(DType::F32)?.to_vec2()?;

        let lines: Vec<Box<str>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", x))
                    .collect::<Vec<_>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect();

        write_lines(&lines, file)
    }
}
