use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::tempdir;

/// Field separator of a delimited record file
pub enum Delimiter {
    Str(String),
    Chars(Vec<char>),
}

impl From<&str> for Delimiter {
    fn from(s: &str) -> Self {
        Delimiter::Str(s.to_string())
    }
}

impl From<&[char]> for Delimiter {
    fn from(chars: &[char]) -> Self {
        Delimiter::Chars(chars.to_vec())
    }
}

impl<const N: usize> From<&[char; N]> for Delimiter {
    fn from(chars: &[char; N]) -> Self {
        Delimiter::Chars(chars.to_vec())
    }
}

impl Delimiter {
    fn split<'a>(&'a self, line: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        match self {
            Delimiter::Str(s) => Box::new(line.split(s.as_str())),
            Delimiter::Chars(chars) => Box::new(line.split(chars.as_slice())),
        }
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - anything that prints as one line
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T>(lines: &[T], output_file_path: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file_path)?;
    for line in lines {
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            } else {
                return Err(anyhow::anyhow!("unexpected error: {}", e));
            }
        }
    }
    buf.flush()?;
    Ok(())
}

/// Fixed-width numeric records read off a delimited file
pub struct Records<T> {
    pub rows: Vec<Vec<T>>,
    pub header: Vec<Box<str>>,
    pub width: usize,
}

///
/// Read numeric records, one per line. Every record must carry the
/// same number of fields; lines starting with `#` or `%` are skipped.
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - field separator
/// * `hdr_line` - location of a header line (-1 = no header line)
///
pub fn read_records<T>(
    input_file: &str,
    delim: impl Into<Delimiter>,
    hdr_line: i64,
) -> anyhow::Result<Records<T>>
where
    T: Send + std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let delim = delim.into();
    let buf_reader = open_buf_reader(input_file)?;

    let lines_raw: Vec<Box<str>> = buf_reader
        .lines()
        .map_while(Result::ok)
        .filter(|x| !(x.starts_with('#') || x.starts_with('%') || x.trim().is_empty()))
        .map(|x| x.into_boxed_str())
        .collect();

    let (header, body) = if hdr_line < 0 {
        (vec![], &lines_raw[..])
    } else {
        let n_skip = hdr_line as usize;
        if lines_raw.len() < n_skip + 1 {
            return Err(anyhow::anyhow!("not enough lines in {}", input_file));
        }
        let header = lines_raw[n_skip]
            .split_whitespace()
            .map(|x| x.to_owned().into_boxed_str())
            .collect();
        (header, &lines_raw[(n_skip + 1)..])
    };

    let mut rows = body
        .par_iter()
        .enumerate()
        .map(|(i, line)| -> anyhow::Result<(usize, Vec<T>)> {
            let row = delim
                .split(line)
                .map(|x| {
                    x.trim()
                        .parse::<T>()
                        .map_err(|e| anyhow::anyhow!("line {}: bad field {:?}: {}", i, x, e))
                })
                .collect::<anyhow::Result<Vec<T>>>()?;
            Ok((i, row))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    rows.sort_by_key(|&(i, _)| i);

    let width = rows.first().map(|(_, r)| r.len()).unwrap_or(0);
    if let Some((i, r)) = rows.iter().find(|(_, r)| r.len() != width) {
        return Err(anyhow::anyhow!(
            "record {} has {} fields, expected {}",
            i,
            r.len(),
            width
        ));
    }

    Ok(Records {
        rows: rows.into_iter().map(|(_, r)| r).collect(),
        header,
        width,
    })
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not, or `stdout`
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn std::io::Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(std::io::BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Create the parent directory of `file` if needed
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

///
/// Create a temporary directory and suggest a file name
/// * `suffix` - suffix of the file name
///
pub fn create_temp_dir_file(suffix: &str) -> anyhow::Result<std::path::PathBuf> {
    let temp_dir = tempdir()?.path().to_path_buf();
    std::fs::create_dir_all(&temp_dir)?;
    let temp_file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile_in(&temp_dir)?
        .path()
        .to_owned();
    Ok(temp_file)
}
