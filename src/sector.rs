
// On-disk store of cooccurrence statistics, read one sector at a time.
//
// The store directory is produced by the corpus statistics builder:
//
//     meta.json            vocab size and the sector grid factor
//     Nx.npy, Nxt.npy      global pair marginals, (V, 1) and (1, V)
//     uNx.npy, uNxt.npy    unigram counts, context side possibly smoothed
//     dictionary.json      token to index map
//     sector-R-C.bin.gz    one pair-count slice per sector grid cell
//
// Sector slices are gzip-compressed bincode of an ndarray; the vectors are
// plain npy. A loaded sector is fully materialized, no file handle stays
// open past `load`.

use crate::config::Device;
use crate::errors::{PipelineError, Result};
use crate::shards::{AxisSelect, ShardId, Shards};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{s, Array2, Axis};
use ndarray_npy::{read_npy, write_npy};
use ndarray_stats::QuantileExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Pairwise counts for one partition together with the global marginals.
///
/// `nxx` is the partition's slice of the count matrix. `nx` and `nxt` hold
/// the marginals of the whole matrix, indexed down to this partition's rows
/// and columns, and `n` is the total pair count. Keeping the marginals
/// global is what makes ratio statistics computed per shard agree with the
/// full-matrix values.
#[derive(Debug, Clone)]
pub struct CoocCounts {
    pub nxx: Array2<f32>,
    pub nx: Array2<f32>,
    pub nxt: Array2<f32>,
    pub n: f32,
    pub device: Device,
}

/// Unigram counts for one partition's rows and columns.
///
/// `unxt` may differ from `unx` because the builder can smooth the context
/// side only. `un` is the total word count.
#[derive(Debug, Clone)]
pub struct UnigramCounts {
    pub unx: Array2<f32>,
    pub unxt: Array2<f32>,
    pub un: f32,
    pub device: Device,
}

impl CoocCounts {
    pub fn on_device(&self, device: Device) -> CoocCounts {
        CoocCounts { device, ..self.clone() }
    }
}

impl UnigramCounts {
    pub fn on_device(&self, device: Device) -> UnigramCounts {
        UnigramCounts { device, ..self.clone() }
    }
}

/// One coarse grid cell of the store, held in memory.
#[derive(Debug)]
pub struct Sector {
    id: ShardId,
    vocab: usize,
    nxx: Array2<f32>,
    nx: Array2<f32>,
    nxt: Array2<f32>,
    n: f32,
    unx: Array2<f32>,
    unxt: Array2<f32>,
    un: f32,
}

impl Sector {
    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    /// Extent of this sector's count slice, rows by columns.
    pub fn extent(&self) -> (usize, usize) {
        self.nxx.dim()
    }

    /// Load one sector from `dir`. All file reads happen here.
    pub fn load(dir: &Path, sector_id: ShardId) -> Result<Sector> {
        let (vocab, sector_factor) = read_meta(dir)?;
        if sector_id.rows.step != sector_factor || sector_id.cols.step != sector_factor {
            return Err(PipelineError::Format(format!(
                "sector id {} does not belong to the stored factor {} grid",
                sector_id, sector_factor
            )));
        }

        let nx = read_npy_file(&dir.join("Nx.npy"))?;
        let nxt = read_npy_file(&dir.join("Nxt.npy"))?;
        let unx = read_npy_file(&dir.join("uNx.npy"))?;
        let unxt = read_npy_file(&dir.join("uNxt.npy"))?;
        check_dim("Nx", &nx, (vocab, 1))?;
        check_dim("Nxt", &nxt, (1, vocab))?;
        check_dim("uNx", &unx, (vocab, 1))?;
        check_dim("uNxt", &unxt, (1, vocab))?;

        let nxx = read_bin_gz(&dir.join(sector_file_name(sector_id)))?;
        let expected = (sector_id.rows.count(vocab), sector_id.cols.count(vocab));
        check_dim("sector Nxx", &nxx, expected)?;

        for (name, arr) in
            [("Nxx", &nxx), ("Nx", &nx), ("Nxt", &nxt), ("uNx", &unx), ("uNxt", &unxt)]
        {
            check_counts(name, arr)?;
        }

        let n = nx.sum();
        let un = unx.sum();
        Ok(Sector { id: sector_id, vocab, nxx, nx, nxt, n, unx, unxt, un })
    }

    /// Slice out one shard of this sector's counts. `shard` is relative to
    /// the sector's own extent; the returned marginals are the global ones,
    /// indexed to the shard's rows and columns.
    pub fn load_relative_shard(&self, shard: ShardId, device: Device) -> CoocCounts {
        let absolute = shard * self.id;
        CoocCounts {
            nxx: take_grid(&self.nxx, shard),
            nx: take_rows(&self.nx, absolute.rows),
            nxt: take_cols(&self.nxt, absolute.cols),
            n: self.n,
            device,
        }
    }

    /// Unigram counterpart of `load_relative_shard`, sliced along the axes
    /// the shard's rows and columns correspond to.
    pub fn load_relative_unigram_shard(&self, shard: ShardId, device: Device) -> UnigramCounts {
        let absolute = shard * self.id;
        UnigramCounts {
            unx: take_rows(&self.unx, absolute.rows),
            unxt: take_cols(&self.unxt, absolute.cols),
            un: self.un,
            device,
        }
    }
}

/// Write a full store directory from a dense count matrix. This is the
/// builder's output format; tests use it to set up fixtures.
pub fn write_store(
    dir: &Path,
    nxx: &Array2<f32>,
    unx: &Array2<f32>,
    unxt: &Array2<f32>,
    dictionary: Option<&HashMap<String, usize>>,
    sector_factor: usize,
) -> Result<()> {
    let vocab = nxx.nrows();
    if nxx.ncols() != vocab {
        return Err(PipelineError::Format(format!(
            "count matrix must be square, got {} x {}",
            nxx.nrows(),
            nxx.ncols()
        )));
    }
    check_dim("uNx", unx, (vocab, 1))?;
    check_dim("uNxt", unxt, (1, vocab))?;
    if sector_factor < 1 {
        return Err(PipelineError::Format("sector_factor must be positive".to_string()));
    }
    if let Some(d) = dictionary {
        if d.len() != vocab {
            return Err(PipelineError::Format(format!(
                "dictionary has {} tokens for a vocab of {}",
                d.len(),
                vocab
            )));
        }
    }

    fs::create_dir_all(dir)?;

    let meta = json!({ "vocab": vocab, "sector_factor": sector_factor });
    serde_json::to_writer(File::create(dir.join("meta.json"))?, &meta)?;

    // marginals are derived from the full matrix once, here, so every
    // sector sees the same global values
    let nx = nxx.sum_axis(Axis(1)).insert_axis(Axis(1));
    let nxt = nxx.sum_axis(Axis(0)).insert_axis(Axis(0));
    write_npy(dir.join("Nx.npy"), &nx)?;
    write_npy(dir.join("Nxt.npy"), &nxt)?;
    write_npy(dir.join("uNx.npy"), unx)?;
    write_npy(dir.join("uNxt.npy"), unxt)?;

    for sector_id in Shards::new(sector_factor).iter() {
        let slice = take_grid(nxx, sector_id);
        write_bin_gz(&dir.join(sector_file_name(sector_id)), &slice)?;
    }

    if let Some(d) = dictionary {
        serde_json::to_writer(File::create(dir.join("dictionary.json"))?, d)?;
    }
    Ok(())
}

/// Read the token to index map stored next to the counts.
pub fn load_dictionary(dir: &Path) -> Result<HashMap<String, usize>> {
    let (vocab, _) = read_meta(dir)?;
    let path = dir.join("dictionary.json");
    let f = File::open(&path)
        .map_err(|e| PipelineError::Storage(format!("cannot open {}: {}", path.display(), e)))?;
    let dictionary: HashMap<String, usize> = serde_json::from_reader(BufReader::new(f))?;
    if dictionary.len() != vocab {
        return Err(PipelineError::Format(format!(
            "dictionary has {} tokens for a vocab of {}",
            dictionary.len(),
            vocab
        )));
    }
    Ok(dictionary)
}

fn sector_file_name(id: ShardId) -> String {
    format!("sector-{}-{}.bin.gz", id.rows.offset, id.cols.offset)
}

fn read_meta(dir: &Path) -> Result<(usize, usize)> {
    let path = dir.join("meta.json");
    let f = File::open(&path)
        .map_err(|e| PipelineError::Storage(format!("cannot open {}: {}", path.display(), e)))?;
    let json: Value = serde_json::from_reader(BufReader::new(f))?;
    let vocab = json
        .get("vocab")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::Format("meta.json is missing a numeric 'vocab'".to_string()))?;
    let sector_factor = json.get("sector_factor").and_then(Value::as_u64).ok_or_else(|| {
        PipelineError::Format("meta.json is missing a numeric 'sector_factor'".to_string())
    })?;
    Ok((vocab as usize, sector_factor as usize))
}

fn read_npy_file(path: &Path) -> Result<Array2<f32>> {
    read_npy(path)
        .map_err(|e| PipelineError::Storage(format!("cannot read {}: {}", path.display(), e)))
}

fn read_bin_gz(path: &Path) -> Result<Array2<f32>> {
    let f = File::open(path)
        .map_err(|e| PipelineError::Storage(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = GzDecoder::new(BufReader::new(f));
    let mut buf: Vec<u8> = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| PipelineError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
    bincode::deserialize(&buf)
        .map_err(|e| PipelineError::Storage(format!("corrupt sector file {}: {}", path.display(), e)))
}

fn write_bin_gz(path: &Path, arr: &Array2<f32>) -> Result<()> {
    let f = BufWriter::new(File::create(path)?);
    let mut writer = GzEncoder::new(f, Compression::default());
    let encoded: Vec<u8> = bincode::serialize(arr)?;
    writer.write_all(&encoded)?;
    writer.finish()?;
    Ok(())
}

fn check_dim(name: &str, arr: &Array2<f32>, expected: (usize, usize)) -> Result<()> {
    if arr.dim() != expected {
        return Err(PipelineError::Format(format!(
            "{} has shape {:?}, expected {:?}",
            name,
            arr.dim(),
            expected
        )));
    }
    Ok(())
}

// counts must be non-negative and finite; QuantileExt refuses to order
// arrays containing nan, which is exactly the corrupt case
fn check_counts(name: &str, arr: &Array2<f32>) -> Result<()> {
    if arr.is_empty() {
        return Ok(());
    }
    match (arr.min(), arr.max()) {
        (Ok(lo), Ok(hi)) if *lo >= 0.0 && hi.is_finite() => Ok(()),
        (Ok(lo), Ok(_)) if *lo < 0.0 => {
            Err(PipelineError::Format(format!("{} contains a negative count {}", name, lo)))
        }
        _ => Err(PipelineError::Format(format!("{} contains non-finite counts", name))),
    }
}

fn take_rows(a: &Array2<f32>, sel: AxisSelect) -> Array2<f32> {
    let start = sel.offset.min(a.nrows());
    a.slice(s![start..;sel.step as isize, ..]).to_owned()
}

fn take_cols(a: &Array2<f32>, sel: AxisSelect) -> Array2<f32> {
    let start = sel.offset.min(a.ncols());
    a.slice(s![.., start..;sel.step as isize]).to_owned()
}

fn take_grid(a: &Array2<f32>, id: ShardId) -> Array2<f32> {
    let row_start = id.rows.offset.min(a.nrows());
    let col_start = id.cols.offset.min(a.ncols());
    a.slice(s![row_start..;id.rows.step as isize, col_start..;id.cols.step as isize]).to_owned()
}
