
// imports
use crate::errors::{PipelineError, Result};
use crate::transform::ModelTransform;

use serde_json::Value;
use std::fmt::Display;
use std::fs::File;
use std::io::BufReader;

/// Placement hint for the tensors a partition carries.
///
/// This backend materializes everything in host memory; the tag tells a
/// downstream numeric consumer where the batch is meant to live. It is a
/// hint only and never implies ordering with other device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Host,
    Accelerator,
}

impl Default for Device {
    fn default() -> Self {
        Device::Host
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accelerator => write!(f, "accelerator"),
        }
    }
}

impl Device {
    pub fn parse(name: &str) -> Result<Device> {
        match name {
            "host" => Ok(Device::Host),
            "accelerator" => Ok(Device::Accelerator),
            other => Err(PipelineError::Format(format!(
                "device must be one of 'host, or accelerator'. Got '{}'.",
                other
            ))),
        }
    }
}

/// How the preloader walks the store: grid factors, worker count, queue
/// capacity, and where the transformed batches should end up.
#[derive(Debug, Clone)]
pub struct LoaderParams {
    pub sector_factor: usize,
    pub shard_factor: usize,
    pub num_loaders: usize,
    pub queue_size: usize,
    pub device: Device,
    pub verbose: bool,
}

impl Default for LoaderParams {
    fn default() -> Self {
        Self {
            sector_factor: 1,
            shard_factor: 1,
            num_loaders: 1,
            queue_size: 1,
            device: Device::Host,
            verbose: false,
        }
    }
}

impl Display for LoaderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "loader parameters:
        sector_factor: {},
        shard_factor: {},
        num_loaders: {},
        queue_size: {},
        device: {},
        verbose: {}",
            self.sector_factor,
            self.shard_factor,
            self.num_loaders,
            self.queue_size,
            self.device,
            self.verbose
        )
    }
}

impl LoaderParams {
    pub fn validate(&self) -> Result<()> {
        if self.sector_factor < 1 || self.shard_factor < 1 {
            return Err(PipelineError::Format(
                "sector_factor and shard_factor must be positive".to_string(),
            ));
        }
        if self.num_loaders < 1 {
            return Err(PipelineError::Format("num_loaders must be positive".to_string()));
        }
        if self.queue_size < 1 {
            return Err(PipelineError::Format("queue_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Config {
    pub cooc_dir: String,
    pub loader: LoaderParams,
    pub model: ModelTransform,
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "using hyper-params:
        cooc_dir: {}
        {}
        model: {}",
            self.cooc_dir, self.loader, self.model
        )
    }
}

impl Config {
    /// Read a configuration from a json file. Only `cooc_dir` and `model`
    /// are required, everything else falls back to a default.
    pub fn from_json_file(path: &str) -> Result<Config> {
        let f = File::open(path)
            .map_err(|e| PipelineError::Storage(format!("cannot open config {}: {}", path, e)))?;
        let json: Value = serde_json::from_reader(BufReader::new(f))?;

        let cooc_dir = json
            .get("cooc_dir")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Format("cooc_dir was not supplied through json".to_string()))?
            .to_owned();

        let loader = LoaderParams {
            sector_factor: get_usize(&json, "sector_factor", 1)?,
            shard_factor: get_usize(&json, "shard_factor", 1)?,
            num_loaders: get_usize(&json, "num_loaders", 1)?,
            queue_size: get_usize(&json, "queue_size", 1)?,
            device: match json.get("device") {
                Some(v) => Device::parse(v.as_str().ok_or_else(|| {
                    PipelineError::Format("device must be a string".to_string())
                })?)?,
                None => Device::Host,
            },
            verbose: get_bool(&json, "verbose", false)?,
        };
        loader.validate()?;

        let model_name = json
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Format("model was not supplied through json".to_string()))?;
        let model = parse_model(&json, model_name)?;

        Ok(Config { cooc_dir, loader, model })
    }
}

fn parse_model(json: &Value, name: &str) -> Result<ModelTransform> {
    match name {
        "ppmi" => Ok(ModelTransform::Ppmi),
        "glove" => Ok(ModelTransform::Glove {
            x_max: get_f32(json, "x_max", 100.0)?,
            alpha: get_f32(json, "alpha", 0.75)?,
        }),
        "sgns" => Ok(ModelTransform::Sgns { k: get_f32(json, "k", 15.0)? }),
        "mle" => Ok(ModelTransform::MaxLikelihood {
            temperature: get_f32(json, "temperature", 1.0)?,
        }),
        "map" => Ok(ModelTransform::MaxPosterior {
            temperature: get_f32(json, "temperature", 1.0)?,
        }),
        "kl" => Ok(ModelTransform::Kl { temperature: get_f32(json, "temperature", 1.0)? }),
        other => Err(PipelineError::Format(format!(
            "model must be one of 'ppmi, glove, sgns, mle, map, or kl'. Got '{}'.",
            other
        ))),
    }
}

fn get_usize(json: &Value, key: &str, default: usize) -> Result<usize> {
    match json.get(key) {
        Some(v) => v
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| PipelineError::Format(format!("given {} is not numeric", key))),
        None => Ok(default),
    }
}

fn get_f32(json: &Value, key: &str, default: f32) -> Result<f32> {
    match json.get(key) {
        Some(v) => v
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| PipelineError::Format(format!("given {} is not numeric", key))),
        None => Ok(default),
    }
}

fn get_bool(json: &Value, key: &str, default: bool) -> Result<bool> {
    match json.get(key) {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| PipelineError::Format(format!("given {} is not boolean", key))),
        None => Ok(default),
    }
}
