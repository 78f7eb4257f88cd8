
mod batch;
mod config;
mod corpus_stats;
mod errors;
mod loader;
mod sector;
mod shards;
mod transform;

pub use batch::BatchIterator;
pub use config::{Config, Device, LoaderParams};
pub use corpus_stats::{
    calc_exp_pmi_stats, calc_pmi, calc_pmi_star, calc_prior_beta_params, digamma, w2v_prob_keep,
    MomentAccum, PmiMoments,
};
pub use errors::{PipelineError, Result};
pub use loader::{MultiStream, PreloadedShard, Preloader, SectorShardIter};
pub use sector::{load_dictionary, write_store, CoocCounts, Sector, UnigramCounts};
pub use shards::{AxisSelect, ShardId, Shards};
pub use transform::{BatchValue, ModelTransform, TransformedBatch};
