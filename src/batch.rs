
// The training loop's view of the pipeline: every raw partition is
// preloaded once up front, then each epoch walks the same partitions and
// applies the model transform fresh, so hyperparameter changes between
// epochs take effect without reloading anything.

use crate::config::LoaderParams;
use crate::corpus_stats::{MomentAccum, PmiMoments};
use crate::errors::Result;
use crate::loader::{PreloadedShard, Preloader};
use crate::shards::ShardId;
use crate::transform::{ModelTransform, TransformedBatch};

use std::path::Path;

#[derive(Debug)]
pub struct BatchIterator {
    shards: Vec<PreloadedShard>,
    model: ModelTransform,
    moments: Option<PmiMoments>,
    params: LoaderParams,
    cursor: usize,
}

impl BatchIterator {
    /// Preload every partition of the store and get ready to serve
    /// transformed batches. For the Bayesian models the exp-PMI prior
    /// moments are accumulated here, once, over all partitions.
    pub fn new(dir: &Path, params: &LoaderParams, model: ModelTransform) -> Result<BatchIterator> {
        if params.verbose {
            println!("preloading all shards...");
        }
        let shards = Preloader::new(dir, params)?.preload_all()?;
        if params.verbose {
            println!("preloading complete, {} shards", shards.len());
        }

        let moments = if model.uses_pmi_prior() {
            let mut accum = MomentAccum::new();
            for shard in &shards {
                accum.add(&shard.cooc);
            }
            Some(accum.finalize()?)
        } else {
            None
        };

        Ok(BatchIterator { shards, model, moments, params: params.clone(), cursor: 0 })
    }

    /// Number of partitions per full traversal.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Start a new traversal. Resetting mid-walk or on a fresh iterator
    /// is fine, nothing besides the cursor changes.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// The active model and loader configuration, for logging.
    pub fn describe(&self) -> String {
        format!("{}\n{}", self.model, self.params)
    }
}

impl Iterator for BatchIterator {
    type Item = Result<(ShardId, TransformedBatch)>;

    // exhaustion is the plain end of iteration; errors mean the data
    // itself is bad and are not retried
    fn next(&mut self) -> Option<Self::Item> {
        let shard = self.shards.get(self.cursor)?;
        self.cursor += 1;
        let cooc = shard.cooc.on_device(self.params.device);
        let unigram = shard.unigram.on_device(self.params.device);
        let result = self
            .model
            .transform(&cooc, &unigram, self.moments.as_ref())
            .map(|batch| (shard.id, batch));
        Some(result)
    }
}

#[cfg(test)]
mod tests {

    use super::BatchIterator;
    use crate::config::{Device, LoaderParams};
    use crate::sector::write_store;
    use crate::transform::ModelTransform;
    use ndarray::array;

    // the fixture from the ppmi hand calculation: vocab of 2, one sector,
    // one shard, so the whole matrix arrives as a single batch
    fn tiny_store() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let nxx = array![[0.0, 4.0], [4.0, 2.0]];
        let unx = array![[3.0], [4.0]];
        let unxt = array![[3.0, 4.0]];
        write_store(dir.path(), &nxx, &unx, &unxt, None, 1).unwrap();
        dir
    }

    #[test]
    fn ppmi_batches_come_out_clamped() {
        let dir = tiny_store();
        let mut batches =
            BatchIterator::new(dir.path(), &LoaderParams::default(), ModelTransform::Ppmi).unwrap();
        assert_eq!(batches.len(), 1);

        let (id, batch) = batches.next().unwrap().unwrap();
        assert_eq!(id, crate::shards::ShardId::whole());
        let m = batch["M"].tensor().unwrap();
        assert_eq!(m[[0, 0]], 0.0);
        assert_eq!(m[[1, 1]], 0.0);
        let expected = (10.0f32 * 4.0 / (4.0 * 6.0)).ln();
        assert!((m[[0, 1]] - expected).abs() < 1e-5);

        assert!(batches.next().is_none());
    }

    #[test]
    fn traversals_are_restartable_and_identical() {
        let dir = tiny_store();
        let params = LoaderParams { shard_factor: 2, ..LoaderParams::default() };
        let model = ModelTransform::Glove { x_max: 100.0, alpha: 0.75 };
        let mut batches = BatchIterator::new(dir.path(), &params, model).unwrap();
        assert_eq!(batches.len(), 4);

        let first: Vec<_> = batches.by_ref().map(|b| b.unwrap().0).collect();
        assert!(batches.next().is_none());

        batches.restart();
        batches.restart(); // resetting twice changes nothing
        let second: Vec<_> = batches.by_ref().map(|b| b.unwrap().0).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn prior_moments_are_shared_across_shards() {
        let dir = tiny_store();
        // four single-cell shards, so a per-shard estimate would not even
        // be defined; the global accumulation makes them transformable
        let params = LoaderParams { shard_factor: 2, ..LoaderParams::default() };
        let model = ModelTransform::MaxPosterior { temperature: 1.0 };
        let batches = BatchIterator::new(dir.path(), &params, model).unwrap();
        let mut n_posterior_corner = Vec::new();
        for item in batches {
            let (_, batch) = item.unwrap();
            let n_post = batch["N_posterior"].tensor().unwrap().clone();
            n_posterior_corner.push(n_post[[0, 0]]);
        }
        assert_eq!(n_posterior_corner.len(), 4);
        for v in n_posterior_corner {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn describe_names_the_model_and_the_loader() {
        let dir = tiny_store();
        let params = LoaderParams { device: Device::Accelerator, ..LoaderParams::default() };
        let batches =
            BatchIterator::new(dir.path(), &params, ModelTransform::Sgns { k: 15.0 }).unwrap();
        let description = batches.describe();
        assert!(description.contains("word2vec"));
        assert!(description.contains("k = 15"));
        assert!(description.contains("accelerator"));
    }

    #[test]
    fn batches_land_on_the_configured_device() {
        let dir = tiny_store();
        let params = LoaderParams { device: Device::Accelerator, ..LoaderParams::default() };
        let preloader =
            crate::loader::Preloader::new(dir.path(), &params).unwrap();
        // preloaded partitions stage on the host
        for item in preloader.iter_worker(0) {
            assert_eq!(item.unwrap().cooc.device, Device::Host);
        }
    }
}
