
// Streams raw partitions out of the store.
//
// One worker walks its assigned sectors in order and slices every shard
// of each before moving on, so at most one sector's counts are resident
// per worker. With several workers the partitions flow through one
// bounded queue: producers block when it fills up, and the consumer
// knows the stream is done once every producer has hung up.

use crate::config::{Device, LoaderParams};
use crate::errors::{PipelineError, Result};
use crate::sector::{CoocCounts, Sector, UnigramCounts};
use crate::shards::{ShardId, Shards};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One raw partition staged for transformation. The id composes the
/// sector's cell with the shard's cell, so it addresses the partition on
/// the full matrix.
#[derive(Debug, Clone)]
pub struct PreloadedShard {
    pub id: ShardId,
    pub cooc: CoocCounts,
    pub unigram: UnigramCounts,
}

/// Walks sectors and shards of a store according to the loader
/// parameters.
pub struct Preloader {
    dir: PathBuf,
    params: LoaderParams,
}

impl Preloader {
    pub fn new(dir: &Path, params: &LoaderParams) -> Result<Preloader> {
        params.validate()?;
        Ok(Preloader { dir: dir.to_path_buf(), params: params.clone() })
    }

    /// Total number of partitions a full traversal produces.
    pub fn len(&self) -> usize {
        Shards::new(self.params.sector_factor).len() * Shards::new(self.params.shard_factor).len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    // round robin assignment over the sector order; a remainder just
    // makes some workers one sector longer than others
    fn assigned_sectors(&self, loader_id: usize) -> Vec<ShardId> {
        Shards::new(self.params.sector_factor)
            .iter()
            .enumerate()
            .filter(|(i, _)| i % self.params.num_loaders == loader_id)
            .map(|(_, id)| id)
            .collect()
    }

    /// The lazy partition stream of one worker.
    pub fn iter_worker(&self, loader_id: usize) -> SectorShardIter {
        SectorShardIter {
            dir: self.dir.clone(),
            sector_ids: self.assigned_sectors(loader_id),
            shard_factor: self.params.shard_factor,
            verbose: self.params.verbose,
            loader_id,
            next_sector: 0,
            current: None,
            next_shard: 0,
            failed: false,
        }
    }

    /// Start all workers and return the consuming end of their queue.
    pub fn stream(&self) -> MultiStream {
        MultiStream::spawn(self)
    }

    /// Drain the whole store into memory. With one loader this runs on
    /// the caller's thread; with more it spawns them and drains the
    /// shared queue in arrival order. The first error wins and anything
    /// already queued is discarded.
    pub fn preload_all(&self) -> Result<Vec<PreloadedShard>> {
        if self.params.num_loaders == 1 {
            let mut out = Vec::new();
            for item in self.iter_worker(0) {
                out.push(item?);
            }
            return Ok(out);
        }

        let stream = self.stream();
        let mut out = Vec::new();
        let mut failure: Option<PipelineError> = None;
        while let Some(item) = stream.recv() {
            match item {
                Ok(shard) => out.push(shard),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        stream.join()?;
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

/// Lazy iterator over one worker's (sector, shard) partitions.
///
/// Holds at most one loaded sector; shards are sliced out of it on
/// demand. After an error the iterator is finished, data errors are not
/// retried.
pub struct SectorShardIter {
    dir: PathBuf,
    sector_ids: Vec<ShardId>,
    shard_factor: usize,
    verbose: bool,
    loader_id: usize,
    next_sector: usize,
    current: Option<Sector>,
    next_shard: usize,
    failed: bool,
}

impl Iterator for SectorShardIter {
    type Item = Result<PreloadedShard>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(sector) = &self.current {
                let shards = Shards::new(self.shard_factor);
                if self.next_shard < shards.len() {
                    let shard_id = shards.get(self.next_shard);
                    self.next_shard += 1;
                    // staged on the host, final placement happens at
                    // transform time
                    let cooc = sector.load_relative_shard(shard_id, Device::Host);
                    let unigram = sector.load_relative_unigram_shard(shard_id, Device::Host);
                    let id = shard_id * sector.id();
                    return Some(Ok(PreloadedShard { id, cooc, unigram }));
                }
                // release this sector before the next one loads
                self.current = None;
            }
            let &sector_id = self.sector_ids.get(self.next_sector)?;
            self.next_sector += 1;
            if self.verbose {
                println!("loader {}: reading sector {}", self.loader_id, sector_id);
            }
            match Sector::load(&self.dir, sector_id) {
                Ok(sector) => {
                    self.current = Some(sector);
                    self.next_shard = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// The consuming end of the worker queue.
pub struct MultiStream {
    rx: Receiver<Result<PreloadedShard>>,
    handles: Vec<JoinHandle<()>>,
    sent: Arc<AtomicUsize>,
}

impl MultiStream {
    fn spawn(preloader: &Preloader) -> MultiStream {
        let (tx, rx) = sync_channel::<Result<PreloadedShard>>(preloader.params.queue_size);
        let sent = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for loader_id in 0..preloader.params.num_loaders {
            let tx = tx.clone();
            let sent = Arc::clone(&sent);
            let worker = preloader.iter_worker(loader_id);
            handles.push(thread::spawn(move || {
                for item in worker {
                    let stop = item.is_err();
                    // blocks while the queue is full; send only fails
                    // once the consumer is gone, in which case there is
                    // nobody left to notify
                    if tx.send(item).is_err() {
                        return;
                    }
                    sent.fetch_add(1, Ordering::Relaxed);
                    if stop {
                        return;
                    }
                }
                // dropping the sender is this worker's completion signal
            }));
        }
        drop(tx);
        MultiStream { rx, handles, sent }
    }

    /// Next partition in arrival order. Arrival order across workers is
    /// unspecified; within one worker it follows the partition scheme.
    /// Returns `None` once every worker has finished.
    pub fn recv(&self) -> Option<Result<PreloadedShard>> {
        self.rx.recv().ok()
    }

    /// How many partitions the workers have pushed so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Drop the receiving end and wait for every worker to exit. A
    /// panicked worker surfaces here as a worker error.
    pub fn join(self) -> Result<()> {
        let MultiStream { rx, handles, .. } = self;
        drop(rx);
        for handle in handles {
            handle
                .join()
                .map_err(|_| PipelineError::Worker("a loader thread panicked".to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::Preloader;
    use crate::config::LoaderParams;
    use crate::errors::PipelineError;
    use crate::sector::write_store;
    use crate::shards::ShardId;
    use ndarray::Array2;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    fn toy_store(sector_factor: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let vocab = 4;
        let nxx = Array2::from_shape_fn((vocab, vocab), |(i, j)| (i * vocab + j) as f32);
        let unx = Array2::from_shape_fn((vocab, 1), |(i, _)| 1.0 + i as f32);
        let unxt = Array2::from_shape_fn((1, vocab), |(_, j)| 2.0 + j as f32);
        write_store(dir.path(), &nxx, &unx, &unxt, None, sector_factor).unwrap();
        dir
    }

    fn params(sector_factor: usize, shard_factor: usize, num_loaders: usize) -> LoaderParams {
        LoaderParams { sector_factor, shard_factor, num_loaders, ..LoaderParams::default() }
    }

    #[test]
    fn round_robin_covers_every_sector_exactly_once() {
        let dir = toy_store(2);
        let preloader = Preloader::new(dir.path(), &params(2, 1, 3)).unwrap();

        let mut seen: HashSet<ShardId> = HashSet::new();
        let mut total = 0;
        for loader_id in 0..3 {
            for item in preloader.iter_worker(loader_id) {
                let shard = item.unwrap();
                assert!(seen.insert(shard.id), "sector {} produced twice", shard.id);
                total += 1;
            }
        }
        // 4 sectors over 3 loaders, one of them takes the remainder
        assert_eq!(total, 4);
    }

    #[test]
    fn multi_loader_output_is_the_single_loader_multiset() {
        let dir = toy_store(2);
        let single = Preloader::new(dir.path(), &params(2, 2, 1)).unwrap().preload_all().unwrap();
        let multi = Preloader::new(dir.path(), &params(2, 2, 3)).unwrap().preload_all().unwrap();
        assert_eq!(single.len(), 16);
        assert_eq!(multi.len(), 16);

        let collect = |shards: &[super::PreloadedShard]| -> HashMap<ShardId, Vec<f32>> {
            shards
                .iter()
                .map(|s| (s.id, s.cooc.nxx.iter().copied().collect::<Vec<f32>>()))
                .collect()
        };
        // arrival order differs across workers, content must not
        assert_eq!(collect(&single), collect(&multi));
    }

    #[test]
    fn producers_block_on_a_full_queue_and_drop_nothing() {
        let dir = toy_store(1);
        let preloader = Preloader::new(dir.path(), &params(1, 2, 1)).unwrap();
        let mut p = params(1, 2, 1);
        p.queue_size = 1;
        let stream = Preloader::new(dir.path(), &p).unwrap().stream();

        // consumer stalls: the worker gets one item into the queue and
        // then blocks in send, it cannot run ahead
        std::thread::sleep(Duration::from_millis(200));
        assert!(stream.sent() <= 2, "queue allowed {} unconsumed pushes", stream.sent());

        let mut got = 0;
        while let Some(item) = stream.recv() {
            item.unwrap();
            got += 1;
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(got, preloader.len());
        assert_eq!(stream.sent(), got);
        stream.join().unwrap();
    }

    #[test]
    fn a_missing_sector_fails_the_whole_preload() {
        let dir = toy_store(2);
        std::fs::remove_file(dir.path().join("sector-1-0.bin.gz")).unwrap();

        let single = Preloader::new(dir.path(), &params(2, 1, 1)).unwrap().preload_all();
        assert!(matches!(single.unwrap_err(), PipelineError::Storage(_)));

        let multi = Preloader::new(dir.path(), &params(2, 1, 2)).unwrap().preload_all();
        assert!(matches!(multi.unwrap_err(), PipelineError::Storage(_)));
    }
}
