
// Strided partitioning of a square cooccurrence matrix.
//
// A factor F cuts the [0, V) x [0, V) index range into an F x F grid of
// interleaved cells: cell (i, j) selects rows congruent to i and columns
// congruent to j modulo F. Strided cells stay balanced in size for any V,
// and two partitionings compose by multiplying their selectors, which is
// what lets a shard address a cell inside a sector the same way it would
// address a cell of the whole matrix.

use std::fmt::Display;
use std::ops::Mul;

/// Every `step`-th index starting at `offset`, along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisSelect {
    pub step: usize,
    pub offset: usize,
}

impl AxisSelect {
    pub fn whole() -> AxisSelect {
        AxisSelect { step: 1, offset: 0 }
    }

    // resolve a selector taken relative to `outer` into absolute terms
    pub fn within(self, outer: AxisSelect) -> AxisSelect {
        AxisSelect {
            step: outer.step * self.step,
            offset: outer.offset + outer.step * self.offset,
        }
    }

    /// Number of indices selected along an axis of the given extent.
    pub fn count(&self, extent: usize) -> usize {
        if self.offset >= extent {
            0
        } else {
            (extent - self.offset + self.step - 1) / self.step
        }
    }

    /// The selected indices, in increasing order.
    pub fn indices(&self, extent: usize) -> impl Iterator<Item = usize> {
        (self.offset..extent).step_by(self.step.max(1))
    }
}

/// One cell of an F x F partitioning, as a pair of axis selectors.
///
/// The same id applies to a matrix of any extent, so a shard id computed
/// once can slice both a full matrix and a sector loaded from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub rows: AxisSelect,
    pub cols: AxisSelect,
}

impl ShardId {
    /// The identity cell, covering the whole matrix (factor 1).
    pub fn whole() -> ShardId {
        ShardId { rows: AxisSelect::whole(), cols: AxisSelect::whole() }
    }

    pub fn factor(&self) -> usize {
        self.rows.step
    }
}

impl Mul for ShardId {
    type Output = ShardId;

    // `shard * sector` resolves a shard id that is relative to a sector's
    // cell into the equivalent id on the full matrix.
    fn mul(self, outer: ShardId) -> ShardId {
        ShardId {
            rows: self.rows.within(outer.rows),
            cols: self.cols.within(outer.cols),
        }
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}+{}k, {}+{}k)",
            self.rows.offset, self.rows.step, self.cols.offset, self.cols.step
        )
    }
}

/// The ordered sequence of all F * F cells for a factor F, row-major.
#[derive(Debug, Clone, Copy)]
pub struct Shards {
    factor: usize,
}

impl Shards {
    pub fn new(factor: usize) -> Shards {
        assert!(factor >= 1, "partition factor must be positive");
        Shards { factor }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn len(&self) -> usize {
        self.factor * self.factor
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, i: usize) -> ShardId {
        assert!(i < self.len(), "shard index {} out of range", i);
        ShardId {
            rows: AxisSelect { step: self.factor, offset: i / self.factor },
            cols: AxisSelect { step: self.factor, offset: i % self.factor },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardId> {
        let shards = *self;
        (0..shards.len()).map(move |i| shards.get(i))
    }
}

#[cfg(test)]
mod tests {

    use super::{AxisSelect, ShardId, Shards};
    use std::collections::HashSet;

    // every cell pair of the full index range must be selected by exactly
    // one shard, for factors that do and do not divide the extent

    #[test]
    fn shards_tile_the_matrix_exactly_once() {
        for factor in 1..=4 {
            for extent in [4usize, 5, 9] {
                let mut covered = vec![vec![0usize; extent]; extent];
                for shard in Shards::new(factor).iter() {
                    for r in shard.rows.indices(extent) {
                        for c in shard.cols.indices(extent) {
                            covered[r][c] += 1;
                        }
                    }
                }
                for row in &covered {
                    for count in row {
                        assert_eq!(*count, 1);
                    }
                }
            }
        }
    }

    #[test]
    fn single_factor_is_the_identity() {
        let shards = Shards::new(1);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards.get(0), ShardId::whole());
        assert_eq!(shards.get(0).rows, AxisSelect { step: 1, offset: 0 });
    }

    #[test]
    fn composed_selectors_match_the_finer_partitioning() {
        // nesting factor-2 shards inside factor-2 sectors must reproduce
        // the 16 cells of a direct factor-4 partitioning
        let extent = 8;
        let sectors = Shards::new(2);
        let shards = Shards::new(2);

        let mut composed: HashSet<Vec<(usize, usize)>> = HashSet::new();
        for sector_id in sectors.iter() {
            for shard_id in shards.iter() {
                let id = shard_id * sector_id;
                assert_eq!(id.factor(), 4);
                let cells: Vec<(usize, usize)> = id
                    .rows
                    .indices(extent)
                    .flat_map(|r| id.cols.indices(extent).map(move |c| (r, c)))
                    .collect();
                composed.insert(cells);
            }
        }

        let mut direct: HashSet<Vec<(usize, usize)>> = HashSet::new();
        for id in Shards::new(4).iter() {
            let cells: Vec<(usize, usize)> = id
                .rows
                .indices(extent)
                .flat_map(|r| id.cols.indices(extent).map(move |c| (r, c)))
                .collect();
            direct.insert(cells);
        }

        assert_eq!(composed, direct);
    }

    #[test]
    fn composition_is_offset_then_stride() {
        let sector = AxisSelect { step: 3, offset: 2 };
        let shard = AxisSelect { step: 2, offset: 1 };
        let composed = shard.within(sector);
        assert_eq!(composed, AxisSelect { step: 6, offset: 5 });

        // counts agree with slicing in two steps
        let extent = 20;
        let sector_len = sector.count(extent);
        assert_eq!(shard.count(sector_len), composed.count(extent));
    }

    #[test]
    fn count_handles_offsets_past_the_extent() {
        let select = AxisSelect { step: 4, offset: 3 };
        assert_eq!(select.count(3), 0);
        assert_eq!(select.count(4), 1);
        assert_eq!(select.count(8), 2);
    }
}
