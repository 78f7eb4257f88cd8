
// Statistics shared by the model transforms.
//
// Everything here takes a partition's counts with the global marginals
// attached, so the values agree with what a full-matrix computation would
// produce no matter how the matrix was sharded.

use crate::errors::{PipelineError, Result};
use crate::sector::CoocCounts;

use ndarray::{Array2, Zip};

/// Pointwise mutual information, `log(N * Nxx / (Nx * Nxt))`.
///
/// Zero-count cells come out as negative infinity; callers decide how to
/// treat them (PPMI clamps, the moment estimator skips them).
pub fn calc_pmi(counts: &CoocCounts) -> Array2<f32> {
    let log_nxx = counts.nxx.mapv(f32::ln);
    let log_nx = counts.nx.mapv(f32::ln);
    let log_nxt = counts.nxt.mapv(f32::ln);
    let pmi = &log_nxx - &log_nx;
    let pmi = &pmi - &log_nxt;
    pmi + counts.n.ln()
}

/// PMI with zero counts clamped to one before the log, so every cell is
/// finite. Useful when a model wants a dense matrix without the clamp at
/// zero that PPMI applies.
pub fn calc_pmi_star(counts: &CoocCounts) -> Array2<f32> {
    let clamped = CoocCounts {
        nxx: counts.nxx.mapv(|v| if v == 0.0 { 1.0 } else { v }),
        ..counts.clone()
    };
    calc_pmi(&clamped)
}

/// Mean and standard deviation of `exp(PMI)` over cells with `Nxx > 0`.
#[derive(Debug, Clone, Copy)]
pub struct PmiMoments {
    pub exp_mean: f32,
    pub exp_std: f32,
}

/// Accumulates exp-PMI moments across partitions.
///
/// Feeding every partition of a matrix through one accumulator gives the
/// same result as a single whole-matrix pass, which keeps the Bayesian
/// prior identical for every shard.
#[derive(Debug, Default)]
pub struct MomentAccum {
    count: u64,
    sum: f64,
    sumsq: f64,
}

impl MomentAccum {
    pub fn new() -> MomentAccum {
        MomentAccum::default()
    }

    pub fn add(&mut self, counts: &CoocCounts) {
        let pmi = calc_pmi(counts);
        for (&p, &nxx) in pmi.iter().zip(counts.nxx.iter()) {
            if nxx > 0.0 {
                let e = f64::from(p).exp();
                self.count += 1;
                self.sum += e;
                self.sumsq += e * e;
            }
        }
    }

    pub fn finalize(&self) -> Result<PmiMoments> {
        if self.count < 2 {
            return Err(PipelineError::Numeric(format!(
                "need at least two nonzero cells to estimate exp-pmi moments, got {}",
                self.count
            )));
        }
        let count = self.count as f64;
        let mean = self.sum / count;
        // unbiased variance, matching the usual sample std
        let var = (self.sumsq - count * mean * mean) / (count - 1.0);
        let std = var.max(0.0).sqrt();
        if !mean.is_finite() || !std.is_finite() {
            return Err(PipelineError::Numeric(
                "exp-pmi moments are not finite, the counts are corrupt".to_string(),
            ));
        }
        Ok(PmiMoments { exp_mean: mean as f32, exp_std: std as f32 })
    }
}

/// Exp-PMI moments of a single partition.
pub fn calc_exp_pmi_stats(counts: &CoocCounts) -> Result<PmiMoments> {
    let mut accum = MomentAccum::new();
    accum.add(counts);
    accum.finalize()
}

/// Match a Beta prior to the exp-PMI moments, cell by cell.
///
/// The prior is placed on the independence-normalized cooccurrence
/// probability: its mean and std per cell are the global exp-PMI moments
/// scaled by `Pxx_independent`, and `(alpha, beta)` follow from Beta
/// moment matching.
pub fn calc_prior_beta_params(
    moments: PmiMoments,
    pxx_independent: &Array2<f32>,
) -> (Array2<f32>, Array2<f32>) {
    let mean = pxx_independent.mapv(|p| p * moments.exp_mean);
    let std = pxx_independent.mapv(|p| p * moments.exp_std);
    let alpha = Zip::from(&mean)
        .and(&std)
        .map_collect(|&m, &s| m * (m * (1.0 - m) / (s * s) - 1.0));
    let beta = Zip::from(&mean).and(&alpha).map_collect(|&m, &a| (1.0 - m) * a / m);
    (alpha, beta)
}

/// Digamma function, the derivative of `ln(gamma(x))`.
///
/// Recurrence up to `x >= 6`, then the asymptotic series. Accurate to well
/// below f32 resolution, which is all the KL transform needs.
pub fn digamma(x: f64) -> f64 {
    let mut x = x;
    let mut result = 0.0;
    while x < 6.0 {
        result -= 1.0 / x;
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    result + x.ln()
        - 0.5 * inv
        - inv2 * (1.0 / 12.0 - inv2 * (1.0 / 120.0 - inv2 * (1.0 / 252.0)))
}

/// Word2vec undersampling: probability of keeping each row word, from its
/// unigram frequency and the threshold `t`.
pub fn w2v_prob_keep(unx: &Array2<f32>, un: f32, t: f32) -> Array2<f32> {
    unx.mapv(|count| {
        let freq = count / un;
        let drop = ((freq - t) / freq - (t / freq).sqrt()).clamp(0.0, 1.0);
        1.0 - drop
    })
}
