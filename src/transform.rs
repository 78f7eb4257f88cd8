
// Per-model statistical transforms.
//
// Each model family turns a raw partition (pair counts with global
// marginals, unigram counts) into the named tensors its loss function
// consumes. One tagged enum covers all families, so a pipeline is built
// once and the model is just a constructor argument.

use crate::corpus_stats::{
    calc_exp_pmi_stats, calc_pmi, calc_prior_beta_params, digamma, PmiMoments,
};
use crate::errors::{PipelineError, Result};
use crate::sector::{CoocCounts, UnigramCounts};

use ndarray::Array2;
use std::collections::HashMap;
use std::fmt::Display;

/// One named value of a transformed batch.
#[derive(Debug, Clone)]
pub enum BatchValue {
    Tensor(Array2<f32>),
    Scalar(f32),
}

impl BatchValue {
    pub fn tensor(&self) -> Option<&Array2<f32>> {
        match self {
            BatchValue::Tensor(t) => Some(t),
            BatchValue::Scalar(_) => None,
        }
    }

    pub fn scalar(&self) -> Option<f32> {
        match self {
            BatchValue::Tensor(_) => None,
            BatchValue::Scalar(s) => Some(*s),
        }
    }
}

/// The tensors a loss function receives, keyed by role. The key set is
/// fixed per model family, see [`ModelTransform::output_keys`].
pub type TransformedBatch = HashMap<&'static str, BatchValue>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelTransform {
    /// Positive pointwise mutual information.
    Ppmi,
    /// GloVe target and weighting.
    Glove { x_max: f32, alpha: f32 },
    /// Skip-gram negative sampling counts.
    Sgns { k: f32 },
    /// Maximum likelihood over cooccurrence probabilities.
    MaxLikelihood { temperature: f32 },
    /// Maximum posterior under a Beta prior matched to exp-PMI moments.
    MaxPosterior { temperature: f32 },
    /// KL objective, digamma expectations under the posterior Beta.
    Kl { temperature: f32 },
}

impl ModelTransform {
    /// Whether the model needs exp-PMI prior moments. When it does, the
    /// batch iterator accumulates them globally and passes them into
    /// every call, so posteriors stay comparable across shards.
    pub fn uses_pmi_prior(&self) -> bool {
        matches!(self, ModelTransform::MaxPosterior { .. } | ModelTransform::Kl { .. })
    }

    /// The role names this model writes into its batches.
    pub fn output_keys(&self) -> &'static [&'static str] {
        match self {
            ModelTransform::Ppmi => &["M"],
            ModelTransform::Glove { .. } => &["M", "weights"],
            ModelTransform::Sgns { .. } => &["Nxx", "N_neg"],
            ModelTransform::MaxLikelihood { .. } => {
                &["Pxx_data", "Pxx_independent", "temperature"]
            }
            ModelTransform::MaxPosterior { .. } => {
                &["N", "N_posterior", "Pxx_posterior", "Pxx_independent", "temperature"]
            }
            ModelTransform::Kl { .. } => {
                &["digamma_a", "digamma_b", "N", "N_posterior", "Pxx_independent", "temperature"]
            }
        }
    }

    /// Convert one raw partition into this model's batch. `moments`
    /// overrides the per-partition exp-PMI estimate for the Bayesian
    /// models; passing `None` falls back to estimating from this
    /// partition alone.
    pub fn transform(
        &self,
        cooc: &CoocCounts,
        unigrams: &UnigramCounts,
        moments: Option<&PmiMoments>,
    ) -> Result<TransformedBatch> {
        check_inputs(cooc, unigrams)?;
        let mut batch = TransformedBatch::new();
        match *self {
            ModelTransform::Ppmi => {
                // log(0) cells come out at negative infinity and the
                // clamp sends them to zero
                let m = calc_pmi(cooc).mapv(|v| v.max(0.0));
                batch.insert("M", BatchValue::Tensor(m));
            }
            ModelTransform::Glove { x_max, alpha } => {
                let m = cooc.nxx.mapv(|v| if v == 0.0 { 0.0 } else { v.ln() });
                let weights = cooc
                    .nxx
                    .mapv(|v| if v == 0.0 { 0.0 } else { (v / x_max).powf(alpha).min(1.0) * 2.0 });
                batch.insert("M", BatchValue::Tensor(m));
                batch.insert("weights", BatchValue::Tensor(weights));
            }
            ModelTransform::Sgns { k } => {
                let ratio = unigrams.unxt.mapv(|v| v / unigrams.un);
                let missed = &cooc.nx - &cooc.nxx;
                let n_neg = &missed * &ratio * k;
                batch.insert("Nxx", BatchValue::Tensor(cooc.nxx.clone()));
                batch.insert("N_neg", BatchValue::Tensor(n_neg));
            }
            ModelTransform::MaxLikelihood { temperature } => {
                let pxx_data = cooc.nxx.mapv(|v| v / cooc.n);
                batch.insert("Pxx_data", BatchValue::Tensor(pxx_data));
                batch.insert("Pxx_independent", BatchValue::Tensor(independence(cooc)));
                batch.insert("temperature", BatchValue::Scalar(temperature));
            }
            ModelTransform::MaxPosterior { temperature } => {
                let pxx_independent = independence(cooc);
                let prior = prior_moments(cooc, moments)?;
                let (alpha, beta) = calc_prior_beta_params(prior, &pxx_independent);
                let n_posterior = &(&alpha + &beta) + (cooc.n - 1.0);
                let pxx_posterior = &(&cooc.nxx + &alpha) / &n_posterior;
                batch.insert("N", BatchValue::Scalar(cooc.n));
                batch.insert("N_posterior", BatchValue::Tensor(n_posterior));
                batch.insert("Pxx_posterior", BatchValue::Tensor(pxx_posterior));
                batch.insert("Pxx_independent", BatchValue::Tensor(pxx_independent));
                batch.insert("temperature", BatchValue::Scalar(temperature));
            }
            ModelTransform::Kl { temperature } => {
                let pxx_independent = independence(cooc);
                let prior = prior_moments(cooc, moments)?;
                let (alpha, beta) = calc_prior_beta_params(prior, &pxx_independent);
                let n_posterior = &(&alpha + &beta) + (cooc.n - 1.0);
                // posterior Beta(a, b) per cell
                let a = &cooc.nxx + &alpha;
                let b = &(&beta - &cooc.nxx) + cooc.n;
                let dg = |arr: &Array2<f32>| arr.mapv(|v| digamma(f64::from(v)) as f32);
                let dg_ab = dg(&(&a + &b));
                let digamma_a = dg(&a) - &dg_ab;
                let digamma_b = dg(&b) - &dg_ab;
                batch.insert("digamma_a", BatchValue::Tensor(digamma_a));
                batch.insert("digamma_b", BatchValue::Tensor(digamma_b));
                batch.insert("N", BatchValue::Scalar(cooc.n));
                batch.insert("N_posterior", BatchValue::Tensor(n_posterior));
                batch.insert("Pxx_independent", BatchValue::Tensor(pxx_independent));
                batch.insert("temperature", BatchValue::Scalar(temperature));
            }
        }
        ensure_finite(&batch)?;
        Ok(batch)
    }
}

impl Display for ModelTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTransform::Ppmi => write!(f, "ppmi transform"),
            ModelTransform::Glove { x_max, alpha } => {
                write!(f, "glove transform\n\tx_max = {}\n\talpha = {}", x_max, alpha)
            }
            ModelTransform::Sgns { k } => write!(f, "word2vec transform\n\tk = {}", k),
            ModelTransform::MaxLikelihood { temperature } => {
                write!(f, "max likelihood transform\n\ttemperature = {}", temperature)
            }
            ModelTransform::MaxPosterior { temperature } => {
                write!(f, "max posterior transform\n\ttemperature = {}", temperature)
            }
            ModelTransform::Kl { temperature } => {
                write!(f, "kl transform\n\ttemperature = {}", temperature)
            }
        }
    }
}

// probability of each pair under row and column independence
fn independence(cooc: &CoocCounts) -> Array2<f32> {
    let px = cooc.nx.mapv(|v| v / cooc.n);
    let pxt = cooc.nxt.mapv(|v| v / cooc.n);
    &px * &pxt
}

fn prior_moments(cooc: &CoocCounts, moments: Option<&PmiMoments>) -> Result<PmiMoments> {
    match moments {
        Some(m) => Ok(*m),
        None => calc_exp_pmi_stats(cooc),
    }
}

fn check_inputs(cooc: &CoocCounts, unigrams: &UnigramCounts) -> Result<()> {
    let (rows, cols) = cooc.nxx.dim();
    let row_shape = (rows, 1);
    let col_shape = (1, cols);
    for (name, arr, want) in [
        ("Nx", &cooc.nx, row_shape),
        ("Nxt", &cooc.nxt, col_shape),
        ("uNx", &unigrams.unx, row_shape),
        ("uNxt", &unigrams.unxt, col_shape),
    ] {
        if arr.dim() != want {
            return Err(PipelineError::Shape {
                expected: format!("{:?}", want),
                actual: format!("{} is {:?}", name, arr.dim()),
            });
        }
    }
    for (name, arr) in [
        ("Nxx", &cooc.nxx),
        ("Nx", &cooc.nx),
        ("Nxt", &cooc.nxt),
        ("uNx", &unigrams.unx),
        ("uNxt", &unigrams.unxt),
    ] {
        if !arr.iter().all(|v| v.is_finite()) {
            return Err(PipelineError::Numeric(format!("{} contains non-finite values", name)));
        }
    }
    if !cooc.n.is_finite() || !unigrams.un.is_finite() {
        return Err(PipelineError::Numeric("total counts are not finite".to_string()));
    }
    Ok(())
}

fn ensure_finite(batch: &TransformedBatch) -> Result<()> {
    for (role, value) in batch {
        let finite = match value {
            BatchValue::Tensor(t) => t.iter().all(|v| v.is_finite()),
            BatchValue::Scalar(s) => s.is_finite(),
        };
        if !finite {
            return Err(PipelineError::Numeric(format!(
                "transform produced non-finite values for '{}'",
                role
            )));
        }
    }
    Ok(())
}
