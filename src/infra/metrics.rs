// ============================================================
// Layer 6 — Metrics
// ============================================================
// Token-level bookkeeping for the agent plus a CSV log of every
// validation run.
//
// The agent only accumulates three sums:
//   loss            summed cross entropy over target tokens
//   num_tokens      target tokens seen (including __end__)
//   correct_tokens  argmax predictions matching the target
//
// and derives the reported values from them:
//   loss      = loss / num_tokens
//   ppl       = exp(loss)                (∞ on overflow)
//   token_acc = correct_tokens / num_tokens
//
// Reported values are rounded to 4 significant figures.
//
// Example CSV output (checkpoints/metrics.csv):
//   epoch,train_loss,train_ppl,valid_loss,valid_ppl,valid_token_acc,lr
//   1,5.123000,167.8000,4.987000,146.5000,0.121000,3.000000

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

/// Round `x` to `sigfigs` significant figures. Zero and non-finite
/// values are returned unchanged.
pub fn round_sigfigs(x: f64, sigfigs: i32) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let magnitude = x.abs().log10().floor() as i32;
    let digits = sigfigs - 1 - magnitude;
    if digits >= 0 {
        let scale = 10f64.powi(digits);
        (x * scale).round() / scale
    } else {
        let scale = 10f64.powi(-digits);
        (x / scale).round() * scale
    }
}

// ─── TokenMetrics ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenMetrics {
    pub loss:                  f64,
    pub num_tokens:            usize,
    pub correct_tokens:        usize,
    pub total_skipped_batches: usize,
}

impl TokenMetrics {
    pub fn record(&mut self, loss_sum: f64, num_tokens: usize, correct: usize) {
        self.loss += loss_sum;
        self.num_tokens += num_tokens;
        self.correct_tokens += correct;
    }

    pub fn skip_batch(&mut self) {
        self.total_skipped_batches += 1;
    }

    /// Clears the token sums. The skipped-batch count lives for the
    /// whole run.
    pub fn reset(&mut self) {
        self.loss = 0.0;
        self.num_tokens = 0;
        self.correct_tokens = 0;
    }

    pub fn report(&self) -> Report {
        let mut report = Report::default();
        if self.num_tokens > 0 {
            let n = self.num_tokens as f64;
            let loss = self.loss / n;
            let ppl = if loss > f64::ln(f64::MAX) { f64::INFINITY } else { loss.exp() };
            report.loss = Some(round_sigfigs(loss, 4));
            report.ppl = Some(round_sigfigs(ppl, 4));
            if self.correct_tokens > 0 {
                report.token_acc = Some(round_sigfigs(self.correct_tokens as f64 / n, 4));
            }
        }
        if self.total_skipped_batches > 0 {
            report.total_skipped_batches = Some(self.total_skipped_batches);
        }
        report
    }
}

// ─── Report ───────────────────────────────────────────────────────────────────
/// Snapshot of the agent's metrics. Fields are `None` when there was
/// nothing to measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub loss:                  Option<f64>,
    pub ppl:                   Option<f64>,
    pub token_acc:             Option<f64>,
    pub total_skipped_batches: Option<usize>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(v) = self.loss {
            parts.push(format!("loss={v}"));
        }
        if let Some(v) = self.ppl {
            parts.push(format!("ppl={v}"));
        }
        if let Some(v) = self.token_acc {
            parts.push(format!("token_acc={v}"));
        }
        if let Some(v) = self.total_skipped_batches {
            parts.push(format!("skipped={v}"));
        }
        if parts.is_empty() {
            f.write_str("(no tokens)")
        } else {
            f.write_str(&parts.join(" | "))
        }
    }
}

// ─── ValidationLogger ─────────────────────────────────────────────────────────
/// One row of the validation CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRow {
    pub epoch:  usize,
    pub train:  Report,
    pub valid:  Report,
    pub lr:     f64,
}

impl ValidationRow {
    /// True when this run's validation perplexity beats `best_ppl`.
    pub fn is_improvement(&self, best_ppl: f64) -> bool {
        self.valid.ppl.is_some_and(|ppl| ppl < best_ppl)
    }
}

/// Appends one row per validation to a CSV file.
pub struct ValidationLogger {
    csv_path: PathBuf,
}

impl ValidationLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let csv_path = path.into();
        if let Some(dir) = csv_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Cannot create '{}'", dir.display()))?;
            }
        }

        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "epoch,train_loss,train_ppl,valid_loss,valid_ppl,valid_token_acc,lr")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, row: &ValidationRow) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        let cell = |v: Option<f64>| v.map_or(String::new(), |v| format!("{v:.6}"));
        writeln!(
            f,
            "{},{},{},{},{},{},{:.6}",
            row.epoch,
            cell(row.train.loss),
            cell(row.train.ppl),
            cell(row.valid.loss),
            cell(row.valid.ppl),
            cell(row.valid.token_acc),
            row.lr,
        )?;

        tracing::debug!("Logged validation for epoch {}: {}", row.epoch, row.valid);
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
