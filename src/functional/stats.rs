//! Statistics of element error indicators.
use log::info;
use serde::Serialize;

use crate::comm::Comm;

const NUM_BINS: usize = 30;

/// Log-scale statistics of a set of element error indicators
#[derive(Clone, Debug, Serialize)]
pub struct ErrorStats {
    /// Mean of `log(error)`
    pub mean: f64,
    /// Standard deviation of `log(error)`
    pub stddev: f64,
    /// Logarithmic bin boundaries, `10^-15 .. 10^0`
    pub bin_bounds: Vec<f64>,
    /// Indicator counts; the first and last entries are the outliers below
    /// and above the bounded range
    pub bins: Vec<u64>,
}

impl ErrorStats {
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap()
    }
}

/// Histogram the element error indicators across all processes
pub fn error_stats<C: Comm>(comm: &C, error: &[f64]) -> ErrorStats {
    let mut acc = [error.len() as f64, 0.0];
    for &e in error {
        acc[1] += e.ln();
    }
    comm.allreduce_sum(&mut acc);
    let ntotal = acc[0];
    let mean = acc[1] / ntotal;

    let mut dev = [0.0];
    for &e in error {
        let d = e.ln() - mean;
        dev[0] += d * d;
    }
    comm.allreduce_sum(&mut dev);
    let stddev = (dev[0] / (ntotal - 1.0).max(1.0)).sqrt();

    let low = -15.0;
    let high = 0.0;
    let bin_bounds: Vec<f64> = (0..=NUM_BINS)
        .map(|k| 10f64.powf(low + k as f64 * (high - low) / NUM_BINS as f64))
        .collect();

    let mut bins = vec![0.0; NUM_BINS + 2];
    for &e in error {
        if e <= bin_bounds[0] {
            bins[0] += 1.0;
        } else if e >= bin_bounds[NUM_BINS] {
            bins[NUM_BINS + 1] += 1.0;
        } else {
            for j in 0..NUM_BINS {
                if e >= bin_bounds[j] && e < bin_bounds[j + 1] {
                    bins[j + 1] += 1.0;
                }
            }
        }
    }
    comm.allreduce_sum(&mut bins);

    if comm.rank() == 0 {
        info!("Error indicators: log(mean) = {mean:.2e}, log(stddev) = {stddev:.2e}");
    }

    ErrorStats {
        mean,
        stddev,
        bin_bounds,
        bins: bins.iter().map(|&b| b as u64).collect(),
    }
}
