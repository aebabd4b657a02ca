//! Parameterized latency distributions for network connections.

use rand::Rng;
use rand_distr::{Distribution, LogNormal};

/// A shifted lognormal latency distribution in milliseconds, parameterized by
/// `shape` (sigma), `loc` (shift), and `scale` (exp of the underlying mean).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyDistribution {
    shape: f64,
    loc: f64,
    scale: f64,
}

impl LatencyDistribution {
    /// Creates a lognormal distribution from its shape, shift, and scale.
    pub fn lognorm(shape: f64, loc: f64, scale: f64) -> Self {
        assert!(
            shape > 0.0 && scale > 0.0,
            "lognormal shape and scale must be positive"
        );
        Self { shape, loc, scale }
    }

    /// Draws a latency sample.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let dist =
            LogNormal::new(self.scale.ln(), self.shape).expect("parameters validated in `lognorm`");
        self.loc + dist.sample(rng)
    }

    /// The most likely latency, used for deterministic route caching.
    pub fn mode(&self) -> f64 {
        (self.scale.ln() - self.shape * self.shape).exp() + self.loc
    }

    /// The expected latency.
    pub fn mean(&self) -> f64 {
        (self.scale.ln() + self.shape * self.shape / 2.0).exp() + self.loc
    }
}

/// Wired LAN latency.
pub fn lan() -> LatencyDistribution {
    LatencyDistribution::lognorm(0.25, 0.35, 0.16)
}

/// 802.11 WLAN latency.
pub fn wlan() -> LatencyDistribution {
    LatencyDistribution::lognorm(0.635, 1.18, 3.27)
}

/// Last-mile latency of a business fiber/DSL uplink.
pub fn business_isp() -> LatencyDistribution {
    LatencyDistribution::lognorm(0.87, 5.95, 1.21)
}

/// Last-mile latency of an LTE uplink.
pub fn mobile_isp() -> LatencyDistribution {
    LatencyDistribution::lognorm(0.49, 16.2, 8.02)
}
