//! Weighted traffic profiles.
//!
//! A profile models a reference traffic class as weighted packet-size and
//! inter-frame delay distributions. Sampling is weighted without
//! normalization: a uniform draw is scanned against cumulative weights and
//! the first bucket to cover it wins. Control frames received from the peer
//! install single-shot overrides that take precedence over sampling.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};

/// A weighted packet-size bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeBucket {
    /// Target payload size in bytes.
    pub size: usize,
    /// Relative weight; weights need not sum to 1.0.
    pub weight: f64,
}

/// A weighted inter-frame delay bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayBucket {
    /// Delay before the next frame.
    pub delay: Duration,
    /// Relative weight; weights need not sum to 1.0.
    pub weight: f64,
}

#[derive(Debug, Default)]
struct Overrides {
    next_packet_size: usize,
    next_delay: Duration,
}

/// Packet-size and timing distributions for one traffic class.
///
/// Each session owns its own profile so that peer-supplied overrides do not
/// leak between sessions.
#[derive(Debug)]
pub struct TrafficProfile {
    name: String,
    packet_sizes: Vec<SizeBucket>,
    delays: Vec<DelayBucket>,
    overrides: Mutex<Overrides>,
}

impl Clone for TrafficProfile {
    /// Cloning copies the distributions but resets any pending overrides.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            packet_sizes: self.packet_sizes.clone(),
            delays: self.delays.clone(),
            overrides: Mutex::new(Overrides::default()),
        }
    }
}

impl TrafficProfile {
    /// Create a profile from explicit distributions.
    pub fn new(
        name: impl Into<String>,
        packet_sizes: Vec<SizeBucket>,
        delays: Vec<DelayBucket>,
    ) -> Self {
        Self {
            name: name.into(),
            packet_sizes,
            delays,
            overrides: Mutex::new(Overrides::default()),
        }
    }

    /// Resolve a policy tag to a built-in profile.
    ///
    /// Recognized tags: `http2-api`, `mimic-http2-api`, `youtube`, `zoom`.
    /// Unknown tags resolve to `http2-api` for compatibility.
    pub fn from_policy(policy: &str) -> Self {
        match policy {
            "youtube" => Self::new(
                "youtube",
                vec![
                    SizeBucket { size: 1400, weight: 0.35 },
                    SizeBucket { size: 1200, weight: 0.25 },
                    SizeBucket { size: 1000, weight: 0.2 },
                    SizeBucket { size: 800, weight: 0.1 },
                    SizeBucket { size: 600, weight: 0.1 },
                ],
                vec![
                    DelayBucket { delay: Duration::from_millis(8), weight: 0.30 },
                    DelayBucket { delay: Duration::from_millis(12), weight: 0.25 },
                    DelayBucket { delay: Duration::from_millis(16), weight: 0.20 },
                    DelayBucket { delay: Duration::from_millis(20), weight: 0.15 },
                    DelayBucket { delay: Duration::from_millis(30), weight: 0.10 },
                ],
            ),
            "zoom" => Self::new(
                "zoom",
                vec![
                    SizeBucket { size: 500, weight: 0.30 },
                    SizeBucket { size: 600, weight: 0.40 },
                    SizeBucket { size: 700, weight: 0.30 },
                ],
                vec![
                    DelayBucket { delay: Duration::from_millis(30), weight: 0.40 },
                    DelayBucket { delay: Duration::from_millis(40), weight: 0.40 },
                    DelayBucket { delay: Duration::from_millis(50), weight: 0.20 },
                ],
            ),
            "mimic-http2-api" => {
                let mut profile = Self::from_policy("http2-api");
                profile.name = "mimic-http2-api".into();
                profile
            }
            // http2-api, and the compatibility default for unknown tags
            _ => Self::new(
                "http2-api",
                vec![
                    SizeBucket { size: 200, weight: 0.20 },
                    SizeBucket { size: 500, weight: 0.30 },
                    SizeBucket { size: 1000, weight: 0.30 },
                    SizeBucket { size: 1400, weight: 0.20 },
                ],
                vec![
                    DelayBucket { delay: Duration::from_millis(5), weight: 0.30 },
                    DelayBucket { delay: Duration::from_millis(10), weight: 0.40 },
                    DelayBucket { delay: Duration::from_millis(15), weight: 0.30 },
                ],
            ),
        }
    }

    /// Build an empirical profile from captured packet sizes and delays.
    ///
    /// Distinct positive samples become buckets sorted ascending, weighted
    /// by relative frequency. Fails when either sample set is empty.
    pub fn from_observations(
        name: impl Into<String>,
        packet_sizes: &[usize],
        delays: &[Duration],
    ) -> Result<Self> {
        if packet_sizes.is_empty() || delays.is_empty() {
            return Err(Error::malformed("insufficient samples for profile"));
        }
        Ok(Self::new(
            name,
            size_distribution(packet_sizes),
            delay_distribution(delays),
        ))
    }

    /// Profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The packet-size distribution.
    pub fn packet_sizes(&self) -> &[SizeBucket] {
        &self.packet_sizes
    }

    /// The delay distribution.
    pub fn delays(&self) -> &[DelayBucket] {
        &self.delays
    }

    /// Next target packet size: a pending override if set, else a weighted
    /// sample from the distribution.
    pub fn next_packet_size(&self) -> usize {
        let mut overrides = self.overrides.lock();
        if overrides.next_packet_size > 0 {
            return std::mem::take(&mut overrides.next_packet_size);
        }
        weighted_pick(&self.packet_sizes, |b| b.weight)
            .map(|b| b.size)
            .unwrap_or(0)
    }

    /// Next inter-frame delay: a pending override if set, else a weighted
    /// sample from the distribution.
    pub fn next_delay(&self) -> Duration {
        let mut overrides = self.overrides.lock();
        if !overrides.next_delay.is_zero() {
            return std::mem::take(&mut overrides.next_delay);
        }
        weighted_pick(&self.delays, |b| b.weight)
            .map(|b| b.delay)
            .unwrap_or(Duration::ZERO)
    }

    /// Override the next packet size. Non-positive values are ignored.
    pub fn set_next_packet_size(&self, size: usize) {
        if size == 0 {
            return;
        }
        self.overrides.lock().next_packet_size = size;
    }

    /// Override the next delay. Zero delays are ignored.
    pub fn set_next_delay(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.overrides.lock().next_delay = delay;
    }
}

/// Weighted sampling without normalization: draw u in [0,1), return the
/// first bucket whose cumulative weight covers it, else the last.
fn weighted_pick<T>(buckets: &[T], weight: impl Fn(&T) -> f64) -> Option<&T> {
    if buckets.is_empty() {
        return None;
    }
    let pick: f64 = rand::thread_rng().gen();
    let mut sum = 0.0;
    for bucket in buckets {
        sum += weight(bucket);
        if pick <= sum {
            return Some(bucket);
        }
    }
    buckets.last()
}

fn size_distribution(values: &[usize]) -> Vec<SizeBucket> {
    let mut freq = std::collections::BTreeMap::new();
    for &v in values {
        if v > 0 {
            *freq.entry(v).or_insert(0u64) += 1;
        }
    }
    let total: u64 = freq.values().sum();
    freq.into_iter()
        .map(|(size, count)| SizeBucket {
            size,
            weight: count as f64 / total as f64,
        })
        .collect()
}

fn delay_distribution(values: &[Duration]) -> Vec<DelayBucket> {
    let mut freq = std::collections::BTreeMap::new();
    for &v in values {
        if !v.is_zero() {
            *freq.entry(v).or_insert(0u64) += 1;
        }
    }
    let total: u64 = freq.values().sum();
    freq.into_iter()
        .map(|(delay, count)| DelayBucket {
            delay,
            weight: count as f64 / total as f64,
        })
        .collect()
}
