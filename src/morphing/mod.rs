//! Traffic morphing engine.
//!
//! Outbound DATA frames are reshaped to match a reference traffic class:
//!
//! 1. **Size shaping**: payloads are chunked to sizes drawn from a weighted
//!    packet-size distribution
//! 2. **Timing shaping**: inter-frame delays are drawn from a weighted delay
//!    distribution and realized by sleeping between frames
//! 3. **Control hints**: PADDING/TIMING control frames carry the sampled
//!    values in-band so the peer can fold them into its own shaping
//!
//! Morphing quality is measured with the two-sample Kolmogorov-Smirnov
//! statistic over observed versus reference distributions.

mod profile;
mod stats;

pub use profile::{DelayBucket, SizeBucket, TrafficProfile};
pub use stats::kolmogorov_smirnov;
