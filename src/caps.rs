//! Runtime capability detection and execution configuration.
//!
//! A pipeline binds its kernels once, at construction, against a
//! [`CapTier`]; nothing in the hot path re-probes CPU features.

use std::sync::OnceLock;
use std::time::Duration;

/// CPU features relevant to kernel-tier selection, detected once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub sse41: bool,
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
    pub neon: bool,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Detect the current CPU's capabilities (cached after the first call).
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    sse41: is_x86_feature_detected!("sse4.1"),
                    avx2: is_x86_feature_detected!("avx2"),
                    avx512f: is_x86_feature_detected!("avx512f"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }
            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    sse41: false,
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: true,
                }
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    sse41: false,
                    avx2: false,
                    avx512f: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }
}

/// Hardware capability tier a kernel set targets.
///
/// Tiers are ordered: every tier can also run everything a lower tier can,
/// and dispatch falls back downward when a tier is not legal for a given
/// shape/precision combination. `Scalar` is always legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapTier {
    /// Portable baseline, one channel per accumulator.
    Scalar,
    /// 128-bit vector width (SSE / NEON class), 4 lanes.
    V128,
    /// 256-bit vector width (AVX2 class), 8 lanes.
    V256,
    /// 512-bit vector width (AVX-512 class), 16 lanes.
    V512,
    /// Matrix-tile tier: pointwise stages run through a blocked GEMM,
    /// depthwise runs at 16 lanes. Only legal for f32 1x1 geometry.
    MatrixTile,
}

impl CapTier {
    /// Channel lane count (`miC`) of this tier.
    pub fn lanes(self) -> usize {
        match self {
            CapTier::Scalar => 1,
            CapTier::V128 => 4,
            CapTier::V256 => 8,
            CapTier::V512 | CapTier::MatrixTile => 16,
        }
    }

    /// Next tier down the fallback chain.
    pub fn fallback(self) -> Option<CapTier> {
        match self {
            CapTier::Scalar => None,
            CapTier::V128 => Some(CapTier::Scalar),
            CapTier::V256 => Some(CapTier::V128),
            CapTier::V512 => Some(CapTier::V256),
            CapTier::MatrixTile => Some(CapTier::V512),
        }
    }
}

/// Most capable tier the current CPU supports.
pub fn detect_tier() -> CapTier {
    let caps = SimdCapability::detect();
    if caps.avx512f {
        CapTier::MatrixTile
    } else if caps.avx2 {
        CapTier::V256
    } else if caps.sse41 || caps.neon {
        CapTier::V128
    } else {
        CapTier::Scalar
    }
}

/// Cache capacities driving the tiling planner.
#[derive(Debug, Clone, Copy)]
pub struct CacheInfo {
    /// L1 data cache size in bytes.
    pub l1: usize,
    /// L2 cache size in bytes.
    pub l2: usize,
    /// L3 (or last-level) cache size in bytes.
    pub l3: usize,
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self {
            l1: 32 * 1024,
            l2: 256 * 1024,
            l3: 8 * 1024 * 1024,
        }
    }
}

/// Numeric representation of inter-stage activations and pointwise weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Full 32-bit floats everywhere.
    F32,
    /// Compressed bfloat16 activations between stages and bfloat16
    /// pointwise weights. Lossy: the mantissa is truncated to 8 bits.
    Bf16,
}

impl Precision {
    /// Bytes per compressed-path element.
    pub(crate) fn elem_bytes(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::Bf16 => 2,
        }
    }
}

/// Sink for per-stage wall-clock measurements of a `forward` call.
///
/// When no sink is installed the engine takes no timestamps at all.
pub trait PerfSink {
    fn record(&self, stage: &'static str, elapsed: Duration);
}

/// Execution environment a pipeline is constructed against.
pub struct EngineConfig {
    /// Capability tier to bind kernels for; `None` auto-detects.
    pub tier: Option<CapTier>,
    /// Cache capacities used by the tiling planner.
    pub cache: CacheInfo,
    /// Optional per-stage timing sink.
    pub perf: Option<std::sync::Arc<dyn PerfSink + Send + Sync>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier: None,
            cache: CacheInfo::default(),
            perf: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_lanes_monotonic() {
        let tiers = [
            CapTier::Scalar,
            CapTier::V128,
            CapTier::V256,
            CapTier::V512,
            CapTier::MatrixTile,
        ];
        for w in tiers.windows(2) {
            assert!(w[0].lanes() <= w[1].lanes());
        }
    }

    #[test]
    fn test_fallback_terminates_at_scalar() {
        let mut tier = CapTier::MatrixTile;
        let mut steps = 0;
        while let Some(next) = tier.fallback() {
            tier = next;
            steps += 1;
            assert!(steps < 8);
        }
        assert_eq!(tier, CapTier::Scalar);
    }

    #[test]
    fn test_detect_is_stable() {
        assert_eq!(SimdCapability::detect(), SimdCapability::detect());
    }
}
