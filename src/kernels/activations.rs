//! Fused activation evaluation.
//!
//! Each stage kernel applies its activation as part of the final store;
//! parametric kinds read 0-2 scalars or one per-channel vector from the
//! stage's canonicalised parameter buffer.

/// Closed set of activation functions a stage may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    Relu,
    /// `max(0, x) + alpha * min(0, x)`; alpha broadcast per channel.
    LeakyRelu,
    /// Clamp to `[params[0], params[1]]`.
    RestrictRange,
    /// Leaky relu with a per-channel slope vector.
    Prelu,
    /// `x >= 0 ? x : alpha * (exp(x) - 1)`.
    Elu,
    /// `x * max(min(x, shift) + shift, 0) * scale`.
    Hswish,
    /// `x > threshold ? x : x * tanh(ln(1 + exp(x)))`.
    Mish,
    /// `clamp(x * scale + shift, 0, 1)`.
    HardSigmoid,
    /// `x / (1 + exp(-slope * x))`.
    Swish,
    /// Exact erf-based GELU.
    Gelu,
}

impl ActivationKind {
    /// Whether the canonical parameter buffer is one value per channel.
    pub fn per_channel(self) -> bool {
        matches!(self, ActivationKind::LeakyRelu | ActivationKind::Prelu)
    }

    /// Evaluate on one value. `channel` indexes per-channel parameter
    /// vectors and is ignored by scalar-parameter kinds.
    #[inline(always)]
    pub fn apply(self, value: f32, params: &[f32], channel: usize) -> f32 {
        match self {
            ActivationKind::Identity => value,
            ActivationKind::Relu => value.max(0.0),
            ActivationKind::LeakyRelu | ActivationKind::Prelu => {
                value.max(0.0) + params[channel] * value.min(0.0)
            }
            ActivationKind::RestrictRange => value.max(params[0]).min(params[1]),
            ActivationKind::Elu => {
                if value >= 0.0 {
                    value
                } else {
                    params[0] * (value.exp() - 1.0)
                }
            }
            ActivationKind::Hswish => {
                (value.min(params[0]) + params[0]).max(0.0) * params[1] * value
            }
            ActivationKind::Mish => {
                if value > params[0] {
                    value
                } else {
                    value * value.exp().ln_1p().tanh()
                }
            }
            ActivationKind::HardSigmoid => (value * params[0] + params[1]).clamp(0.0, 1.0),
            ActivationKind::Swish => value / (1.0 + (-params[0] * value).exp()),
            ActivationKind::Gelu => {
                value * (libm::erff(value * std::f32::consts::FRAC_1_SQRT_2) + 1.0) * 0.5
            }
        }
    }

    /// Canonicalise caller parameters for one stage: per-channel kinds
    /// expand to `dst_c` values, everything else stores two scalars.
    pub(crate) fn canonical_params(self, src: &[f32], dst_c: usize) -> Vec<f32> {
        match self {
            ActivationKind::Identity => vec![-f32::MAX, f32::MAX],
            ActivationKind::Relu => vec![0.0, f32::MAX],
            ActivationKind::LeakyRelu => vec![src[0]; dst_c],
            ActivationKind::Prelu => src[..dst_c].to_vec(),
            ActivationKind::RestrictRange
            | ActivationKind::Hswish
            | ActivationKind::HardSigmoid => vec![src[0], src[1]],
            ActivationKind::Elu | ActivationKind::Mish | ActivationKind::Swish => {
                vec![src[0], 0.0]
            }
            ActivationKind::Gelu => vec![0.0, 0.0],
        }
    }
}
