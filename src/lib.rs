//! Cache-aware fused separable convolution for CPU inference.
//!
//! A pipeline chains an optional pointwise expansion, a depthwise
//! convolution and an optional pointwise projection, and runs them as
//! one fused loop: the mid channels are split into cache-sized
//! super-tiles and intermediate rows flow through small ring buffers
//! instead of full tensors. Kernels are bound once per pipeline against
//! a detected (or requested) capability tier, and an optional
//! compressed bfloat16 path halves inter-stage and pointwise-weight
//! bandwidth.
//!
//! ```no_run
//! use sepconv::{
//!     ActivationKind, ConvShape, EngineConfig, MergedConvolution, MergedParam, Precision,
//! };
//!
//! let conv = vec![
//!     ConvShape::new(16, 28, 28, 64, (1, 1), (1, 1), (0, 0, 0, 0), 1, ActivationKind::Relu),
//!     ConvShape::new(64, 28, 28, 64, (3, 3), (1, 1), (1, 1, 1, 1), 64, ActivationKind::Relu),
//!     ConvShape::new(64, 28, 28, 16, (1, 1), (1, 1), (0, 0, 0, 0), 1, ActivationKind::Identity),
//! ];
//! let param = MergedParam::new(1, conv, true, Precision::F32);
//! let mut pipe = MergedConvolution::init(param, &EngineConfig::default()).unwrap();
//! # let (w0, w1, w2): (Vec<f32>, Vec<f32>, Vec<f32>) = unimplemented!();
//! pipe.set_params(&[&w0, &w1, &w2], &[&[], &[], &[]], &[&[], &[], &[]]);
//! let src = vec![0f32; pipe.src_dims().elements()];
//! let mut dst = vec![0f32; pipe.dst_dims().elements()];
//! pipe.forward(&src, None, &mut dst);
//! ```

mod alg;
pub mod caps;
pub mod kernels;
pub mod merged;
pub mod param;
pub mod tensor;

pub use caps::{detect_tier, CacheInfo, CapTier, EngineConfig, PerfSink, Precision};
pub use kernels::activations::ActivationKind;
pub use merged::{MergedConvolution, Scratch};
pub use param::{ConvShape, InitError, MergedParam, Topology};
pub use tensor::NhwcDims;
