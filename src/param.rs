//! Pipeline and stage descriptors.

use crate::caps::Precision;
use crate::kernels::activations::ActivationKind;
use thiserror::Error;

/// Geometry and activation of one convolution stage.
///
/// `dst_h`/`dst_w` are derived from the source extent and the kernel
/// geometry at construction and are not independently settable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvShape {
    pub src_c: usize,
    pub src_h: usize,
    pub src_w: usize,
    pub dst_c: usize,
    pub dst_h: usize,
    pub dst_w: usize,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    /// Top / left / bottom / right padding.
    pub pad_y: usize,
    pub pad_x: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub group: usize,
    pub activation: ActivationKind,
}

impl ConvShape {
    /// Build a stage descriptor; output extent is computed from the
    /// convolution geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src_c: usize,
        src_h: usize,
        src_w: usize,
        dst_c: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        pads: (usize, usize, usize, usize),
        group: usize,
        activation: ActivationKind,
    ) -> Self {
        let (kernel_y, kernel_x) = kernel;
        let (stride_y, stride_x) = stride;
        let (pad_y, pad_x, pad_h, pad_w) = pads;
        let dst_h = (src_h + pad_y + pad_h).saturating_sub(kernel_y) / stride_y + 1;
        let dst_w = (src_w + pad_x + pad_w).saturating_sub(kernel_x) / stride_x + 1;
        Self {
            src_c,
            src_h,
            src_w,
            dst_c,
            dst_h,
            dst_w,
            kernel_y,
            kernel_x,
            stride_y,
            stride_x,
            dilation_y: 1,
            dilation_x: 1,
            pad_y,
            pad_x,
            pad_h,
            pad_w,
            group,
            activation,
        }
    }

    /// Pointwise 1x1, stride 1, unpadded.
    pub fn is_1x1(&self) -> bool {
        self.kernel_y == 1
            && self.kernel_x == 1
            && self.stride_y == 1
            && self.stride_x == 1
            && self.pad_y == 0
            && self.pad_x == 0
            && self.pad_h == 0
            && self.pad_w == 0
    }

    /// One input channel per output channel.
    pub fn is_depthwise(&self) -> bool {
        self.group == self.src_c && self.group == self.dst_c && self.group > 0
    }

    /// Weight element count in the caller's flat layout.
    pub fn weight_len(&self) -> usize {
        self.kernel_y * self.kernel_x * self.src_c * self.dst_c / self.group
    }
}

/// Stage ordering of a merged pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// expand -> depthwise -> project
    Cdc,
    /// expand -> depthwise
    Cd,
    /// depthwise -> project
    Dc,
}

/// Construction-time rejection reasons. After a successful `init` the
/// pipeline is infallible for its lifetime.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("pipeline must have 2 or 3 stages, got {0}")]
    StageCount(usize),
    #[error("batch size must be nonzero")]
    ZeroBatch,
    #[error("stage {0}: destination channels {1} != stage {2} source channels {3}")]
    ChannelMismatch(usize, usize, usize, usize),
    #[error("stage {0}: spatial extent {1}x{2} does not feed stage {3} ({4}x{5})")]
    SpatialMismatch(usize, usize, usize, usize, usize, usize),
    #[error("stage {0}: group {1} is neither pointwise nor depthwise for {2} -> {3} channels")]
    BadGroup(usize, usize, usize, usize),
    #[error("pipeline needs exactly one depthwise stage between pointwise stages")]
    BadTopology,
    #[error("projection stage must be a 1x1 stride-1 unpadded convolution")]
    BadProjection,
    #[error("stage {0}: zero-sized kernel, stride or extent")]
    DegenerateShape(usize),
    #[error("residual add requires a projection stage and matching input/output shapes")]
    BadResidual,
}

/// Full pipeline descriptor: 2-3 chained stages, batch size, residual flag
/// and the requested precision of the inter-stage buffers.
#[derive(Debug, Clone)]
pub struct MergedParam {
    pub batch: usize,
    pub conv: Vec<ConvShape>,
    /// Accumulate the pipeline's input into its final output.
    pub add: bool,
    pub precision: Precision,
}

impl MergedParam {
    pub fn new(batch: usize, conv: Vec<ConvShape>, add: bool, precision: Precision) -> Self {
        Self {
            batch,
            conv,
            add,
            precision,
        }
    }

    /// Classify the stage ordering; only meaningful after [`validate`].
    pub fn topology(&self) -> Topology {
        if self.conv[0].group != 1 {
            Topology::Dc
        } else if self.conv.len() == 3 {
            Topology::Cdc
        } else {
            Topology::Cd
        }
    }

    /// Reject malformed pipelines. This is the only user-visible failure
    /// path; everything past construction assumes these invariants.
    pub fn validate(&self) -> Result<(), InitError> {
        let n = self.conv.len();
        if !(2..=3).contains(&n) {
            return Err(InitError::StageCount(n));
        }
        if self.batch == 0 {
            return Err(InitError::ZeroBatch);
        }
        for (i, c) in self.conv.iter().enumerate() {
            if c.kernel_y == 0
                || c.kernel_x == 0
                || c.stride_y == 0
                || c.stride_x == 0
                || c.src_c == 0
                || c.dst_c == 0
                || c.src_h == 0
                || c.src_w == 0
                || c.dst_h == 0
                || c.dst_w == 0
            {
                return Err(InitError::DegenerateShape(i));
            }
            if c.group != 1 && !c.is_depthwise() {
                return Err(InitError::BadGroup(i, c.group, c.src_c, c.dst_c));
            }
        }
        for i in 0..n - 1 {
            let (a, b) = (&self.conv[i], &self.conv[i + 1]);
            if a.dst_c != b.src_c {
                return Err(InitError::ChannelMismatch(i, a.dst_c, i + 1, b.src_c));
            }
            if a.dst_h != b.src_h || a.dst_w != b.src_w {
                return Err(InitError::SpatialMismatch(
                    i, a.dst_h, a.dst_w, i + 1, b.src_h, b.src_w,
                ));
            }
        }
        let dw_count = self.conv.iter().filter(|c| c.group != 1).count();
        if dw_count != 1 {
            return Err(InitError::BadTopology);
        }
        match self.topology() {
            Topology::Cdc => {
                if !(self.conv[1].is_depthwise() && self.conv[2].group == 1) {
                    return Err(InitError::BadTopology);
                }
                if !self.conv[2].is_1x1() {
                    return Err(InitError::BadProjection);
                }
            }
            Topology::Cd => {
                if !self.conv[1].is_depthwise() {
                    return Err(InitError::BadTopology);
                }
            }
            Topology::Dc => {
                if !(self.conv[0].is_depthwise() && self.conv[1].group == 1) {
                    return Err(InitError::BadTopology);
                }
                if !self.conv[1].is_1x1() {
                    return Err(InitError::BadProjection);
                }
            }
        }
        if self.add {
            let first = &self.conv[0];
            let last = self.conv.last().unwrap();
            let ends_in_projection = last.group == 1 && last.is_1x1();
            if !ends_in_projection
                || first.src_c != last.dst_c
                || first.src_h != last.dst_h
                || first.src_w != last.dst_w
            {
                return Err(InitError::BadResidual);
            }
        }
        Ok(())
    }

    /// The depthwise stage's descriptor.
    pub(crate) fn depthwise(&self) -> &ConvShape {
        self.conv.iter().find(|c| c.group != 1).unwrap()
    }
}
