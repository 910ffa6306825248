//! Stage kernels and their dispatch layer.
//!
//! Kernels are portable Rust, monomorphised over the element type of the
//! compressed path and over `F`, the channel lane width of the bound
//! capability tier. Channel loops run in blocks of `F` with `[f32; F]`
//! accumulators and a masked tail, which is what the optimiser needs to
//! emit vector code for the wider tiers.

pub mod activations;
pub mod convert;
pub mod depthwise;
pub mod gemm;
pub mod input;
pub mod output;

use crate::param::ConvShape;
use activations::ActivationKind;
use half::bf16;

/// Element of an inter-stage buffer or pointwise weight array.
pub trait Elem: Copy + Default + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Elem for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Elem for bf16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// Row-addressed view geometry, shared by ring buffers and flat tensors.
///
/// A ring of `buf_h` rows (power of two) wraps through `mask = buf_h - 1`;
/// flat tensors use `mask = usize::MAX` so the row index passes through.
/// `off` shifts every pixel by a fixed channel offset, which is how a
/// kernel addresses one channel super-tile inside a full tensor row.
#[derive(Debug, Clone, Copy)]
pub struct RowGeo {
    pub mask: usize,
    /// Elements per row.
    pub row: usize,
    /// Elements per pixel.
    pub pix: usize,
    /// Base element offset within a pixel.
    pub off: usize,
}

impl RowGeo {
    pub fn ring(buf_h: usize, width: usize, channels: usize) -> Self {
        debug_assert!(buf_h.is_power_of_two());
        Self {
            mask: buf_h - 1,
            row: width * channels,
            pix: channels,
            off: 0,
        }
    }

    pub fn flat(width: usize, channels: usize, off: usize) -> Self {
        Self {
            mask: usize::MAX,
            row: width * channels,
            pix: channels,
            off,
        }
    }

    /// Element index of pixel `(y, x)`.
    #[inline(always)]
    pub fn at(&self, y: usize, x: usize) -> usize {
        (y & self.mask) * self.row + x * self.pix + self.off
    }

    /// Ring height; meaningless for flat views.
    pub fn buf_h(&self) -> usize {
        self.mask.wrapping_add(1)
    }
}

/// Borrowed input rows in either precision.
#[derive(Clone, Copy)]
pub enum Rows<'a> {
    F32(&'a [f32]),
    Bf16(&'a [bf16]),
}

/// Mutable output rows in either precision.
pub enum RowsMut<'a> {
    F32(&'a mut [f32]),
    Bf16(&'a mut [bf16]),
}

/// Borrowed pointwise weights in either precision.
#[derive(Clone, Copy)]
pub enum WeightRef<'a> {
    F32(&'a [f32]),
    Bf16(&'a [bf16]),
}

/// Per-super-tile accumulation control for the projection stage.
///
/// `zero` starts accumulators from zero instead of reading partial sums
/// back from the destination; `last` adds the bias and applies the
/// activation at store time. A residual input is pre-copied into the
/// destination by the orchestrator, which then simply clears `zero`.
#[derive(Debug, Clone, Copy)]
pub struct TileFlags {
    pub zero: bool,
    pub last: bool,
}

/// Depthwise specialisation selected at bind time from the stage geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwKind {
    K3x3,
    K7x7,
    General,
}

impl DwKind {
    pub fn select(shape: &ConvShape) -> DwKind {
        let square = shape.kernel_y == shape.kernel_x && shape.stride_y == shape.stride_x;
        let undilated = shape.dilation_y == 1 && shape.dilation_x == 1;
        let pads = [shape.pad_y, shape.pad_x, shape.pad_h, shape.pad_w];
        if square && undilated && shape.kernel_y == 3 && shape.stride_y <= 2 {
            if pads.iter().all(|&p| p <= 1) {
                return DwKind::K3x3;
            }
        }
        if square && undilated && shape.kernel_y == 7 && shape.stride_y <= 2 {
            if pads.iter().all(|&p| p == 3) {
                return DwKind::K7x7;
            }
        }
        DwKind::General
    }
}

macro_rules! lane_dispatch {
    ($lanes:expr, $m:ident :: $f:ident, ($($t:ty),*), ($($args:expr),*)) => {
        match $lanes {
            1 => $m::$f::<$($t,)* 1>($($args),*),
            4 => $m::$f::<$($t,)* 4>($($args),*),
            8 => $m::$f::<$($t,)* 8>($($args),*),
            16 => $m::$f::<$($t,)* 16>($($args),*),
            _ => unreachable!("unsupported lane width"),
        }
    };
}

/// Run the expansion stage for one channel super-tile and row window.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_input(
    lanes: usize,
    src: Rows,
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y_beg: usize,
    y_end: usize,
    weights: WeightRef,
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
) {
    match (src, weights) {
        (Rows::F32(s), WeightRef::F32(w)) => lane_dispatch!(
            lanes,
            input::convolve,
            (f32),
            (s, src_geo, shape, tile_c, y_beg, y_end, w, bias, act, params, dst, dst_geo)
        ),
        (Rows::Bf16(s), WeightRef::Bf16(w)) => lane_dispatch!(
            lanes,
            input::convolve,
            (bf16),
            (s, src_geo, shape, tile_c, y_beg, y_end, w, bias, act, params, dst, dst_geo)
        ),
        _ => unreachable!("input stage precision mismatch"),
    }
}

/// Run the depthwise stage for one channel super-tile and row window.
/// The source is always f32 (raw input or the expansion ring); the
/// destination precision follows the pipeline's compressed path.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_depthwise(
    lanes: usize,
    kind: DwKind,
    src: &[f32],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[f32],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: RowsMut,
    dst_geo: RowGeo,
) {
    match dst {
        RowsMut::F32(d) => match kind {
            DwKind::K3x3 => lane_dispatch!(
                lanes,
                depthwise::convolve3x3,
                (f32),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
            DwKind::K7x7 => lane_dispatch!(
                lanes,
                depthwise::convolve7x7,
                (f32),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
            DwKind::General => lane_dispatch!(
                lanes,
                depthwise::convolve,
                (f32),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
        },
        RowsMut::Bf16(d) => match kind {
            DwKind::K3x3 => lane_dispatch!(
                lanes,
                depthwise::convolve3x3,
                (bf16),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
            DwKind::K7x7 => lane_dispatch!(
                lanes,
                depthwise::convolve7x7,
                (bf16),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
            DwKind::General => lane_dispatch!(
                lanes,
                depthwise::convolve,
                (bf16),
                (src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, d, dst_geo)
            ),
        },
    }
}

/// Run the projection stage for one channel super-tile and row window.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_output(
    lanes: usize,
    src: Rows,
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    w_off: usize,
    y_beg: usize,
    y_end: usize,
    weights: WeightRef,
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
    flags: TileFlags,
) {
    match (src, weights) {
        (Rows::F32(s), WeightRef::F32(w)) => lane_dispatch!(
            lanes,
            output::project,
            (f32),
            (
                s, src_geo, shape, tile_c, w_off, y_beg, y_end, w, bias, act, params, dst, dst_geo,
                flags
            )
        ),
        (Rows::Bf16(s), WeightRef::Bf16(w)) => lane_dispatch!(
            lanes,
            output::project,
            (bf16),
            (
                s, src_geo, shape, tile_c, w_off, y_beg, y_end, w, bias, act, params, dst, dst_geo,
                flags
            )
        ),
        _ => unreachable!("output stage precision mismatch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_geometry_wraps() {
        let g = RowGeo::ring(4, 3, 2);
        assert_eq!(g.at(0, 0), 0);
        assert_eq!(g.at(4, 0), 0);
        assert_eq!(g.at(5, 2), g.at(1, 2));
        assert_eq!(g.buf_h(), 4);
    }

    #[test]
    fn test_flat_geometry_with_channel_offset() {
        let g = RowGeo::flat(5, 8, 3);
        assert_eq!(g.at(0, 0), 3);
        assert_eq!(g.at(2, 4), 2 * 40 + 32 + 3);
    }

    #[test]
    fn test_dw_kind_selection() {
        let mut s = ConvShape::new(
            8,
            10,
            10,
            8,
            (3, 3),
            (1, 1),
            (1, 1, 1, 1),
            8,
            ActivationKind::Identity,
        );
        assert_eq!(DwKind::select(&s), DwKind::K3x3);
        s.dilation_x = 2;
        assert_eq!(DwKind::select(&s), DwKind::General);
        let s7 = ConvShape::new(
            8,
            14,
            14,
            8,
            (7, 7),
            (2, 2),
            (3, 3, 3, 3),
            8,
            ActivationKind::Identity,
        );
        assert_eq!(DwKind::select(&s7), DwKind::K7x7);
        let s5 = ConvShape::new(
            8,
            10,
            10,
            8,
            (5, 5),
            (1, 1),
            (2, 2, 2, 2),
            8,
            ActivationKind::Identity,
        );
        assert_eq!(DwKind::select(&s5), DwKind::General);
    }

    #[test]
    fn test_elem_roundtrip() {
        assert_eq!(<f32 as Elem>::from_f32(1.5).to_f32(), 1.5);
        let v = <bf16 as Elem>::from_f32(1.5);
        assert_eq!(v.to_f32(), 1.5);
    }
}
