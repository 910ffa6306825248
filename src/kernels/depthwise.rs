//! Depthwise stage: one filter per channel, read from the f32 mid ring
//! (or the raw source in depthwise-first pipelines), written to the
//! second ring or straight into the output tensor.
//!
//! Two fixed-geometry paths cover the dominant mobile-network shapes
//! (3x3 and 7x7, stride 1 or 2); everything else, including dilation,
//! goes through the general path. All paths split each row into edge
//! columns with per-tap bounds checks and an interior run without them.

use super::{Elem, RowGeo};
use crate::kernels::activations::ActivationKind;
use crate::param::ConvShape;

/// First output column whose leftmost tap is in range.
fn interior_lo(pad: usize, stride: usize) -> usize {
    pad.div_ceil(stride)
}

/// One past the last output column whose rightmost tap is in range.
fn interior_hi(shape: &ConvShape, dst_w: usize) -> usize {
    let reach = (shape.kernel_x - 1) * shape.dilation_x;
    let limit = shape.src_w + shape.pad_x;
    if limit <= reach {
        return 0;
    }
    (((limit - reach - 1) / shape.stride_x) + 1).min(dst_w)
}

/// One output pixel with per-tap bounds checks, all channel blocks.
#[allow(clippy::too_many_arguments)]
#[inline]
fn pixel_edge<D: Elem, const F: usize>(
    src: &[f32],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y: usize,
    x: usize,
    weights: &[f32],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [D],
    dst_geo: RowGeo,
) {
    let k = shape.kernel_y * shape.kernel_x;
    let di = dst_geo.at(y, x);
    let mut dc = 0;
    while dc < tile_c {
        let valid = F.min(tile_c - dc);
        let mut acc = [0f32; F];
        for (f, a) in acc.iter_mut().enumerate().take(valid) {
            *a = bias[dc + f];
        }
        for ky in 0..shape.kernel_y {
            let sy = (y * shape.stride_y + ky * shape.dilation_y).wrapping_sub(shape.pad_y);
            if sy >= shape.src_h {
                continue;
            }
            for kx in 0..shape.kernel_x {
                let sx = (x * shape.stride_x + kx * shape.dilation_x).wrapping_sub(shape.pad_x);
                if sx >= shape.src_w {
                    continue;
                }
                let base = src_geo.at(sy, sx) + dc;
                let tap = ky * shape.kernel_x + kx;
                for f in 0..valid {
                    acc[f] += src[base + f] * weights[(dc + f) * k + tap];
                }
            }
        }
        for f in 0..valid {
            dst[di + dc + f] = D::from_f32(act.apply(acc[f], params, dc + f));
        }
        dc += F;
    }
}

/// General path: arbitrary kernel, stride, dilation and padding.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convolve<D: Elem, const F: usize>(
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
    dst: &mut [D],
    dst_geo: RowGeo,
) {
    let k = shape.kernel_y * shape.kernel_x;
    let x_lo = interior_lo(shape.pad_x, shape.stride_x).min(shape.dst_w);
    let x_hi = interior_hi(shape, shape.dst_w).max(x_lo);
    for y in y_beg..y_end {
        for x in 0..x_lo {
            pixel_edge::<D, F>(
                src, src_geo, shape, tile_c, y, x, weights, bias, act, params, dst, dst_geo,
            );
        }
        for x in x_lo..x_hi {
            let bx = x * shape.stride_x - shape.pad_x;
            let di = dst_geo.at(y, x);
            let mut dc = 0;
            while dc < tile_c {
                let valid = F.min(tile_c - dc);
                let mut acc = [0f32; F];
                for (f, a) in acc.iter_mut().enumerate().take(valid) {
                    *a = bias[dc + f];
                }
                for ky in 0..shape.kernel_y {
                    let sy =
                        (y * shape.stride_y + ky * shape.dilation_y).wrapping_sub(shape.pad_y);
                    if sy >= shape.src_h {
                        continue;
                    }
                    for kx in 0..shape.kernel_x {
                        let base = src_geo.at(sy, bx + kx * shape.dilation_x) + dc;
                        let tap = ky * shape.kernel_x + kx;
                        for f in 0..valid {
                            acc[f] += src[base + f] * weights[(dc + f) * k + tap];
                        }
                    }
                }
                for f in 0..valid {
                    dst[di + dc + f] = D::from_f32(act.apply(acc[f], params, dc + f));
                }
                dc += F;
            }
        }
        for x in x_hi..shape.dst_w {
            pixel_edge::<D, F>(
                src, src_geo, shape, tile_c, y, x, weights, bias, act, params, dst, dst_geo,
            );
        }
    }
}

/// Square undilated kernel with hoisted row bounds and an unchecked
/// interior column run.
#[allow(clippy::too_many_arguments)]
fn convolve_square<D: Elem, const F: usize, const K: usize>(
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
    dst: &mut [D],
    dst_geo: RowGeo,
) {
    debug_assert_eq!(shape.kernel_y, K);
    debug_assert_eq!(shape.kernel_x, K);
    debug_assert_eq!(shape.dilation_y, 1);
    debug_assert_eq!(shape.dilation_x, 1);
    let pix = src_geo.pix;
    let x_lo = interior_lo(shape.pad_x, shape.stride_x).min(shape.dst_w);
    let x_hi = interior_hi(shape, shape.dst_w).max(x_lo);
    for y in y_beg..y_end {
        let by = (y * shape.stride_y) as isize - shape.pad_y as isize;
        let ky_lo = (-by).max(0) as usize;
        let ky_hi = K.min((shape.src_h as isize - by).max(0) as usize);
        for x in 0..x_lo {
            pixel_edge::<D, F>(
                src, src_geo, shape, tile_c, y, x, weights, bias, act, params, dst, dst_geo,
            );
        }
        for x in x_lo..x_hi {
            let bx = x * shape.stride_x - shape.pad_x;
            let di = dst_geo.at(y, x);
            let mut dc = 0;
            while dc < tile_c {
                let valid = F.min(tile_c - dc);
                let mut acc = [0f32; F];
                for (f, a) in acc.iter_mut().enumerate().take(valid) {
                    *a = bias[dc + f];
                }
                for ky in ky_lo..ky_hi {
                    let sy = (by + ky as isize) as usize;
                    let row = src_geo.at(sy, bx) + dc;
                    for kx in 0..K {
                        let base = row + kx * pix;
                        let tap = ky * K + kx;
                        for f in 0..valid {
                            acc[f] += src[base + f] * weights[(dc + f) * (K * K) + tap];
                        }
                    }
                }
                for f in 0..valid {
                    dst[di + dc + f] = D::from_f32(act.apply(acc[f], params, dc + f));
                }
                dc += F;
            }
        }
        for x in x_hi..shape.dst_w {
            pixel_edge::<D, F>(
                src, src_geo, shape, tile_c, y, x, weights, bias, act, params, dst, dst_geo,
            );
        }
    }
}

/// 3x3, stride 1 or 2, padding at most 1.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convolve3x3<D: Elem, const F: usize>(
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
    dst: &mut [D],
    dst_geo: RowGeo,
) {
    convolve_square::<D, F, 3>(
        src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, dst, dst_geo,
    );
}

/// 7x7, stride 1 or 2, padding 3.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convolve7x7<D: Elem, const F: usize>(
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
    dst: &mut [D],
    dst_geo: RowGeo,
) {
    convolve_square::<D, F, 7>(
        src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, dst, dst_geo,
    );
}
