//! Expansion stage: pointwise (or small-kernel) convolution from the
//! source tensor into the f32 mid ring, one channel super-tile at a time.

use super::{Elem, RowGeo};
use crate::kernels::activations::ActivationKind;
use crate::param::ConvShape;

/// Compute output rows `y_beg..y_end` of one channel super-tile.
///
/// `weights` is the tile's slice, laid out `[tile_c][ky][kx][src_c]`;
/// `bias` and per-channel `params` are tile slices as well. The 1x1
/// stride-1 unpadded geometry takes a dedicated path that walks pixels
/// in blocks of four so each weight row is streamed once per block.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convolve<S: Elem, const F: usize>(
    src: &[S],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[S],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
) {
    if shape.is_1x1() {
        convolve_1x1::<S, F>(
            src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, dst, dst_geo,
        );
    } else {
        convolve_any::<S, F>(
            src, src_geo, shape, tile_c, y_beg, y_end, weights, bias, act, params, dst, dst_geo,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn convolve_1x1<S: Elem, const F: usize>(
    src: &[S],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[S],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
) {
    let src_c = shape.src_c;
    let w = shape.dst_w;
    for y in y_beg..y_end {
        let mut x = 0;
        while x + 4 <= w {
            let p = [
                src_geo.at(y, x),
                src_geo.at(y, x + 1),
                src_geo.at(y, x + 2),
                src_geo.at(y, x + 3),
            ];
            let mut dc = 0;
            while dc < tile_c {
                let valid = F.min(tile_c - dc);
                for f in 0..valid {
                    let c = dc + f;
                    let wrow = &weights[c * src_c..c * src_c + src_c];
                    let mut acc = [bias[c]; 4];
                    for sc in 0..src_c {
                        let wv = wrow[sc].to_f32();
                        for (a, &base) in acc.iter_mut().zip(p.iter()) {
                            *a += src[base + sc].to_f32() * wv;
                        }
                    }
                    for (i, a) in acc.iter().enumerate() {
                        dst[dst_geo.at(y, x + i) + c] = act.apply(*a, params, c);
                    }
                }
                dc += F;
            }
            x += 4;
        }
        while x < w {
            let base = src_geo.at(y, x);
            let di = dst_geo.at(y, x);
            for c in 0..tile_c {
                let wrow = &weights[c * src_c..c * src_c + src_c];
                let mut acc = bias[c];
                for sc in 0..src_c {
                    acc += src[base + sc].to_f32() * wrow[sc].to_f32();
                }
                dst[di + c] = act.apply(acc, params, c);
            }
            x += 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn convolve_any<S: Elem, const F: usize>(
    src: &[S],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[S],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
) {
    let src_c = shape.src_c;
    let dw0 = shape.kernel_y * shape.kernel_x * src_c;
    for y in y_beg..y_end {
        for x in 0..shape.dst_w {
            let di = dst_geo.at(y, x);
            let mut dc = 0;
            while dc < tile_c {
                let valid = F.min(tile_c - dc);
                let mut acc = [0f32; F];
                for (f, a) in acc.iter_mut().enumerate().take(valid) {
                    *a = bias[dc + f];
                }
                for ky in 0..shape.kernel_y {
                    let sy = (y * shape.stride_y + ky * shape.dilation_y)
                        .wrapping_sub(shape.pad_y);
                    if sy >= shape.src_h {
                        continue;
                    }
                    for kx in 0..shape.kernel_x {
                        let sx = (x * shape.stride_x + kx * shape.dilation_x)
                            .wrapping_sub(shape.pad_x);
                        if sx >= shape.src_w {
                            continue;
                        }
                        let base = src_geo.at(sy, sx);
                        let tap = (ky * shape.kernel_x + kx) * src_c;
                        for f in 0..valid {
                            let wrow = &weights[(dc + f) * dw0 + tap..][..src_c];
                            let mut sum = 0f32;
                            for sc in 0..src_c {
                                sum += src[base + sc].to_f32() * wrow[sc].to_f32();
                            }
                            acc[f] += sum;
                        }
                    }
                }
                for f in 0..valid {
                    dst[di + dc + f] = act.apply(acc[f], params, dc + f);
                }
                dc += F;
            }
        }
    }
}
