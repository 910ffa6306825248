//! Projection stage: 1x1 convolution from the second ring into the output
//! tensor, accumulating across channel super-tiles.
//!
//! Partial sums live in the destination tensor between super-tiles. The
//! first tile starts accumulators at zero (or at the pre-copied residual
//! when `zero` is cleared); the last tile adds the bias and applies the
//! activation at store time. Intermediate stores are raw.

use super::{Elem, RowGeo, TileFlags};
use crate::kernels::activations::ActivationKind;
use crate::param::ConvShape;

/// Compute output rows `y_beg..y_end` from one super-tile of mid channels.
///
/// `weights` is the full `[dst_c][src_c]` matrix; `w_off` is this tile's
/// channel offset within each row and `tile_c` its width.
#[allow(clippy::too_many_arguments)]
pub(crate) fn project<S: Elem, const F: usize>(
    src: &[S],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    w_off: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[S],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
    flags: TileFlags,
) {
    let src_c = shape.src_c;
    let dst_c = shape.dst_c;
    for y in y_beg..y_end {
        for x in 0..shape.dst_w {
            let base = src_geo.at(y, x);
            let pix = &src[base..base + tile_c];
            let di = dst_geo.at(y, x);
            let mut dc = 0;
            while dc < dst_c {
                let valid = F.min(dst_c - dc);
                let mut acc = [0f32; F];
                if !flags.zero {
                    for (f, a) in acc.iter_mut().enumerate().take(valid) {
                        *a = dst[di + dc + f];
                    }
                }
                for f in 0..valid {
                    let wrow = &weights[(dc + f) * src_c + w_off..][..tile_c];
                    let mut sum = 0f32;
                    for (v, w) in pix.iter().zip(wrow.iter()) {
                        sum += v.to_f32() * w.to_f32();
                    }
                    acc[f] += sum;
                }
                if flags.last {
                    for f in 0..valid {
                        let c = dc + f;
                        dst[di + c] = act.apply(acc[f] + bias[c], params, c);
                    }
                } else {
                    for f in 0..valid {
                        dst[di + dc + f] = acc[f];
                    }
                }
                dc += F;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(src_c: usize, dst_c: usize, h: usize, w: usize) -> ConvShape {
        ConvShape::new(
            src_c,
            h,
            w,
            dst_c,
            (1, 1),
            (1, 1),
            (0, 0, 0, 0),
            1,
            ActivationKind::Identity,
        )
    }

    #[test]
    fn test_two_tiles_accumulate_to_full_product() {
        let s = shape(6, 3, 2, 2);
        let src: Vec<f32> = (0..6 * 4).map(|v| (v as f32) * 0.1).collect();
        let weights: Vec<f32> = (0..3 * 6).map(|v| 0.2 - (v as f32) * 0.01).collect();
        let bias = [1.0f32, -1.0, 0.5];
        let geo = RowGeo::flat(2, 6, 0);
        let dgeo = RowGeo::flat(2, 3, 0);

        let mut whole = vec![0f32; 3 * 4];
        project::<f32, 4>(
            &src,
            geo,
            &s,
            6,
            0,
            0,
            2,
            &weights,
            &bias,
            ActivationKind::Identity,
            &[],
            &mut whole,
            dgeo,
            TileFlags { zero: true, last: true },
        );

        // Same product split into tiles of 4 and 2 mid channels. The tile
        // source views carry the full pixel stride with a channel offset.
        let mut split = vec![0f32; 3 * 4];
        project::<f32, 4>(
            &src,
            geo,
            &s,
            4,
            0,
            0,
            2,
            &weights,
            &bias,
            ActivationKind::Identity,
            &[],
            &mut split,
            dgeo,
            TileFlags { zero: true, last: false },
        );
        let tile_geo = RowGeo { off: 4, ..geo };
        project::<f32, 4>(
            &src,
            tile_geo,
            &s,
            2,
            4,
            0,
            2,
            &weights,
            &bias,
            ActivationKind::Identity,
            &[],
            &mut split,
            dgeo,
            TileFlags { zero: false, last: true },
        );

        for (a, b) in whole.iter().zip(split.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_residual_preload_survives_accumulation() {
        let s = shape(2, 2, 1, 2);
        let src = [1.0f32, 1.0, 2.0, 2.0];
        let weights = [0.0f32; 4];
        let bias = [0.25f32, 0.5];
        let mut dst = [10.0f32, 20.0, 30.0, 40.0];
        project::<f32, 1>(
            &src,
            RowGeo::flat(2, 2, 0),
            &s,
            2,
            0,
            0,
            1,
            &weights,
            &bias,
            ActivationKind::Identity,
            &[],
            &mut dst,
            RowGeo::flat(2, 2, 0),
            TileFlags { zero: false, last: true },
        );
        assert_eq!(dst, [10.25, 20.5, 30.25, 40.5]);
    }

    #[test]
    fn test_activation_only_on_last_tile() {
        let s = shape(2, 1, 1, 1);
        let src = [1.0f32, 1.0];
        let weights = [-1.0f32, -1.0];
        let mut dst = [0f32];
        project::<f32, 1>(
            &src,
            RowGeo::flat(1, 2, 0),
            &s,
            2,
            0,
            0,
            1,
            &weights,
            &[0.0],
            ActivationKind::Relu,
            &[],
            &mut dst,
            RowGeo::flat(1, 2, 0),
            TileFlags { zero: true, last: false },
        );
        // Raw partial sum stored, no clamping yet.
        assert_eq!(dst, [-2.0]);
    }
}
