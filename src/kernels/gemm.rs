//! Matrix-tile pointwise kernels.
//!
//! On the widest tier the two pointwise stages collapse into blocked
//! matrix products over pixel rows, with the bias and activation applied
//! in an epilogue pass per row chunk. Only legal for f32 buffers and 1x1
//! stride-1 unpadded geometry; ring wraparound splits a row window into
//! at most two contiguous chunks.

use super::{RowGeo, TileFlags};
use crate::kernels::activations::ActivationKind;
use crate::param::ConvShape;

/// Contiguous row runs of `y_beg..y_end` through a ring (one run for a
/// flat view).
fn ring_runs(geo: RowGeo, y_beg: usize, y_end: usize) -> impl Iterator<Item = (usize, usize)> {
    let buf_h = geo.buf_h();
    let mut y = y_beg;
    std::iter::from_fn(move || {
        if y >= y_end {
            return None;
        }
        let run = if buf_h == 0 {
            y_end - y
        } else {
            (y_end - y).min(buf_h - (y & geo.mask))
        };
        let out = (y, y + run);
        y += run;
        Some(out)
    })
}

/// Expansion stage as a pixel-major matrix product into the mid ring.
#[allow(clippy::too_many_arguments)]
pub(crate) fn input_1x1(
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
    dst: &mut [f32],
    dst_geo: RowGeo,
) {
    let src_c = shape.src_c;
    let w = shape.dst_w;
    for (r0, r1) in ring_runs(dst_geo, y_beg, y_end) {
        let m = (r1 - r0) * w;
        if m == 0 {
            continue;
        }
        unsafe {
            matrixmultiply::sgemm(
                m,
                src_c,
                tile_c,
                1.0,
                src.as_ptr().add(src_geo.at(r0, 0)),
                src_geo.pix as isize,
                1,
                weights.as_ptr(),
                1,
                src_c as isize,
                0.0,
                dst.as_mut_ptr().add(dst_geo.at(r0, 0)),
                dst_geo.pix as isize,
                1,
            );
        }
        for p in 0..m {
            let base = dst_geo.at(r0, 0) + p * dst_geo.pix;
            for c in 0..tile_c {
                dst[base + c] = act.apply(dst[base + c] + bias[c], params, c);
            }
        }
    }
}

/// Projection stage as a pixel-major matrix product onto the output
/// tensor, accumulating across super-tiles through `beta`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn output_1x1(
    src: &[f32],
    src_geo: RowGeo,
    shape: &ConvShape,
    tile_c: usize,
    w_off: usize,
    y_beg: usize,
    y_end: usize,
    weights: &[f32],
    bias: &[f32],
    act: ActivationKind,
    params: &[f32],
    dst: &mut [f32],
    dst_geo: RowGeo,
    flags: TileFlags,
) {
    let src_c = shape.src_c;
    let dst_c = shape.dst_c;
    let w = shape.dst_w;
    let beta = if flags.zero { 0.0 } else { 1.0 };
    for (r0, r1) in ring_runs(src_geo, y_beg, y_end) {
        let m = (r1 - r0) * w;
        if m == 0 {
            continue;
        }
        unsafe {
            matrixmultiply::sgemm(
                m,
                tile_c,
                dst_c,
                1.0,
                src.as_ptr().add(src_geo.at(r0, 0)),
                src_geo.pix as isize,
                1,
                weights.as_ptr().add(w_off),
                1,
                src_c as isize,
                beta,
                dst.as_mut_ptr().add(dst_geo.at(r0, 0)),
                dst_geo.pix as isize,
                1,
            );
        }
        if flags.last {
            for p in 0..m {
                let base = dst_geo.at(r0, 0) + p * dst_geo.pix;
                for c in 0..dst_c {
                    dst[base + c] = act.apply(dst[base + c] + bias[c], params, c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::output;

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
    fn test_input_gemm_matches_lane_kernel() {
        let s = shape(5, 7, 3, 4);
        let src: Vec<f32> = (0..5 * 12).map(|v| (v as f32) * 0.03 - 0.4).collect();
        let weights: Vec<f32> = (0..7 * 5).map(|v| 0.1 - (v as f32) * 0.004).collect();
        let bias: Vec<f32> = (0..7).map(|v| v as f32 * 0.1).collect();
        let sgeo = RowGeo::flat(4, 5, 0);
        let dgeo = RowGeo::flat(4, 7, 0);
        let mut a = vec![0f32; 7 * 12];
        let mut b = vec![0f32; 7 * 12];
        input_1x1(
            &src,
            sgeo,
            &s,
            7,
            0,
            3,
            &weights,
            &bias,
            ActivationKind::Relu,
            &[],
            &mut a,
            dgeo,
        );
        crate::kernels::input::convolve::<f32, 4>(
            &src,
            sgeo,
            &s,
            7,
            0,
            3,
            &weights,
            &bias,
            ActivationKind::Relu,
            &[],
            &mut b,
            dgeo,
        );
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_output_gemm_matches_lane_kernel_across_tiles() {
        let s = shape(6, 4, 2, 3);
        let src: Vec<f32> = (0..6 * 6).map(|v| (v as f32) * 0.05 - 0.8).collect();
        let weights: Vec<f32> = (0..4 * 6).map(|v| 0.2 - (v as f32) * 0.01).collect();
        let bias = [0.1f32, -0.2, 0.3, -0.4];
        let sgeo = RowGeo::flat(3, 6, 0);
        let dgeo = RowGeo::flat(3, 4, 0);
        let mut a = vec![0f32; 4 * 6];
        let mut b = vec![0f32; 4 * 6];
        for (tile, (off, last)) in [(0usize, false), (3usize, true)].iter().enumerate() {
            let flags = TileFlags {
                zero: tile == 0,
                last: *last,
            };
            let tgeo = RowGeo { off: *off, ..sgeo };
            input_output_pair(&src, tgeo, &s, *off, flags, &weights, &bias, &mut a, &mut b, dgeo);
        }
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn input_output_pair(
        src: &[f32],
        sgeo: RowGeo,
        s: &ConvShape,
        off: usize,
        flags: TileFlags,
        weights: &[f32],
        bias: &[f32],
        a: &mut [f32],
        b: &mut [f32],
        dgeo: RowGeo,
    ) {
        output_1x1(
            src,
            sgeo,
            s,
            3,
            off,
            0,
            2,
            weights,
            bias,
            ActivationKind::Gelu,
            &[],
            a,
            dgeo,
            flags,
        );
        output::project::<f32, 4>(
            src,
            sgeo,
            s,
            3,
            off,
            0,
            2,
            weights,
            bias,
            ActivationKind::Gelu,
            &[],
            b,
            dgeo,
            flags,
        );
    }
}
