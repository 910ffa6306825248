//! Cache-driven tiling plan.
//!
//! The plan splits the mid channels into super-tiles sized so the live
//! weight slice fits half of L3, then searches downward for the largest
//! output row step whose ring buffers fit L2. The search bottoms out at
//! one row and never fails; a degraded plan is still correct, only
//! slower.

use crate::caps::{CacheInfo, Precision};
use crate::param::{MergedParam, Topology};

pub(crate) fn align_hi(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

pub(crate) fn pow2_hi(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// Rows of stage input consumed to produce output rows `0..rows`.
/// Zero rows need zero input; padding past the kernel reach can make an
/// upstream requirement collapse to zero, so this must hold at 0 too.
fn rows_back(rows: usize, stride: usize, kernel: usize, dilation: usize, pad: usize) -> usize {
    if rows == 0 {
        return 0;
    }
    let reach = (kernel - 1) * dilation + 1;
    ((rows - 1) * stride + reach).saturating_sub(pad)
}

/// Tiling plan for one pipeline: channel tile widths, per-buffer row
/// steps, warm-up row counts, ring heights and element counts.
///
/// Buffer indices: 0 is the compressed source copy, 1 the expansion
/// output, 2 the depthwise output. Unused buffers have zero height.
#[derive(Debug, Clone)]
pub(crate) struct AlgParam {
    /// Channel lane width of the bound tier.
    pub mi_c: usize,
    /// Mid-channel super-tile width, a multiple of `mi_c`.
    pub ma_c: usize,
    /// Steady-state row advance per window, per buffer.
    pub y_step: [usize; 3],
    /// Rows produced by the first window (warm-up), per buffer.
    pub y_start: [usize; 3],
    /// Ring heights, powers of two.
    pub buf_h: [usize; 3],
    /// Ring element counts.
    pub size_b: [usize; 3],
    /// Weight strides: per-output-channel expansion stride, depthwise
    /// taps per channel, projection weight row stride.
    pub dw: [usize; 3],
}

impl AlgParam {
    pub(crate) fn plan(param: &MergedParam, lanes: usize, cache: &CacheInfo) -> AlgParam {
        let topo = param.topology();
        let eb = param.precision.elem_bytes();
        let compressed = param.precision == Precision::Bf16;
        let mid_c = param.depthwise().dst_c;

        let mut weight_bytes = 0;
        for c in &param.conv {
            let elem = if c.group == 1 { eb } else { 4 };
            weight_bytes += c.weight_len() * elem;
        }
        let count = weight_bytes / (cache.l3 / 2).max(1) + 1;
        let mi_c = lanes;
        let ma_c = align_hi(mid_c.div_ceil(count), 2 * mi_c).min(align_hi(mid_c, mi_c));

        let dw_stage = param.depthwise();
        let out_rows = dw_stage.dst_h;
        let mut a = AlgParam {
            mi_c,
            ma_c,
            y_step: [0; 3],
            y_start: [0; 3],
            buf_h: [0; 3],
            size_b: [0; 3],
            dw: [0; 3],
        };
        for step in (1..=out_rows).rev() {
            a.y_step[2] = step;
            a.y_start[2] = step;
            a.buf_h = [0; 3];
            a.size_b = [0; 3];
            let bytes = match topo {
                Topology::Cdc | Topology::Cd => {
                    let c0 = &param.conv[0];
                    let c1 = &param.conv[1];
                    a.y_step[1] = step * c1.stride_y;
                    a.y_start[1] = rows_back(step, c1.stride_y, c1.kernel_y, c1.dilation_y, c1.pad_y)
                        .min(c1.src_h);
                    // Tall enough for the widest read window, the warm-up
                    // rows and one steady-state write step.
                    a.buf_h[1] = pow2_hi(
                        rows_back(step, c1.stride_y, c1.kernel_y, c1.dilation_y, 0)
                            .max(a.y_start[1])
                            .max(a.y_step[1]),
                    );
                    a.y_step[0] = a.y_step[1] * c0.stride_y;
                    a.y_start[0] =
                        rows_back(a.y_start[1], c0.stride_y, c0.kernel_y, c0.dilation_y, c0.pad_y)
                            .min(c0.src_h);
                    a.size_b[1] = a.buf_h[1] * c1.src_w * a.ma_c;
                    let mut bytes = a.size_b[1] * 4;
                    if compressed {
                        a.buf_h[0] = pow2_hi(
                            rows_back(a.y_step[1], c0.stride_y, c0.kernel_y, c0.dilation_y, 0)
                                .max(a.y_start[0])
                                .max(a.y_step[0]),
                        );
                        a.size_b[0] = a.buf_h[0] * c0.src_w * c0.src_c;
                        bytes += a.size_b[0] * eb;
                    }
                    if topo == Topology::Cdc {
                        a.buf_h[2] = pow2_hi(step);
                        a.size_b[2] = a.buf_h[2] * c1.dst_w * a.ma_c;
                        bytes += a.size_b[2] * eb;
                    }
                    bytes
                }
                Topology::Dc => {
                    let c0 = &param.conv[0];
                    a.y_step[1] = step * c0.stride_y;
                    a.y_start[1] = rows_back(step, c0.stride_y, c0.kernel_y, c0.dilation_y, c0.pad_y)
                        .min(c0.src_h);
                    a.y_step[0] = a.y_step[1];
                    a.y_start[0] = a.y_start[1];
                    a.buf_h[2] = pow2_hi(step);
                    a.size_b[2] = a.buf_h[2] * c0.dst_w * a.ma_c;
                    a.size_b[2] * eb
                }
            };
            if bytes <= cache.l2 || step == 1 {
                break;
            }
        }
        match topo {
            Topology::Cdc => {
                a.dw[0] = param.conv[0].kernel_y * param.conv[0].kernel_x * param.conv[0].src_c;
                a.dw[1] = param.conv[1].kernel_y * param.conv[1].kernel_x;
                a.dw[2] = param.conv[2].src_c;
            }
            Topology::Cd => {
                a.dw[0] = param.conv[0].kernel_y * param.conv[0].kernel_x * param.conv[0].src_c;
                a.dw[1] = param.conv[1].kernel_y * param.conv[1].kernel_x;
            }
            Topology::Dc => {
                a.dw[1] = param.conv[0].kernel_y * param.conv[0].kernel_x;
                a.dw[2] = param.conv[1].src_c;
            }
        }
        a
    }

    /// External scratch requirement in bytes.
    pub(crate) fn scratch_bytes(&self, precision: Precision) -> usize {
        let eb = precision.elem_bytes();
        self.size_b[0] * eb + self.size_b[1] * 4 + self.size_b[2] * eb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::CacheInfo;
    use crate::kernels::activations::ActivationKind;
    use crate::param::ConvShape;

    fn cdc(c_in: usize, c_mid: usize, c_out: usize, h: usize, w: usize) -> MergedParam {
        MergedParam::new(
            1,
            vec![
                ConvShape::new(
                    c_in,
                    h,
                    w,
                    c_mid,
                    (1, 1),
                    (1, 1),
                    (0, 0, 0, 0),
                    1,
                    ActivationKind::Relu,
                ),
                ConvShape::new(
                    c_mid,
                    h,
                    w,
                    c_mid,
                    (3, 3),
                    (1, 1),
                    (1, 1, 1, 1),
                    c_mid,
                    ActivationKind::Relu,
                ),
                ConvShape::new(
                    c_mid,
                    h,
                    w,
                    c_out,
                    (1, 1),
                    (1, 1),
                    (0, 0, 0, 0),
                    1,
                    ActivationKind::Identity,
                ),
            ],
            false,
            crate::caps::Precision::F32,
        )
    }

    #[test]
    fn test_rings_fit_l2() {
        let p = cdc(32, 64, 32, 56, 56);
        let cache = CacheInfo::default();
        let a = AlgParam::plan(&p, 8, &cache);
        assert!(a.scratch_bytes(crate::caps::Precision::F32) <= cache.l2);
        assert!(a.buf_h[1].is_power_of_two());
        assert!(a.buf_h[2].is_power_of_two());
        assert_eq!(a.ma_c % 8, 0);
    }

    #[test]
    fn test_degrades_to_single_row_step() {
        let p = cdc(32, 64, 32, 56, 56);
        let tiny = CacheInfo {
            l1: 1024,
            l2: 1024,
            l3: 4096,
        };
        let a = AlgParam::plan(&p, 4, &tiny);
        assert_eq!(a.y_step[2], 1);
        // Warm-up still covers the kernel window above the first output row.
        assert!(a.y_start[1] >= 2);
    }

    #[test]
    fn test_row_windows_cover_every_output_row() {
        let p = cdc(16, 48, 16, 23, 17);
        let a = AlgParam::plan(&p, 4, &CacheInfo::default());
        let dst_h = p.conv[1].dst_h;
        let src_h = p.conv[1].src_h;
        let mut y2 = 0;
        let mut y1 = 0;
        let mut produced2 = 0;
        let mut produced1 = 0;
        while y2 < dst_h {
            let e2 = (y2 + a.y_step[2]).clamp(a.y_start[2], dst_h);
            let e1 = (y1 + a.y_step[1]).clamp(a.y_start[1], src_h);
            // The mid ring must hold every row the depthwise window reads.
            assert!(e1 >= (e2 - 1) + 3 - 1 || e1 == src_h);
            // Live span of the mid ring: rows the window reads through e1.
            assert!(e1 - y2.saturating_sub(1) <= a.buf_h[1]);
            produced2 += e2 - y2;
            produced1 += e1 - y1;
            y2 = e2;
            y1 = e1;
        }
        assert_eq!(produced2, dst_h);
        assert_eq!(produced1, src_h);
    }

    #[test]
    fn test_plan_with_padding_past_kernel_reach() {
        // A 3x3 depthwise with pad 3 makes the warm-up requirement
        // collapse to zero rows once the step degrades to 1; the
        // propagation into the expansion stage must stay at zero.
        let p = MergedParam::new(
            1,
            vec![
                ConvShape::new(
                    8,
                    6,
                    6,
                    16,
                    (1, 1),
                    (1, 1),
                    (0, 0, 0, 0),
                    1,
                    ActivationKind::Relu,
                ),
                ConvShape::new(
                    16,
                    6,
                    6,
                    16,
                    (3, 3),
                    (1, 1),
                    (3, 3, 3, 3),
                    16,
                    ActivationKind::Relu,
                ),
                ConvShape::new(
                    16,
                    10,
                    10,
                    8,
                    (1, 1),
                    (1, 1),
                    (0, 0, 0, 0),
                    1,
                    ActivationKind::Identity,
                ),
            ],
            false,
            crate::caps::Precision::Bf16,
        );
        assert!(p.validate().is_ok());
        let tiny = CacheInfo {
            l1: 64,
            l2: 64,
            l3: 256,
        };
        let a = AlgParam::plan(&p, 4, &tiny);
        assert_eq!(a.y_step[2], 1);
        assert_eq!(a.y_start[1], 0);
        assert_eq!(a.y_start[0], 0);
        assert!(a.buf_h[0].is_power_of_two());
        assert!(a.buf_h[1].is_power_of_two());
    }

    #[test]
    fn test_super_tile_count_scales_with_weights() {
        let small = cdc(16, 32, 16, 28, 28);
        let big = cdc(256, 1024, 256, 28, 28);
        let cache = CacheInfo {
            l1: 32 * 1024,
            l2: 256 * 1024,
            l3: 512 * 1024,
        };
        let a_small = AlgParam::plan(&small, 8, &cache);
        let a_big = AlgParam::plan(&big, 8, &cache);
        assert_eq!(a_small.ma_c, 32);
        assert!(a_big.ma_c < 1024);
    }
}
