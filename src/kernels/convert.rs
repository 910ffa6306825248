//! f32 to bf16 row conversion into the source ring buffer.

use super::RowGeo;
use half::bf16;

/// Convert source rows `y_beg..y_end` into the compressed ring.
///
/// Both sides are row-contiguous, so the range collapses into bulk runs,
/// split only where the ring wraps. At most two runs per call.
pub(crate) fn to_bf16_rows(
    src: &[f32],
    src_geo: RowGeo,
    y_beg: usize,
    y_end: usize,
    dst: &mut [bf16],
    dst_geo: RowGeo,
) {
    debug_assert_eq!(src_geo.row, dst_geo.row);
    let buf_h = dst_geo.buf_h();
    let mut y = y_beg;
    while y < y_end {
        let run = (y_end - y).min(buf_h - (y & dst_geo.mask));
        let s = &src[src_geo.at(y, 0)..src_geo.at(y, 0) + run * src_geo.row];
        let d = &mut dst[dst_geo.at(y, 0)..dst_geo.at(y, 0) + run * dst_geo.row];
        for (d, s) in d.iter_mut().zip(s.iter()) {
            *d = bf16::from_f32(*s);
        }
        y += run;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_splits_at_wraparound() {
        // 6 source rows of 4 elements through a 4-row ring.
        let src: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let src_geo = RowGeo::flat(2, 2, 0);
        let mut ring = vec![bf16::ZERO; 16];
        let ring_geo = RowGeo::ring(4, 2, 2);

        to_bf16_rows(&src, src_geo, 0, 4, &mut ring, ring_geo);
        to_bf16_rows(&src, src_geo, 3, 6, &mut ring, ring_geo);

        // Rows 4 and 5 overwrote ring slots 0 and 1; rows 2 and 3 remain.
        for y in 2..6 {
            for i in 0..4 {
                let got = ring[ring_geo.at(y, 0) + i].to_f32();
                assert_eq!(got, (y * 4 + i) as f32);
            }
        }
    }
}
