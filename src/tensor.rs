//! Channel-last tensor bookkeeping.

/// Dimensions of a channel-last (NHWC) activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NhwcDims {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl NhwcDims {
    pub fn elements(&self) -> usize {
        self.n * self.h * self.w * self.c
    }

    /// Elements per batch item.
    pub fn per_image(&self) -> usize {
        self.h * self.w * self.c
    }
}

/// Copy rows `y_beg..y_end` between two tensors of identical row layout.
/// Used to preload the residual input into the output before the
/// projection accumulates onto it.
pub(crate) fn copy_rows(src: &[f32], dst: &mut [f32], row: usize, y_beg: usize, y_end: usize) {
    let lo = y_beg * row;
    let hi = y_end * row;
    dst[lo..hi].copy_from_slice(&src[lo..hi]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dims() {
        let d = NhwcDims {
            n: 2,
            h: 3,
            w: 4,
            c: 5,
        };
        assert_eq!(d.per_image(), 60);
        assert_eq!(d.elements(), 120);
    }

    #[test]
    fn test_copy_rows_is_bounded() {
        let src: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut dst = vec![0f32; 12];
        copy_rows(&src, &mut dst, 4, 1, 2);
        assert_eq!(&dst[..4], &[0.0; 4]);
        assert_eq!(&dst[4..8], &src[4..8]);
        assert_eq!(&dst[8..], &[0.0; 4]);
    }
}
