//! D-dimensional shape and copy-region math.
//!
//! All buffers are dense row-major with the last declared dimension
//! contiguous. A `CopyRegion` describes one rectangular transfer between two
//! such buffers, with an optional traversal reversal per axis.

/// Number of elements in a dense buffer of the given shape.
pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Row-major strides for the given shape (last dimension has stride 1).
pub fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for dim in (0..dims.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * dims[dim + 1];
    }
    strides
}

/// Linear offset of a multi-dimensional index given precomputed strides.
pub fn offset_of(index: &[usize], strides: &[usize]) -> usize {
    index
        .iter()
        .zip(strides.iter())
        .map(|(i, s)| i * s)
        .sum()
}

/// One rectangular copy between a source and a destination buffer.
///
/// `shape` applies to both sides. When `reverse[d]` is set, traversal of the
/// *source* rectangle along dimension `d` runs from its far end back to its
/// near end while the destination is written forward, which mirrors the data
/// along that axis. Reversals compose across axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_begin: Vec<usize>,
    pub dst_begin: Vec<usize>,
    pub shape: Vec<usize>,
    pub reverse: Vec<bool>,
}

impl CopyRegion {
    /// A forward copy (no axis mirrored).
    pub fn new(src_begin: Vec<usize>, dst_begin: Vec<usize>, shape: Vec<usize>) -> Self {
        let reverse = vec![false; shape.len()];
        Self {
            src_begin,
            dst_begin,
            shape,
            reverse,
        }
    }

    /// A copy with explicit per-axis reversal flags.
    pub fn with_reverse(
        src_begin: Vec<usize>,
        dst_begin: Vec<usize>,
        shape: Vec<usize>,
        reverse: Vec<bool>,
    ) -> Self {
        debug_assert_eq!(shape.len(), reverse.len());
        Self {
            src_begin,
            dst_begin,
            shape,
            reverse,
        }
    }

    /// Number of elements moved by this copy.
    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    /// True when the region moves no elements.
    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&s| s == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_row_major() {
        assert_eq!(strides(&[4]), vec![1]);
        assert_eq!(strides(&[3, 4]), vec![4, 1]);
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
    }

    #[test]
    fn test_offset_of() {
        let s = strides(&[2, 3, 4]);
        assert_eq!(offset_of(&[0, 0, 0], &s), 0);
        assert_eq!(offset_of(&[0, 0, 3], &s), 3);
        assert_eq!(offset_of(&[0, 2, 1], &s), 9);
        assert_eq!(offset_of(&[1, 1, 1], &s), 17);
    }

    #[test]
    fn test_element_count() {
        assert_eq!(element_count(&[]), 1);
        assert_eq!(element_count(&[7]), 7);
        assert_eq!(element_count(&[2, 3, 4]), 24);
    }

    #[test]
    fn test_region_empty() {
        let region = CopyRegion::new(vec![0, 0], vec![0, 0], vec![3, 0]);
        assert!(region.is_empty());
        assert_eq!(region.element_count(), 0);

        let region = CopyRegion::new(vec![0], vec![2], vec![5]);
        assert!(!region.is_empty());
        assert_eq!(region.element_count(), 5);
    }
}
