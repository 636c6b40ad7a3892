//! A single strided, optionally masked window over a flat backing store.

use anyhow::Result;

use crate::error::LazyError;
use crate::tensor::{Dimension, Shape};

/// Maps logical indices of `shape` onto offsets `offset + sum(index * stride)` of a flat store.
///
/// Positions outside `mask` (per-axis half-open ranges) read as zero and never touch the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    shape: Shape,
    strides: Vec<isize>,
    offset: isize,
    mask: Option<Vec<(usize, usize)>>,
    contiguous: bool,
}

/// Row-major strides for `dims`; unit axes get stride 0.
pub fn contiguous_strides(dims: &[Dimension]) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut acc = 1isize;
    for (idx, dim) in dims.iter().enumerate().rev() {
        match dim {
            Dimension::Static(1) => strides[idx] = 0,
            Dimension::Static(extent) => {
                strides[idx] = acc;
                acc *= *extent as isize;
            }
            Dimension::Dynamic(_) => strides[idx] = acc,
        }
    }
    strides
}

impl View {
    /// Canonicalizes the parts into a view: unit axes get stride 0, a mask covering every
    /// position is dropped, and an empty mask collapses the whole view to an empty window.
    pub fn create(
        shape: Shape,
        strides: Vec<isize>,
        offset: isize,
        mask: Option<Vec<(usize, usize)>>,
    ) -> Self {
        let mut strides: Vec<isize> = shape
            .dims()
            .iter()
            .zip(strides)
            .map(|(dim, stride)| if *dim == Dimension::Static(1) { 0 } else { stride })
            .collect();
        let mut offset = offset;
        let mut mask = mask;

        if let Some(ranges) = &mask {
            if ranges.iter().any(|(begin, end)| begin >= end) {
                let rank = ranges.len();
                mask = Some(vec![(0, 0); rank]);
                strides = vec![0; rank];
                offset = 0;
            } else {
                let full = ranges
                    .iter()
                    .zip(shape.dims())
                    .all(|(range, dim)| dim.as_static().map(|d| *range == (0, d)).unwrap_or(false));
                if full {
                    mask = None;
                }
            }
        }

        let contiguous =
            offset == 0 && mask.is_none() && strides == contiguous_strides(shape.dims());
        View {
            shape,
            strides,
            offset,
            mask,
            contiguous,
        }
    }

    /// Dense row-major view of `shape`.
    pub fn from_shape(shape: &Shape) -> Self {
        View::create(
            shape.clone(),
            contiguous_strides(shape.dims()),
            0,
            None,
        )
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> isize {
        self.offset
    }

    pub fn mask(&self) -> Option<&[(usize, usize)]> {
        self.mask.as_deref()
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    fn static_dims(&self, op: &str) -> Result<Vec<usize>> {
        self.shape.static_dims().ok_or_else(|| {
            LazyError::unsupported_shape(&self.shape, format!("{op} needs static dimensions"))
                .into()
        })
    }

    fn check_rank(&self, op: &str, len: usize) -> Result<()> {
        if len != self.shape.rank() {
            return Err(LazyError::invariant(format!(
                "{op} argument rank {len} does not match view rank {}",
                self.shape.rank()
            ))
            .into());
        }
        Ok(())
    }

    /// Flat store offset for `index`, or `None` when the position is masked out.
    pub fn index(&self, index: &[usize]) -> Option<isize> {
        if let Some(mask) = &self.mask {
            for (pos, (begin, end)) in index.iter().zip(mask) {
                if pos < begin || pos >= end {
                    return None;
                }
            }
        }
        Some(
            index
                .iter()
                .zip(&self.strides)
                .fold(self.offset, |acc, (pos, stride)| acc + *pos as isize * stride),
        )
    }

    /// Largest store offset the view can address, or `None` when it addresses nothing.
    pub(crate) fn max_offset(&self) -> Option<isize> {
        let dims = self.shape.static_dims()?;
        let mut max = self.offset;
        for (axis, (dim, stride)) in dims.iter().zip(&self.strides).enumerate() {
            let (begin, end) = self.mask.as_ref().map(|m| m[axis]).unwrap_or((0, *dim));
            if begin >= end {
                return None;
            }
            max += if *stride > 0 {
                (end - 1) as isize * stride
            } else {
                begin as isize * stride
            };
        }
        Some(max)
    }

    pub fn permute(&self, axes: &[usize]) -> Result<View> {
        self.check_rank("permute", axes.len())?;
        let mut seen = vec![false; axes.len()];
        for &axis in axes {
            if axis >= axes.len() || seen[axis] {
                return Err(
                    LazyError::invariant(format!("{axes:?} is not a permutation")).into(),
                );
            }
            seen[axis] = true;
        }
        let dims = self.shape.dims();
        Ok(View::create(
            Shape::new(axes.iter().map(|&a| dims[a].clone()).collect::<Vec<_>>()),
            axes.iter().map(|&a| self.strides[a]).collect(),
            self.offset,
            self.mask
                .as_ref()
                .map(|mask| axes.iter().map(|&a| mask[a]).collect()),
        ))
    }

    pub fn expand(&self, new_shape: &Shape) -> Result<View> {
        self.check_rank("expand", new_shape.rank())?;
        let mut mask = self.mask.clone();
        for (axis, (old, new)) in self.shape.dims().iter().zip(new_shape.dims()).enumerate() {
            if old == new {
                continue;
            }
            if *old != Dimension::Static(1) {
                return Err(LazyError::invariant(format!(
                    "cannot expand {} to {}",
                    self.shape, new_shape
                ))
                .into());
            }
            if let Some(ranges) = mask.as_mut() {
                let extent = new.as_static().ok_or_else(|| {
                    LazyError::unsupported_shape(new_shape, "masked expand to a symbolic extent")
                })?;
                ranges[axis] = if ranges[axis] == (0, 1) {
                    (0, extent)
                } else {
                    (0, 0)
                };
            }
        }
        Ok(View::create(
            new_shape.clone(),
            self.strides.clone(),
            self.offset,
            mask,
        ))
    }

    pub fn shrink(&self, arg: &[(usize, usize)]) -> Result<View> {
        self.check_rank("shrink", arg.len())?;
        let dims = self.static_dims("shrink")?;
        let mut offset = self.offset;
        let mut new_dims = Vec::with_capacity(dims.len());
        let mut mask = self.mask.as_ref().map(|_| Vec::with_capacity(dims.len()));
        for (axis, (&(begin, end), &dim)) in arg.iter().zip(&dims).enumerate() {
            if begin > end || end > dim {
                return Err(LazyError::invariant(format!(
                    "shrink range ({begin}, {end}) out of bounds for extent {dim}"
                ))
                .into());
            }
            offset += begin as isize * self.strides[axis];
            new_dims.push(end - begin);
            if let (Some(ranges), Some(old)) = (mask.as_mut(), self.mask.as_ref()) {
                let (mb, me) = old[axis];
                let lo = mb.max(begin).min(end);
                let hi = me.min(end).max(lo);
                ranges.push((lo - begin, hi - begin));
            }
        }
        Ok(View::create(
            Shape::from_static(&new_dims),
            self.strides.clone(),
            offset,
            mask,
        ))
    }

    /// Steps through each axis by `mul` elements; negative factors flip the axis.
    pub fn stride(&self, mul: &[isize]) -> Result<View> {
        self.check_rank("stride", mul.len())?;
        if mul.iter().any(|&m| m == 0) {
            return Err(LazyError::invariant("stride factors must be non-zero").into());
        }
        let dims = self.static_dims("stride")?;
        let mut offset = self.offset;
        let mut new_dims = Vec::with_capacity(dims.len());
        let mut strides = Vec::with_capacity(dims.len());
        for ((&dim, &stride), &m) in dims.iter().zip(&self.strides).zip(mul) {
            let step = m.unsigned_abs();
            new_dims.push(dim.div_ceil(step));
            strides.push(stride * m);
            if m < 0 && dim > 0 {
                offset += (dim as isize - 1) * stride;
            }
        }
        let mask = self.mask.as_ref().map(|ranges| {
            ranges
                .iter()
                .zip(&dims)
                .zip(mul)
                .map(|((&(mb, me), &dim), &m)| {
                    let step = m.unsigned_abs();
                    let (lo, hi) = if m > 0 { (mb, me) } else { (dim - me, dim - mb) };
                    (lo.div_ceil(step), hi.div_ceil(step))
                })
                .collect()
        });
        Ok(View::create(
            Shape::from_static(&new_dims),
            strides,
            offset,
            mask,
        ))
    }

    pub fn pad(&self, arg: &[(usize, usize)]) -> Result<View> {
        self.check_rank("pad", arg.len())?;
        let dims = self.static_dims("pad")?;
        if arg.iter().all(|&(before, after)| before == 0 && after == 0) {
            return Ok(self.clone());
        }
        let mut offset = self.offset;
        let mut new_dims = Vec::with_capacity(dims.len());
        let mut mask = Vec::with_capacity(dims.len());
        for (axis, (&(before, after), &dim)) in arg.iter().zip(&dims).enumerate() {
            offset -= before as isize * self.strides[axis];
            new_dims.push(dim + before + after);
            let (mb, me) = self.mask.as_ref().map(|m| m[axis]).unwrap_or((0, dim));
            mask.push((mb + before, me + before));
        }
        Ok(View::create(
            Shape::from_static(&new_dims),
            self.strides.clone(),
            offset,
            Some(mask),
        ))
    }

    /// Attempts to express a reshape of this view as a single view. Returns `None` when the
    /// strides cannot be merged or split without materializing.
    pub fn try_reshape(&self, new_shape: &Shape) -> Option<View> {
        let old = self.shape.static_dims()?;
        let new = new_shape.static_dims()?;
        if old.iter().product::<usize>() != new.iter().product::<usize>() {
            return None;
        }
        if self.contiguous || new.iter().product::<usize>() == 0 {
            return Some(View::from_shape(new_shape));
        }

        let old_kept: Vec<usize> = (0..old.len()).filter(|&a| old[a] != 1).collect();
        let new_kept: Vec<usize> = (0..new.len()).filter(|&a| new[a] != 1).collect();
        let old_extents: Vec<usize> = old_kept.iter().map(|&a| old[a]).collect();
        let new_extents: Vec<usize> = new_kept.iter().map(|&a| new[a]).collect();

        // Only unit axes change: strides and mask carry over positionally.
        if old_extents == new_extents {
            let mut strides = vec![0isize; new.len()];
            let mut mask = self.mask.as_ref().map(|_| vec![(0usize, 1usize); new.len()]);
            for (&dst, &src) in new_kept.iter().zip(&old_kept) {
                strides[dst] = self.strides[src];
                if let (Some(ranges), Some(old_mask)) = (mask.as_mut(), self.mask.as_ref()) {
                    ranges[dst] = old_mask[src];
                }
            }
            return Some(View::create(new_shape.clone(), strides, self.offset, mask));
        }
        if self.mask.is_some() {
            return None;
        }

        let old_strides: Vec<isize> = old_kept.iter().map(|&a| self.strides[a]).collect();
        let mut new_strides = vec![0isize; new_extents.len()];
        let (mut oi, mut oj, mut ni, mut nj) = (0usize, 1usize, 0usize, 1usize);
        while ni < new_extents.len() && oi < old_extents.len() {
            let mut np = new_extents[ni];
            let mut op = old_extents[oi];
            while np != op {
                if np < op {
                    np *= new_extents[nj];
                    nj += 1;
                } else {
                    op *= old_extents[oj];
                    oj += 1;
                }
            }
            for ok in oi..oj - 1 {
                if old_strides[ok] != old_extents[ok + 1] as isize * old_strides[ok + 1] {
                    return None;
                }
            }
            new_strides[nj - 1] = old_strides[oj - 1];
            for nk in (ni + 1..nj).rev() {
                new_strides[nk - 1] = new_strides[nk] * new_extents[nk] as isize;
            }
            ni = nj;
            nj += 1;
            oi = oj;
            oj += 1;
        }

        let mut strides = vec![0isize; new.len()];
        for (&dst, stride) in new_kept.iter().zip(new_strides) {
            strides[dst] = stride;
        }
        Some(View::create(new_shape.clone(), strides, self.offset, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_strided_axes_but_refuses_to_merge_gapped_rows() {
        let base = View::from_shape(&Shape::from_static(&[4, 6]));
        let window = base.shrink(&[(0, 4), (1, 5)]).unwrap();
        assert_eq!(window.strides(), &[6, 1]);
        assert_eq!(window.offset(), 1);

        let split = window.try_reshape(&Shape::from_static(&[4, 2, 2])).unwrap();
        assert_eq!(split.strides(), &[6, 2, 1]);
        assert_eq!(split.offset(), 1);

        assert!(window.try_reshape(&Shape::from_static(&[16])).is_none());
    }

    #[test]
    fn unit_axes_keep_the_mask() {
        let padded = View::from_shape(&Shape::from_static(&[3]))
            .pad(&[(1, 1)])
            .unwrap();
        let lifted = padded.try_reshape(&Shape::from_static(&[1, 5])).unwrap();
        assert_eq!(lifted.mask(), Some(&[(0, 1), (1, 4)][..]));
        assert_eq!(lifted.offset(), -1);
    }

    #[test]
    fn empty_mask_ranges_collapse_the_view() {
        let view = View::create(
            Shape::from_static(&[2, 3]),
            vec![3, 1],
            4,
            Some(vec![(1, 1), (0, 3)]),
        );
        assert_eq!(view.mask(), Some(&[(0, 0), (0, 0)][..]));
        assert_eq!(view.strides(), &[0, 0]);
        assert_eq!(view.offset(), 0);
    }
}
