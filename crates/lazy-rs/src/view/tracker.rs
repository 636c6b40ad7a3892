use anyhow::Result;

use super::view::View;
use crate::error::LazyError;
use crate::tensor::Shape;

/// Stack of views describing how a logical shape addresses a base buffer.
///
/// The last view carries the logical shape. Each view's indices are flattened and fed to the
/// view below it; `views[0]` addresses the base storage directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    views: Vec<View>,
}

impl ShapeTracker {
    pub fn from_shape(shape: &Shape) -> Self {
        ShapeTracker {
            views: vec![View::from_shape(shape)],
        }
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    fn top(&self) -> &View {
        &self.views[self.views.len() - 1]
    }

    fn with_top(&self, view: View) -> Self {
        let mut views = self.views.clone();
        let last = views.len() - 1;
        views[last] = view;
        ShapeTracker { views }
    }

    pub fn shape(&self) -> &Shape {
        self.top().shape()
    }

    /// True when the tracker is a single dense row-major view.
    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].is_contiguous()
    }

    /// Number of backing elements the tracker addresses, counted from the bottom view.
    ///
    /// `None` for symbolic shapes.
    pub fn size(&self) -> Option<usize> {
        let bottom = &self.views[0];
        let elements = bottom.shape().num_elements()?;
        if elements == 0 {
            return Some(0);
        }
        Some(match bottom.max_offset() {
            Some(max) if max >= 0 => max as usize + 1,
            _ => 0,
        })
    }

    /// Per-axis stride into the base storage, when a single affine stride describes the axis.
    pub fn real_strides(&self) -> Vec<Option<isize>> {
        let top = self.top();
        let rank = top.shape().rank();
        if self.views.len() != 1 || !top.shape().is_static() {
            return vec![None; rank];
        }
        top.strides().iter().map(|&stride| Some(stride)).collect()
    }

    /// Collapses views that compose into a single one.
    pub fn simplify(&self) -> ShapeTracker {
        let mut views = self.views.clone();
        while views.len() >= 2 {
            let n = views.len();
            let (last, prev) = (&views[n - 1], &views[n - 2]);
            if !last.is_contiguous() {
                break;
            }
            if last.shape() == prev.shape() {
                views.pop();
                continue;
            }
            match prev.try_reshape(last.shape()) {
                Some(merged) => {
                    views.truncate(n - 2);
                    views.push(merged);
                }
                None => break,
            }
        }
        ShapeTracker { views }
    }

    pub fn reshape(&self, new_shape: &Shape) -> Result<ShapeTracker> {
        if new_shape == self.shape() {
            return Ok(self.clone());
        }
        let (old_count, new_count) = match (self.shape().num_elements(), new_shape.num_elements())
        {
            (Some(old), Some(new)) => (old, new),
            _ => {
                return Err(LazyError::unsupported_shape(
                    new_shape,
                    format!("reshape from {} needs static dimensions", self.shape()),
                )
                .into())
            }
        };
        if old_count != new_count {
            return Err(LazyError::invariant(format!(
                "cannot reshape {} ({old_count} elements) to {} ({new_count} elements)",
                self.shape(),
                new_shape
            ))
            .into());
        }
        if let Some(view) = self.top().try_reshape(new_shape) {
            return Ok(self.with_top(view));
        }
        let mut views = self.views.clone();
        views.push(View::from_shape(new_shape));
        Ok(ShapeTracker { views })
    }

    pub fn permute(&self, axes: &[usize]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().permute(axes)?))
    }

    pub fn expand(&self, new_shape: &Shape) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().expand(new_shape)?))
    }

    pub fn shrink(&self, arg: &[(usize, usize)]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().shrink(arg)?))
    }

    pub fn stride(&self, mul: &[isize]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().stride(mul)?))
    }

    pub fn pad(&self, arg: &[(usize, usize)]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().pad(arg)?))
    }

    /// Maps row-major position `flat` of the logical shape to an element of the base storage.
    ///
    /// Returns `None` when a mask hides the position (the element reads as zero).
    pub fn real_offset(&self, flat: usize) -> Option<usize> {
        let mut flat = flat;
        for view in self.views.iter().rev() {
            let dims = view.shape().static_dims()?;
            let index = unravel(flat, &dims);
            let offset = view.index(&index)?;
            if offset < 0 {
                return None;
            }
            flat = offset as usize;
        }
        Some(flat)
    }
}

/// Splits a row-major flat index into per-axis coordinates.
pub fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0usize; dims.len()];
    for (axis, &dim) in dims.iter().enumerate().rev() {
        if dim == 0 {
            continue;
        }
        index[axis] = flat % dim;
        flat /= dim;
    }
    index
}

