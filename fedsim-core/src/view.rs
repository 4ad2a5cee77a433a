//! A read-only indexed view over a base dataset.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A per-record transformation applied on access.
pub type Transform<X> = Arc<dyn Fn(&X) -> X + Send + Sync>;

/// An error related to the construction of or the access to a [`FilteredView`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("data and targets differ in length: {data} != {targets}")]
    LengthMismatch { data: usize, targets: usize },
    #[error("position {position} out of range for a view of length {len}")]
    OutOfRange { position: usize, len: usize },
    #[error("index {index} out of bounds for a base dataset of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// A view over the records of a base dataset selected by index.
///
/// The view never mutates the base sequences, which are shared behind an
/// [`Arc`]. The record at position `p` is `transform(data[indices[p]])`,
/// paired with `target_transform(targets[indices[p]])` if the view has
/// targets. Both transforms default to the identity.
#[derive(Clone)]
pub struct FilteredView<D, T = ()> {
    indices: Vec<usize>,
    data: Arc<[D]>,
    targets: Option<Arc<[T]>>,
    transform: Option<Transform<D>>,
    target_transform: Option<Transform<T>>,
}

impl<D, T> fmt::Debug for FilteredView<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredView")
            .field("indices", &self.indices)
            .field("base_len", &self.data.len())
            .field("targets", &self.targets.is_some())
            .finish()
    }
}

impl<D, T> FilteredView<D, T>
where
    D: Clone,
    T: Clone,
{
    /// Creates a view without targets.
    pub fn new(indices: Vec<usize>, data: impl Into<Arc<[D]>>) -> Self {
        Self {
            indices,
            data: data.into(),
            targets: None,
            transform: None,
            target_transform: None,
        }
    }

    /// Creates a view with targets.
    ///
    /// # Errors
    /// Fails if `data` and `targets` have different lengths.
    pub fn with_targets(
        indices: Vec<usize>,
        data: impl Into<Arc<[D]>>,
        targets: impl Into<Arc<[T]>>,
    ) -> Result<Self, ViewError> {
        let data = data.into();
        let targets = targets.into();
        if data.len() != targets.len() {
            return Err(ViewError::LengthMismatch {
                data: data.len(),
                targets: targets.len(),
            });
        }
        Ok(Self {
            indices,
            data,
            targets: Some(targets),
            transform: None,
            target_transform: None,
        })
    }

    pub fn with_transform(mut self, transform: impl Fn(&D) -> D + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_target_transform(
        mut self,
        transform: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> Self {
        self.target_transform = Some(Arc::new(transform));
        self
    }

    /// The number of selected records.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn has_targets(&self) -> bool {
        self.targets.is_some()
    }

    /// The base indices of the selected records.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Gets the record at the given position of the view.
    ///
    /// The target is `None` iff the view has no targets.
    ///
    /// # Errors
    /// Fails if `position >= self.len()` or if the selected index lies outside
    /// of the base sequences.
    pub fn get(&self, position: usize) -> Result<(D, Option<T>), ViewError> {
        let index = *self
            .indices
            .get(position)
            .ok_or_else(|| ViewError::OutOfRange {
                position,
                len: self.len(),
            })?;
        let out_of_bounds = || ViewError::IndexOutOfBounds {
            index,
            len: self.data.len(),
        };

        let data = self.data.get(index).ok_or_else(out_of_bounds)?;
        let data = match &self.transform {
            Some(transform) => transform(data),
            None => data.clone(),
        };

        let target = match &self.targets {
            Some(targets) => {
                let target = targets.get(index).ok_or_else(out_of_bounds)?;
                Some(match &self.target_transform {
                    Some(transform) => transform(target),
                    None => target.clone(),
                })
            }
            None => None,
        };

        Ok((data, target))
    }

    /// Iterates over all records in view order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(D, Option<T>), ViewError>> + '_ {
        (0..self.len()).map(move |position| self.get(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtered_view_basic() {
        let view = FilteredView::<i32, i32>::with_targets(
            vec![1, 3],
            vec![0, 1, 2, 3, 4],
            vec![10, 11, 12, 13, 14],
        )
        .unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(0).unwrap(), (1, Some(11)));
        assert_eq!(view.get(1).unwrap(), (3, Some(13)));
    }

    #[test]
    fn test_filtered_view_no_targets() {
        let view = FilteredView::<&str>::new(vec![0, 2], vec!["img1", "img2", "img3"]);
        assert_eq!(view.len(), 2);
        assert!(!view.has_targets());
        assert_eq!(view.get(0).unwrap(), ("img1", None));
        assert_eq!(view.get(1).unwrap(), ("img3", None));
    }

    #[test]
    fn test_filtered_view_transform() {
        let view = FilteredView::<i32, i32>::with_targets(vec![0, 1], vec![1, 2, 3], vec![4, 5, 6])
            .unwrap()
            .with_transform(|x| x * 2)
            .with_target_transform(|y| y + 10);
        assert_eq!(view.get(0).unwrap(), (2, Some(14)));
        let all: Vec<_> = view.iter().map(Result::unwrap).collect();
        assert_eq!(all, vec![(2, Some(14)), (4, Some(15))]);
    }

    #[test]
    fn test_filtered_view_length_mismatch() {
        let res = FilteredView::<i32, i32>::with_targets(vec![0, 1], vec![0, 1, 2], vec![10, 11]);
        assert_eq!(
            res.unwrap_err(),
            ViewError::LengthMismatch {
                data: 3,
                targets: 2
            }
        );
    }

    #[test]
    fn test_filtered_view_empty_indices() {
        let view = FilteredView::<i32, i32>::with_targets(vec![], vec![0, 1, 2], vec![10, 11, 12])
            .unwrap();
        assert_eq!(view.len(), 0);
        assert!(view.is_empty());
        assert_eq!(
            view.get(0).unwrap_err(),
            ViewError::OutOfRange { position: 0, len: 0 }
        );
    }

    #[test]
    fn test_filtered_view_out_of_range() {
        let view =
            FilteredView::<i32, i32>::with_targets(vec![2, 0], vec![0, 1, 2], vec![10, 11, 12])
                .unwrap();
        for position in 2..5 {
            assert!(matches!(
                view.get(position),
                Err(ViewError::OutOfRange { .. })
            ));
        }

        let view = FilteredView::<i32>::new(vec![7], vec![0, 1, 2]);
        assert_eq!(
            view.get(0).unwrap_err(),
            ViewError::IndexOutOfBounds { index: 7, len: 3 }
        );
    }
}
