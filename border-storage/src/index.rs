//! Indices and cursors.
//!
//! An [`Index`] addresses items of a storage on read; the same type is used
//! as the write position ([`Cursor`]) on write. It is normalized once at the
//! entry point of each operation with [`Index::positions`].
use crate::error::StorageError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// Position of items in a storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Index {
    /// A single position. Negative values count from the end.
    Int(i64),

    /// Half-open range with optional bounds and a non-zero step.
    Slice {
        /// First position, `None` for the beginning (or the end if `step < 0`).
        start: Option<i64>,
        /// End position (exclusive).
        stop: Option<i64>,
        /// Step, 1 if `None`.
        step: Option<i64>,
    },

    /// Explicit positions.
    List(Vec<i64>),

    /// One component per axis.
    ///
    /// For storages with `ndim > 1` each component addresses one of the
    /// leading axes. For ensembles the first component selects members and
    /// the rest is forwarded to them.
    Tuple(Vec<Index>),
}

/// Write position of a record in a storage.
pub type Cursor = Index;

/// Wraps a possibly negative position into `[0, len)`.
pub fn resolve_int(ix: i64, len: usize) -> Result<usize> {
    let wrapped = if ix < 0 { ix + len as i64 } else { ix };
    if wrapped < 0 || wrapped >= len as i64 {
        return Err(StorageError::Index(format!(
            "index {} is out of range for length {}",
            ix, len
        ))
        .into());
    }
    Ok(wrapped as usize)
}

/// Positions selected by a slice over a sequence of length `len`.
pub fn slice_indices(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Result<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(StorageError::Index("slice step cannot be zero".into()).into());
    }
    let len = len as i64;
    let clamp = |v: i64, lo: i64, hi: i64| {
        let v = if v < 0 { v + len } else { v };
        v.max(lo).min(hi)
    };
    let out = if step > 0 {
        let start = start.map_or(0, |v| clamp(v, 0, len));
        let stop = stop.map_or(len, |v| clamp(v, 0, len));
        (start..stop.max(start))
            .step_by(step as usize)
            .map(|i| i as usize)
            .collect()
    } else {
        let start = start.map_or(len - 1, |v| clamp(v, -1, len - 1));
        let stop = stop.map_or(-1, |v| clamp(v, -1, len - 1));
        let mut out = vec![];
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
        out
    };
    Ok(out)
}

impl Index {
    /// The whole range.
    pub fn full() -> Self {
        Index::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// A slice with explicit bounds and step 1.
    pub fn range(start: i64, stop: i64) -> Self {
        Index::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// Returns `true` for a scalar index.
    pub fn is_int(&self) -> bool {
        matches!(self, Index::Int(_))
    }

    /// Positions addressed along one axis of length `len`.
    ///
    /// Tuples cannot be reduced to a single axis and are rejected.
    pub fn positions(&self, len: usize) -> Result<Vec<usize>> {
        match self {
            Index::Int(i) => Ok(vec![resolve_int(*i, len)?]),
            Index::Slice { start, stop, step } => slice_indices(*start, *stop, *step, len),
            Index::List(ixs) => ixs.iter().map(|&i| resolve_int(i, len)).collect(),
            Index::Tuple(_) => Err(StorageError::Index(
                "a tuple index cannot address a single axis".into(),
            )
            .into()),
        }
    }

    /// Number of positions addressed along an axis of length `len`.
    pub fn count(&self, len: usize) -> Result<usize> {
        match self {
            Index::Int(_) => Ok(1),
            Index::List(ixs) => Ok(ixs.len()),
            _ => Ok(self.positions(len)?.len()),
        }
    }
}

impl From<usize> for Index {
    fn from(i: usize) -> Self {
        Index::Int(i as i64)
    }
}

impl From<i64> for Index {
    fn from(i: i64) -> Self {
        Index::Int(i)
    }
}

impl From<i32> for Index {
    fn from(i: i32) -> Self {
        Index::Int(i as i64)
    }
}

impl From<Range<usize>> for Index {
    fn from(r: Range<usize>) -> Self {
        Index::range(r.start as i64, r.end as i64)
    }
}

impl From<RangeFrom<usize>> for Index {
    fn from(r: RangeFrom<usize>) -> Self {
        Index::Slice {
            start: Some(r.start as i64),
            stop: None,
            step: None,
        }
    }
}

impl From<RangeTo<usize>> for Index {
    fn from(r: RangeTo<usize>) -> Self {
        Index::Slice {
            start: None,
            stop: Some(r.end as i64),
            step: None,
        }
    }
}

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Self {
        Index::full()
    }
}

impl From<Vec<usize>> for Index {
    fn from(ixs: Vec<usize>) -> Self {
        Index::List(ixs.into_iter().map(|i| i as i64).collect())
    }
}

impl From<Vec<i64>> for Index {
    fn from(ixs: Vec<i64>) -> Self {
        Index::List(ixs)
    }
}

impl From<&[usize]> for Index {
    fn from(ixs: &[usize]) -> Self {
        Index::List(ixs.iter().map(|&i| i as i64).collect())
    }
}
