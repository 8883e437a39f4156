//! The two-ended virtual address range and its emission primitives.
//!
//! Address zero is pinned to the first byte ever emitted. Front emissions
//! prepend, producing ever lower (negative) refs; back emissions append,
//! producing ever higher (non-negative) ones. The range is kept inside the
//! signed 32-bit offset space, slightly shy of the extremes so buffer
//! headers can always be added, which is what allows relative offsets to be
//! computed without knowing the final buffer size.

use flatforge_emitter::{Emit, IoSlices};
use flatforge_error::{forge_bail, ForgeResult};
use flatforge_types::Soffset;

use crate::refs::{Ref, VtRef};

/// Headroom kept at both extremes of the signed range.
const RANGE_MARGIN: Soffset = 16;

pub(crate) struct Stream<E> {
    pub emitter: E,
    /// Lowest emitted address, `<= 0`.
    pub start: Soffset,
    /// One past the highest emitted address, `>= 0`.
    pub end: Soffset,
}

impl<E: Emit> Stream<E> {
    pub fn new(emitter: E) -> Self {
        Self {
            emitter,
            start: 0,
            end: 0,
        }
    }

    /// Prepend `iov`, returning its new (lower) start address as the ref.
    pub fn front(&mut self, iov: &IoSlices<'_>) -> ForgeResult<Ref> {
        let start = self.preview_front(iov.len())?;
        self.emitter.emit(iov, start, iov.len())?;
        self.start = start;
        Ok(Ref(start))
    }

    /// Append `iov`, returning the biased ref of its old (lower) start so
    /// that appending at address zero stays distinguishable from failure.
    pub fn back(&mut self, iov: &IoSlices<'_>) -> ForgeResult<VtRef> {
        let at = self.end;
        let Some(end) = Soffset::try_from(iov.len())
            .ok()
            .and_then(|len| at.checked_add(len))
            .filter(|end| *end <= Soffset::MAX - RANGE_MARGIN)
        else {
            forge_bail!(Overflow: "buffer exceeds the representable offset range");
        };
        self.emitter.emit(iov, at, iov.len())?;
        self.end = end;
        Ok(VtRef::bias(at))
    }

    /// The address a front emission of `len` bytes would land at, with the
    /// range checks a real emission performs.
    pub fn preview_front(&self, len: usize) -> ForgeResult<Soffset> {
        let Some(start) = Soffset::try_from(len)
            .ok()
            .and_then(|len| self.start.checked_sub(len))
            .filter(|start| *start >= Soffset::MIN + RANGE_MARGIN)
        else {
            forge_bail!(Overflow: "buffer exceeds the representable offset range");
        };
        Ok(start)
    }
}
