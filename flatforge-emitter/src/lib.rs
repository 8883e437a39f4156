//! Byte emission for the flatforge builder.
//!
//! The builder hands completed byte ranges to an [`Emit`] implementation as
//! soon as each object closes, in emission order: everything an offset refers
//! to has already been emitted when the offset goes out. This is what makes
//! streaming transports safe without buffering the whole FlatBuffer.
//!
//! [`PageEmitter`] is the default sink: a ring of fixed-size pages that grows
//! at both ends, because a FlatBuffer is built from the middle out (content
//! grows toward lower addresses, clustered vtables toward higher ones).

mod iov;
mod page;

pub use iov::{IoSlices, IOV_COUNT_MAX};
pub use page::{PageEmitter, PAGE_SIZE};

use flatforge_error::ForgeResult;
use flatforge_types::Soffset;

/// Sink for builder output.
///
/// `offset` is a position in the builder's virtual address space: negative
/// for front-emitted content, non-negative for back-emitted content (zero is
/// a valid back offset, the start of the clustered vtables). Within each
/// sign, successive calls are strictly further from the origin, so an
/// implementation may simply prepend and append.
///
/// `len` always equals `iov.len()`; it is passed separately so sinks that
/// only account sizes need not touch the slices. An error return poisons the
/// builder.
pub trait Emit {
    fn emit(&mut self, iov: &IoSlices<'_>, offset: Soffset, len: usize) -> ForgeResult<()>;

    /// Reclaim for the next buffer. The builder calls this from its own
    /// `reset`; sinks with no state between buffers need not override it.
    fn reset(&mut self) {}

    /// Release all resources. Called from the builder's `clear`.
    fn clear(&mut self) {}
}

impl<E: Emit + ?Sized> Emit for &mut E {
    fn emit(&mut self, iov: &IoSlices<'_>, offset: Soffset, len: usize) -> ForgeResult<()> {
        (**self).emit(iov, offset, len)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}
