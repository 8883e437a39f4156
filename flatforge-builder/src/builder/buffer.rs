//! Buffer framing: headers, identifiers, size prefixes, and alignment.
//!
//! A buffer header is `[size?][root offset][identifier?][pad]`, prepended
//! once the root object is complete. Nested buffers always carry the size
//! prefix so they double as valid `[ubyte]` vectors inside their parent;
//! top-level buffers carry it on request. Block alignment pads the back of
//! a top-level buffer to a transport-friendly multiple.

use flatforge_emitter::{Emit, IoSlices};
use flatforge_error::{forge_bail, ForgeResult};
use flatforge_types::{Soffset, TypeHash, Uoffset, FIELD_SIZE, IDENTIFIER_SIZE};

use super::{Builder, DATA_LIMIT, PADDING};
use crate::frame::{ContainerKind, FrameBody};
use crate::refs::Ref;

/// Placement options for [`Builder::create_buffer`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BufferFlags {
    /// Prefix the buffer with its byte size, making the whole buffer a
    /// valid `[ubyte]` vector.
    pub with_size: bool,
    /// The buffer sits inside an enclosing buffer under construction.
    /// Implies the size prefix.
    pub nested: bool,
}

impl<E: Emit> Builder<E> {
    /// Fold the block alignment into `align` and, for a top-level buffer,
    /// pad the back cursor out to a block multiple.
    fn align_to_block(
        &mut self,
        align: &mut u16,
        block_align: u16,
        is_nested: bool,
    ) -> ForgeResult<()> {
        let block_align = match (block_align, self.block_align) {
            (0, 0) => 1,
            (0, b) => b,
            (a, _) => a,
        };
        super::require_align(block_align)?;
        *align = (*align).max(FIELD_SIZE as u16).max(block_align);
        if !is_nested {
            let end_pad = self.back_pad(block_align);
            if end_pad > 0 {
                let mut iov = IoSlices::new();
                iov.push(&PADDING[..end_pad as usize]);
                self.stream.back(&iov)?;
            }
        }
        Ok(())
    }

    /// Open a buffer. The top-level buffer has no enclosing frame
    /// requirements; a buffer started inside an open container becomes a
    /// nested buffer with its own identifier, alignment, and vtables.
    pub fn start_buffer(
        &mut self,
        identifier: Option<TypeHash>,
        block_align: u16,
        with_size: bool,
    ) -> ForgeResult<()> {
        self.scoped(|b| {
            // The parent's min_align rides in the frame's align slot: the
            // frame exit folds it back together with whatever this buffer
            // requires.
            b.enter_frame(
                ContainerKind::Buffer,
                b.min_align,
                DATA_LIMIT,
                FrameBody::Buffer {
                    saved_identifier: b.identifier,
                    saved_mark: b.buffer_mark,
                    saved_nest_id: b.nest_id,
                    saved_with_size: b.buffer_with_size,
                    saved_block_align: b.block_align,
                },
            )?;
            b.min_align = 1;
            b.block_align = block_align;
            b.buffer_with_size = with_size;
            b.buffer_mark = b.stream.start;
            b.nest_id = b.nest_count;
            b.nest_count += 1;
            b.identifier = identifier.unwrap_or(0);
            Ok(())
        })
    }

    /// Close the open buffer around `root` and emit its header. Returns the
    /// buffer ref: for a nested buffer, the value to store in the parent's
    /// `[ubyte]` field.
    pub fn end_buffer(&mut self, root: Ref) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Buffer)?;
            let flags = BufferFlags {
                with_size: b.buffer_with_size,
                nested: !b.is_top_buffer(),
            };
            b.bump_min_align(b.block_align);
            let r = b.buffer_header(b.identifier, b.block_align, root, b.min_align, flags)?;
            let FrameBody::Buffer {
                saved_identifier,
                saved_mark,
                saved_nest_id,
                saved_with_size,
                saved_block_align,
            } = *b.frame_body()
            else {
                forge_bail!("buffer frame body mismatch");
            };
            b.buffer_mark = saved_mark;
            b.nest_id = saved_nest_id;
            b.identifier = saved_identifier;
            b.buffer_with_size = saved_with_size;
            b.block_align = saved_block_align;
            b.exit_frame();
            log::trace!("buffer closed at {} bytes", b.buffer_size());
            Ok(r)
        })
    }

    /// Frameless buffer header emission for callers managing nesting
    /// themselves with [`Builder::push_buffer_alignment`] /
    /// [`Builder::pop_buffer_alignment`].
    pub fn create_buffer(
        &mut self,
        identifier: Option<TypeHash>,
        block_align: u16,
        root: Ref,
        align: u16,
        flags: BufferFlags,
    ) -> ForgeResult<Ref> {
        self.scoped(|b| b.buffer_header(identifier.unwrap_or(0), block_align, root, align, flags))
    }

    /// Wrap an already serialized buffer as a nested `[ubyte]`-style object
    /// with its alignment preserved.
    ///
    /// Inside an open buffer (or with `with_size`) the data is prefixed
    /// with a size field so the result reads as a `[ubyte]` vector; embedded
    /// with neither, the bytes pass straight through to the emitter. An
    /// `align` of 0 defaults to 8, enough for any FlatBuffers scalar, since
    /// the internal alignment of a foreign buffer is rarely known.
    pub fn embed_buffer(
        &mut self,
        block_align: u16,
        data: &[u8],
        align: u16,
        with_size: bool,
    ) -> ForgeResult<Ref> {
        self.scoped(|b| {
            let nested = !b.is_top_buffer();
            let mut align = if align == 0 { 8 } else { align };
            super::require_align(align)?;
            b.align_to_block(&mut align, block_align, nested)?;
            b.bump_min_align(align);
            // With an explicit size request the size field itself lands
            // aligned; otherwise the data does, with the prefix just before
            // it.
            let aligned_len = data.len() + if with_size { FIELD_SIZE } else { 0 };
            let pad = b.front_pad(aligned_len as Uoffset, align);
            let size_field = ((data.len() as Uoffset) + pad).to_le_bytes();
            let mut iov = IoSlices::new();
            if nested || with_size {
                iov.push(&size_field);
            }
            iov.push(data);
            iov.push(&PADDING[..pad as usize]);
            b.stream.front(&iov)
        })
    }

    fn buffer_header(
        &mut self,
        identifier: TypeHash,
        block_align: u16,
        root: Ref,
        align: u16,
        flags: BufferFlags,
    ) -> ForgeResult<Ref> {
        if root.is_null() {
            forge_bail!("buffer root cannot be null");
        }
        let mut align = align;
        if align != 0 {
            super::require_align(align)?;
        }
        self.align_to_block(&mut align, block_align, flags.nested)?;
        self.bump_min_align(align);
        let id_bytes = identifier.to_le_bytes();
        let id_size = if identifier != 0 { IDENTIFIER_SIZE } else { 0 };
        let prefixed = flags.nested || flags.with_size;
        // A nested buffer's size prefix is the parent's vector count and
        // stays outside the alignment computation; an explicitly requested
        // prefix belongs to this buffer and is aligned with it.
        let header = FIELD_SIZE + id_size + if flags.with_size { FIELD_SIZE } else { 0 };
        let header_pad = self.front_pad(header as Uoffset, align);
        let prefix_size = if prefixed { FIELD_SIZE } else { 0 };
        let iov_len = prefix_size + FIELD_SIZE + id_size + header_pad as usize;
        let mut base = self.stream.preview_front(iov_len)?;
        if prefixed {
            base += FIELD_SIZE as Soffset;
        }
        let buffer_size: Uoffset = if flags.nested {
            (self.buffer_mark as Uoffset).wrapping_sub(base as Uoffset)
        } else {
            // A top-level size also covers the clustered vtables and any
            // block padding behind them.
            (self.stream.end as Uoffset).wrapping_sub(base as Uoffset)
        };
        let size_field = buffer_size.to_le_bytes();
        let offset_field = (root.addr() as Uoffset)
            .wrapping_sub(base as Uoffset)
            .to_le_bytes();
        let mut iov = IoSlices::new();
        if prefixed {
            iov.push(&size_field);
        }
        iov.push(&offset_field);
        iov.push(&id_bytes[..id_size]);
        iov.push(&PADDING[..header_pad as usize]);
        self.stream.front(&iov)
    }

    /// Stash the buffer alignment before manually constructing a nested
    /// region, returning the value to pass back to
    /// [`Builder::pop_buffer_alignment`].
    pub fn push_buffer_alignment(&mut self) -> u16 {
        let pushed = self.min_align;
        self.min_align = FIELD_SIZE as u16;
        pushed
    }

    /// Restore a stashed buffer alignment, folding in whatever the nested
    /// region required.
    pub fn pop_buffer_alignment(&mut self, pushed_align: u16) {
        self.bump_min_align(pushed_align);
    }
}
