//! The builder state machine.
//!
//! State is grouped by concern: the emission stream (virtual address range
//! plus the sink), the data stack holding open container content, the
//! vtable build stack and patch log for the open table, the vtable
//! dedup cache, the frame stack, and the user frame stack. All working
//! storage is index-addressed so growth never invalidates anything.

mod buffer;
mod table;
mod vector;

pub use buffer::BufferFlags;

use flatforge_emitter::{Emit, IoSlices, PageEmitter};
use flatforge_error::{forge_bail, ForgeError, ForgeExpect, ForgeResult};
use flatforge_types::{align_up, Soffset, TypeHash, Uoffset, Utype, Voffset, FIELD_SIZE};

use crate::aligned::AlignedBytes;
use crate::arena::Arena;
use crate::frame::{ContainerKind, Frame, FrameBody};
use crate::refs::Ref;
use crate::stream::Stream;
use table::VtDescriptor;

/// Largest data-stack fill for a table body: field positions must fit a
/// voffset after the vtable-pointer field is accounted for.
pub(crate) const TABLE_LIMIT: Uoffset = Voffset::MAX as Uoffset - FIELD_SIZE as Uoffset + 1;
/// Largest data-stack fill for anything else.
pub(crate) const DATA_LIMIT: Uoffset = Uoffset::MAX - FIELD_SIZE as Uoffset + 1;

/// Shared zero bytes for padding emission. Large enough for two maximal
/// 255-byte paddings meeting at a nested buffer edge, plus string
/// termination.
pub(crate) static PADDING: [u8; 512] = [0; 512];

const DS_FLOOR: usize = 256;
const VS_FLOOR: usize = 16;
const US_FLOOR: usize = 64;

/// Alignments must be nonzero powers of two no larger than 256, the
/// FlatBuffers maximum; anything else corrupts the padding masks or
/// overruns the shared padding table.
pub(crate) fn require_align(align: u16) -> ForgeResult<()> {
    if align == 0 || !align.is_power_of_two() || align > 256 {
        forge_bail!("alignment {} is not a power of two up to 256", align);
    }
    Ok(())
}

/// A union member: discriminator plus value ref. `utype` zero (NONE) pairs
/// with a null ref, and only then.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct UnionRef {
    pub utype: Utype,
    pub value: Ref,
}

impl UnionRef {
    pub const NONE: UnionRef = UnionRef {
        utype: 0,
        value: Ref::NULL,
    };

    pub fn new(utype: Utype, value: Ref) -> Self {
        Self { utype, value }
    }
}

/// A completed union vector: parallel type and value vectors, stored in two
/// table fields.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct UnionVecRef {
    pub types: Ref,
    pub values: Ref,
}

/// Streaming FlatBuffers builder over an [`Emit`] sink.
///
/// Created with [`Builder::new`] for the default page-ring sink or
/// [`Builder::with_emitter`] for a custom one. A builder may be reused for
/// any number of buffers; [`Builder::reset`] reclaims content while keeping
/// allocations warm, [`Builder::clear`] releases everything.
///
/// Any operation error leaves the builder poisoned: further operations
/// return [`ForgeError::Poisoned`] until `reset` or `clear`.
pub struct Builder<E: Emit = PageEmitter> {
    pub(crate) stream: Stream<E>,

    /// Data stack: bytes of the open containers, innermost window at
    /// `ds_first..ds_first + ds_offset`.
    pub(crate) ds: Arena<u8>,
    pub(crate) ds_first: Uoffset,
    pub(crate) ds_offset: Uoffset,

    /// Vtable build stack. The open table's entries start at `vs_base`,
    /// with two header slots reserved just below.
    pub(crate) vs: Arena<Voffset>,
    pub(crate) vs_base: usize,
    /// One past the highest field id added to the open table.
    pub(crate) id_end: u16,
    /// Incremental hash over the open table's (id, size) additions.
    pub(crate) vt_hash: u32,

    /// Patch log: table-relative positions of offset fields awaiting
    /// ref-to-relative rewrite at table close.
    pub(crate) pl: Vec<Voffset>,

    pub(crate) frames: Vec<Frame>,

    /// Vtable dedup cache: bucket heads, descriptors (slot 0 is a null
    /// sentinel), and cached vtable words.
    pub(crate) ht: Vec<Uoffset>,
    pub(crate) ht_width: u32,
    pub(crate) vd: Vec<VtDescriptor>,
    pub(crate) vb: Vec<Voffset>,
    /// Wire encoding of the vtable currently being emitted.
    pub(crate) vt_scratch: Vec<u8>,

    /// User frame stack for driver state parallel to builder nesting.
    us: Arena<u8>,
    user_frame_offset: usize,
    user_frame_end: usize,

    /// Strongest alignment seen in the current buffer.
    pub(crate) min_align: u16,
    /// The open object's own alignment, isolated from nested activity.
    pub(crate) align: u16,
    pub(crate) block_align: u16,
    /// End of the innermost nested buffer; 0 at top level.
    pub(crate) buffer_mark: Soffset,
    pub(crate) nest_count: Uoffset,
    /// 0 in the top-level buffer, unique per nested buffer otherwise.
    pub(crate) nest_id: Uoffset,
    pub(crate) identifier: TypeHash,
    pub(crate) buffer_with_size: bool,

    pub(crate) max_level: usize,
    pub(crate) vb_flush_limit: usize,
    pub(crate) disable_vt_clustering: bool,
    pub(crate) allow_repeat_table_add: bool,

    poisoned: bool,
}

impl Builder<PageEmitter> {
    pub fn new() -> Self {
        Self::with_emitter(PageEmitter::new())
    }

    /// The finished buffer as one borrowed slice, when it fits on a single
    /// emitter page.
    pub fn direct_buffer(&self) -> Option<&[u8]> {
        self.stream.emitter.direct_buffer()
    }

    /// Copy the finished buffer into `dst`, which must hold at least
    /// [`Builder::buffer_size`] bytes.
    pub fn copy_buffer_to(&self, dst: &mut [u8]) -> ForgeResult<()> {
        self.stream.emitter.copy_buffer(dst)
    }

    /// The finished buffer in a fresh allocation.
    pub fn finalize_buffer(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.buffer_size()];
        self.stream
            .emitter
            .copy_buffer(&mut out)
            .forge_expect("destination sized to the emitted length");
        out
    }

    /// The finished buffer in an allocation aligned to the buffer's
    /// alignment, with the size rounded up to a multiple of it.
    pub fn finalize_aligned_buffer(&self) -> ForgeResult<AlignedBytes> {
        let align = self.buffer_alignment().max(1) as usize;
        let size = align_up(self.buffer_size(), align);
        let mut out = AlignedBytes::zeroed(size, align)?;
        self.stream.emitter.copy_buffer(&mut out)?;
        Ok(out)
    }
}

impl Default for Builder<PageEmitter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Emit> Builder<E> {
    pub fn with_emitter(emitter: E) -> Self {
        Self {
            stream: Stream::new(emitter),
            ds: Arena::with_floor(DS_FLOOR),
            ds_first: 0,
            ds_offset: 0,
            vs: Arena::with_floor(VS_FLOOR),
            vs_base: 0,
            id_end: 0,
            vt_hash: 0,
            pl: Vec::new(),
            frames: Vec::new(),
            ht: Vec::new(),
            ht_width: 0,
            vd: Vec::new(),
            vb: Vec::new(),
            vt_scratch: Vec::new(),
            us: Arena::with_floor(US_FLOOR),
            user_frame_offset: 0,
            user_frame_end: 0,
            min_align: 0,
            align: 0,
            block_align: 0,
            buffer_mark: 0,
            nest_count: 0,
            nest_id: 0,
            identifier: 0,
            buffer_with_size: false,
            max_level: 0,
            vb_flush_limit: 0,
            disable_vt_clustering: false,
            allow_repeat_table_add: false,
            poisoned: false,
        }
    }

    /// Reclaim all content for the next buffer. Configuration, the
    /// identifier, and the block alignment survive; working allocations are
    /// kept warm.
    pub fn reset(&mut self) {
        self.reset_with(false, false);
    }

    /// [`Builder::reset`] with control over restoring configuration
    /// defaults and shrinking working allocations back toward their floors.
    pub fn reset_with(&mut self, set_defaults: bool, reduce_buffers: bool) {
        self.ds.reset(reduce_buffers);
        self.vs.reset(reduce_buffers);
        self.us.reset(reduce_buffers);
        self.pl.clear();
        self.frames.clear();
        self.ht.fill(0);
        self.vd.truncate(self.vd.len().min(1));
        self.vb.clear();
        self.vt_scratch.clear();
        self.ds_first = 0;
        self.ds_offset = 0;
        self.vs_base = 0;
        self.id_end = 0;
        self.vt_hash = 0;
        self.user_frame_offset = 0;
        self.user_frame_end = 0;
        self.min_align = 0;
        self.align = 0;
        self.buffer_mark = 0;
        self.nest_count = 0;
        self.nest_id = 0;
        self.buffer_with_size = false;
        self.stream.start = 0;
        self.stream.end = 0;
        self.poisoned = false;
        if set_defaults {
            self.max_level = 0;
            self.vb_flush_limit = 0;
            self.disable_vt_clustering = false;
            self.allow_repeat_table_add = false;
        }
        self.stream.emitter.reset();
    }

    /// Release all memory and return to the freshly constructed state.
    pub fn clear(&mut self) {
        self.ds.clear();
        self.vs.clear();
        self.us.clear();
        self.pl = Vec::new();
        self.frames = Vec::new();
        self.ht = Vec::new();
        self.ht_width = 0;
        self.vd = Vec::new();
        self.vb = Vec::new();
        self.vt_scratch = Vec::new();
        self.reset_with(true, false);
        self.identifier = 0;
        self.block_align = 0;
        self.stream.emitter.clear();
    }

    pub fn emitter(&self) -> &E {
        &self.stream.emitter
    }

    pub fn emitter_mut(&mut self) -> &mut E {
        &mut self.stream.emitter
    }

    pub fn into_emitter(self) -> E {
        self.stream.emitter
    }

    // --- configuration ---

    /// Cap the nesting depth; 0 means unlimited. Useful to drivers such as
    /// parsers that mirror builder nesting on their own stack.
    pub fn set_max_level(&mut self, max_level: usize) {
        self.max_level = max_level;
    }

    /// Flush the vtable dedup cache whenever its byte size would exceed
    /// `limit`; 0 disables flushing.
    pub fn set_vtable_cache_limit(&mut self, limit: usize) {
        self.vb_flush_limit = limit;
    }

    /// Default block alignment applied to buffers that do not choose their
    /// own.
    pub fn set_block_align(&mut self, block_align: u16) {
        self.block_align = block_align;
    }

    /// Identifier for buffers started without one; `None` or a zero hash
    /// omits the identifier field.
    pub fn set_identifier(&mut self, identifier: Option<TypeHash>) {
        self.identifier = identifier.unwrap_or(0);
    }

    /// Enable or disable clustering of top-level vtables at the high end of
    /// the buffer.
    pub fn set_vtable_clustering(&mut self, enable: bool) {
        self.disable_vt_clustering = !enable;
    }

    /// Allow adding the same field id twice: the existing slot is returned
    /// (and for offset fields, overwritten) instead of failing.
    pub fn set_allow_repeat_table_add(&mut self, allow: bool) {
        self.allow_repeat_table_add = allow;
    }

    // --- accessors ---

    /// Current nesting depth.
    pub fn level(&self) -> usize {
        self.frames.len()
    }

    /// Kind of the innermost open container.
    pub fn container_kind(&self) -> ContainerKind {
        self.frames.last().map_or(ContainerKind::Empty, |f| f.kind)
    }

    /// Kind of the container open at 1-based `level`.
    pub fn container_kind_at(&self, level: usize) -> ContainerKind {
        if level == 0 || level > self.frames.len() {
            return ContainerKind::Empty;
        }
        self.frames[level - 1].kind
    }

    /// Total bytes emitted so far; the final buffer size once the
    /// top-level buffer has ended.
    pub fn buffer_size(&self) -> usize {
        (self.stream.end - self.stream.start) as usize
    }

    /// Lowest emitted virtual address; the buffer start after close.
    pub fn buffer_start(&self) -> Soffset {
        self.stream.start
    }

    /// One past the highest emitted virtual address.
    pub fn buffer_end(&self) -> Soffset {
        self.stream.end
    }

    /// The alignment the finished buffer requires.
    pub fn buffer_alignment(&self) -> u16 {
        self.min_align
    }

    pub(crate) fn is_top_buffer(&self) -> bool {
        self.nest_id == 0
    }

    // --- poisoning ---

    fn ready(&self) -> ForgeResult<()> {
        if self.poisoned {
            return Err(ForgeError::Poisoned);
        }
        Ok(())
    }

    pub(crate) fn fail(&mut self, e: ForgeError) -> ForgeError {
        self.poisoned = true;
        e
    }

    /// Run a fallible operation under the poisoned-state rule: refuse when
    /// already poisoned, poison on failure.
    pub(crate) fn scoped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> ForgeResult<T>,
    ) -> ForgeResult<T> {
        self.ready()?;
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e)),
        }
    }

    // --- frames ---

    pub(crate) fn expect_kind(&self, kind: ContainerKind) -> ForgeResult<()> {
        if self.container_kind() != kind {
            forge_bail!("expected an open {}, found {}", kind, self.container_kind());
        }
        Ok(())
    }

    /// Open a container: snapshot the parent's data-stack window and active
    /// alignment, then start a fresh 8-aligned window.
    pub(crate) fn enter_frame(
        &mut self,
        kind: ContainerKind,
        align: u16,
        type_limit: Uoffset,
        body: FrameBody,
    ) -> ForgeResult<()> {
        if self.max_level > 0 && self.frames.len() >= self.max_level {
            forge_bail!("nesting depth {} exceeds the configured cap", self.max_level);
        }
        self.frames.push(Frame {
            kind,
            saved_ds_first: self.ds_first,
            saved_ds_offset: self.ds_offset,
            saved_align: self.align,
            type_limit,
            body,
        });
        self.align = align;
        self.ds_first = align_up((self.ds_first + self.ds_offset) as usize, 8) as Uoffset;
        self.ds_offset = 0;
        Ok(())
    }

    /// Close the innermost container: zero its data-stack window, restore
    /// the parent's, and fold the child's alignment requirement into the
    /// buffer minimum.
    pub(crate) fn exit_frame(&mut self) {
        let frame = self
            .frames
            .pop()
            .forge_expect("exit_frame callers verified an open frame");
        let first = self.ds_first as usize;
        let used = self.ds_offset as usize;
        if used > 0 {
            self.ds[first..first + used].fill(0);
        }
        self.ds_first = frame.saved_ds_first;
        self.ds_offset = frame.saved_ds_offset;
        self.min_align = self.min_align.max(self.align);
        self.align = frame.saved_align;
    }

    pub(crate) fn frame_body(&self) -> &FrameBody {
        self.frames
            .last()
            .map(|f| &f.body)
            .forge_expect("frame_body callers verified an open frame")
    }

    pub(crate) fn frame_body_mut(&mut self) -> &mut FrameBody {
        self.frames
            .last_mut()
            .map(|f| &mut f.body)
            .forge_expect("frame_body callers verified an open frame")
    }

    // --- data stack ---

    /// Reserve `size` bytes on the open container's window, returning the
    /// window-relative offset. One spare zero byte beyond the fill is kept
    /// addressable so string content is always terminated on the stack.
    pub(crate) fn push_ds(&mut self, size: Uoffset) -> ForgeResult<Uoffset> {
        let limit = self
            .frames
            .last()
            .map_or(DATA_LIMIT, |f| f.type_limit);
        let offset = self.ds_offset;
        let Some(fill) = offset.checked_add(size).filter(|f| *f <= limit) else {
            forge_bail!(Overflow: "container exceeds its {} byte representation", limit);
        };
        self.ds_offset = fill;
        self.ds
            .grow_to(self.ds_first as usize + fill as usize + 1);
        Ok(offset)
    }

    /// Give back `size` bytes from the top of the window, zeroing them.
    pub(crate) fn unpush_ds(&mut self, size: Uoffset) {
        self.ds_offset -= size;
        let at = (self.ds_first + self.ds_offset) as usize;
        self.ds[at..at + size as usize].fill(0);
    }

    pub(crate) fn push_ds_copy(&mut self, data: &[u8]) -> ForgeResult<Uoffset> {
        let offset = self.push_ds(data.len() as Uoffset)?;
        let at = (self.ds_first + offset) as usize;
        self.ds[at..at + data.len()].copy_from_slice(data);
        Ok(offset)
    }

    /// The open container's bytes.
    pub(crate) fn ds_window(&mut self) -> &mut [u8] {
        let first = self.ds_first as usize;
        &mut self.ds[first..first + self.ds_offset as usize]
    }

    /// Residue that aligns a front emission of `size` bytes to `align`.
    pub(crate) fn front_pad(&self, size: Uoffset, align: u16) -> Uoffset {
        (self.stream.start.wrapping_sub(size as Soffset) as Uoffset) & (align as Uoffset - 1)
    }

    /// Padding that brings the back cursor up to a multiple of `align`.
    pub(crate) fn back_pad(&self, align: u16) -> Uoffset {
        (self.stream.end.wrapping_neg() as Uoffset) & (align as Uoffset - 1)
    }

    pub(crate) fn bump_min_align(&mut self, align: u16) {
        self.min_align = self.min_align.max(align);
    }

    // --- structs ---

    /// Open a struct and reserve its bytes on the data stack; fill them via
    /// [`Builder::struct_bytes`].
    pub fn start_struct(&mut self, size: usize, align: u16) -> ForgeResult<()> {
        self.scoped(|b| {
            require_align(align)?;
            b.enter_frame(ContainerKind::Struct, align, DATA_LIMIT, FrameBody::None)?;
            b.push_ds(size as Uoffset)?;
            Ok(())
        })
    }

    /// The open struct's bytes.
    pub fn struct_bytes(&mut self) -> ForgeResult<&mut [u8]> {
        self.ready()?;
        if let Err(e) = self.expect_kind(ContainerKind::Struct) {
            return Err(self.fail(e));
        }
        Ok(self.ds_window())
    }

    pub fn end_struct(&mut self) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Struct)?;
            let first = b.ds_first as usize;
            let size = b.ds_offset;
            let align = b.align;
            let r = b.emit_struct_parts(first, size, align)?;
            b.exit_frame();
            Ok(r)
        })
    }

    /// One-shot struct emission from caller bytes, already little-endian.
    pub fn create_struct(&mut self, data: &[u8], align: u16) -> ForgeResult<Ref> {
        self.scoped(|b| {
            require_align(align)?;
            b.bump_min_align(align);
            let pad = b.front_pad(data.len() as Uoffset, align);
            let mut iov = IoSlices::new();
            iov.push(data);
            iov.push(&PADDING[..pad as usize]);
            b.stream.front(&iov)
        })
    }

    fn emit_struct_parts(&mut self, first: usize, size: Uoffset, align: u16) -> ForgeResult<Ref> {
        self.bump_min_align(align);
        let pad = self.front_pad(size, align);
        let mut iov = IoSlices::new();
        iov.push(&self.ds[first..first + size as usize]);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }

    // --- user frames ---

    /// Push a zeroed user frame of at least `size` bytes and return its
    /// handle. The user frame stack lets drivers keep per-level state
    /// without owning a parallel stack; it is independent of builder
    /// nesting.
    pub fn enter_user_frame(&mut self, size: usize) -> usize {
        let word = size_of::<usize>();
        let total = align_up(size, word) + word;
        self.us.grow_to(self.user_frame_end + total);
        self.us[self.user_frame_end..self.user_frame_end + total].fill(0);
        self.us[self.user_frame_end..self.user_frame_end + word]
            .copy_from_slice(&self.user_frame_offset.to_ne_bytes());
        self.user_frame_offset = self.user_frame_end + word;
        self.user_frame_end += total;
        self.user_frame_offset
    }

    /// Pop the top user frame, returning the handle of the frame below (or
    /// 0 when the stack empties).
    pub fn exit_user_frame(&mut self) -> usize {
        debug_assert!(self.user_frame_offset > 0);
        if self.user_frame_offset == 0 {
            return 0;
        }
        let word = size_of::<usize>();
        let mut raw = [0u8; size_of::<usize>()];
        raw.copy_from_slice(&self.us[self.user_frame_offset - word..self.user_frame_offset]);
        self.user_frame_end = self.user_frame_offset - word;
        self.user_frame_offset = usize::from_ne_bytes(raw);
        self.user_frame_offset
    }

    /// Pop user frames until `handle` is the top, then pop it too.
    pub fn exit_user_frame_at(&mut self, handle: usize) -> usize {
        debug_assert!(self.user_frame_offset >= handle);
        self.user_frame_offset = handle;
        self.exit_user_frame()
    }

    /// Handle of the top user frame; 0 when none is open.
    pub fn current_user_frame(&self) -> usize {
        self.user_frame_offset
    }

    /// Payload bytes of the frame at `handle`, up to the top of the stack.
    pub fn user_frame_bytes(&mut self, handle: usize) -> &mut [u8] {
        &mut self.us[handle..self.user_frame_end]
    }
}

#[cfg(test)]
mod test {
    use flatforge_error::ForgeError;
    use itertools::Itertools;
    use rstest::rstest;

    use super::*;
    use crate::frame::ContainerKind;
    use crate::refs::Ref;

    /// Wire bytes of the vtable for a table holding a single u16 at id 0:
    /// vt_size 6, table_size 6, field at offset 4.
    const U16_TABLE_VTABLE: [u8; 6] = [6, 0, 6, 0, 4, 0];

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        (0..haystack.len().saturating_sub(needle.len() - 1))
            .filter(|&i| &haystack[i..i + needle.len()] == needle)
            .count()
    }

    fn u16_table(b: &mut Builder, value: u16) -> Ref {
        b.start_table(1).unwrap();
        b.table_add_scalar(0, value).unwrap();
        b.end_table().unwrap()
    }

    #[test]
    fn single_field_table_buffer_layout() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let root = u16_table(&mut b, 0x1234);
        b.end_buffer(root).unwrap();

        let bytes = b.finalize_buffer();
        assert_eq!(
            bytes,
            [
                4, 0, 0, 0, // root offset
                0xF8, 0xFF, 0xFF, 0xFF, // vtable offset -8
                0x34, 0x12, 0, 0, // u16 field plus table padding
                6, 0, 6, 0, 4, 0, // clustered vtable
            ]
        );
        assert_eq!(b.buffer_size(), bytes.len());
        assert_eq!(b.buffer_alignment(), 4);
    }

    #[test]
    fn identical_tables_share_a_vtable() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let first = u16_table(&mut b, 1);
        let second = u16_table(&mut b, 2);
        assert_ne!(first, second);
        let refs = [first, second];
        let vec = b.create_offset_vector(&refs).unwrap();
        b.start_table(1).unwrap();
        b.table_add_offset(0, vec).unwrap();
        let root = b.end_table().unwrap();
        b.end_buffer(root).unwrap();

        let bytes = b.finalize_buffer();
        assert_eq!(count_occurrences(&bytes, &U16_TABLE_VTABLE), 1);
    }

    #[test]
    fn nested_buffers_do_not_share_vtables() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();

        let mut nested = Vec::new();
        for value in [7u16, 9] {
            b.start_buffer(None, 0, false).unwrap();
            let root = u16_table(&mut b, value);
            nested.push(b.end_buffer(root).unwrap());
        }
        assert_ne!(nested[0], nested[1]);

        b.start_table(2).unwrap();
        b.table_add_offset(0, nested[0]).unwrap();
        b.table_add_offset(1, nested[1]).unwrap();
        let root = b.end_table().unwrap();
        b.end_buffer(root).unwrap();

        // One emitted copy per nested buffer; the cache only spares the
        // comparison bytes.
        let bytes = b.finalize_buffer();
        assert_eq!(count_occurrences(&bytes, &U16_TABLE_VTABLE), 2);
    }

    #[test]
    fn vtable_cache_flush_forces_reemission() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let first = u16_table(&mut b, 1);
        b.flush_vtable_cache();
        let second = u16_table(&mut b, 2);
        let refs = [first, second];
        let vec = b.create_offset_vector(&refs).unwrap();
        b.start_table(1).unwrap();
        b.table_add_offset(0, vec).unwrap();
        let root = b.end_table().unwrap();
        b.end_buffer(root).unwrap();

        let bytes = b.finalize_buffer();
        assert_eq!(count_occurrences(&bytes, &U16_TABLE_VTABLE), 2);
    }

    #[test]
    fn duplicate_field_id_is_rejected_by_default() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_table(1).unwrap();
        b.table_add_scalar(0, 1u16).unwrap();
        assert!(matches!(
            b.table_add_scalar(0, 2u16),
            Err(ForgeError::InvalidUsage(_))
        ));
    }

    #[test]
    fn repeat_add_returns_the_existing_slot() {
        let mut direct = Builder::new();
        direct.start_buffer(None, 0, false).unwrap();
        let root = u16_table(&mut direct, 0xBEEF);
        direct.end_buffer(root).unwrap();

        let mut repeated = Builder::new();
        repeated.set_allow_repeat_table_add(true);
        repeated.start_buffer(None, 0, false).unwrap();
        repeated.start_table(1).unwrap();
        repeated.table_add_scalar(0, 0x1111u16).unwrap();
        repeated.table_add_scalar(0, 0xBEEFu16).unwrap();
        let root = repeated.end_table().unwrap();
        repeated.end_buffer(root).unwrap();

        assert_eq!(direct.finalize_buffer(), repeated.finalize_buffer());
    }

    #[test]
    fn errors_poison_until_reset() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        // Ending a table with no table open is a usage error.
        assert!(matches!(b.end_table(), Err(ForgeError::InvalidUsage(_))));
        assert!(matches!(b.start_table(1), Err(ForgeError::Poisoned)));
        assert!(matches!(b.end_buffer(Ref(-4)), Err(ForgeError::Poisoned)));

        b.reset();
        b.start_buffer(None, 0, false).unwrap();
        let root = u16_table(&mut b, 3);
        assert!(b.end_buffer(root).is_ok());
    }

    #[test]
    fn reset_reproduces_identical_buffers() {
        let mut b = Builder::new();
        let mut first = Vec::new();
        for round in 0..2 {
            b.start_buffer(None, 0, false).unwrap();
            let root = u16_table(&mut b, 0x4242);
            b.end_buffer(root).unwrap();
            if round == 0 {
                first = b.finalize_buffer();
                b.reset();
            }
        }
        assert_eq!(first, b.finalize_buffer());
    }

    #[test]
    fn max_level_caps_nesting() {
        let mut b = Builder::new();
        b.set_max_level(1);
        b.start_buffer(None, 0, false).unwrap();
        assert!(matches!(b.start_table(0), Err(ForgeError::InvalidUsage(_))));
    }

    #[test]
    fn container_kinds_track_nesting() {
        let mut b = Builder::new();
        assert_eq!(b.container_kind(), ContainerKind::Empty);
        b.start_buffer(None, 0, false).unwrap();
        assert_eq!(b.container_kind(), ContainerKind::Buffer);
        b.start_table(1).unwrap();
        b.start_vector(4, 4, 100).unwrap();
        assert_eq!(b.level(), 3);
        assert_eq!(b.container_kind(), ContainerKind::Vector);
        assert_eq!(b.container_kind_at(1), ContainerKind::Buffer);
        assert_eq!(b.container_kind_at(2), ContainerKind::Table);
        assert_eq!(b.container_kind_at(4), ContainerKind::Empty);
    }

    #[test]
    fn required_and_union_field_checks() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let value = u16_table(&mut b, 5);
        b.start_table(4).unwrap();
        b.table_add_scalar(0, 1u8).unwrap();
        assert!(b.check_required(&[0]));
        assert!(!b.check_required(&[0, 1]));

        // Union pair at ids 2 (type) and 3 (value); absent so far.
        assert!(b.check_union_field(3));
        b.table_add_union(3, UnionRef::new(1, value)).unwrap();
        assert!(b.check_union_field(3));
        assert!(b.check_required(&[2, 3]));
    }

    #[test]
    fn explicit_none_union_stores_only_the_discriminator() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_table(2).unwrap();
        b.table_add_union(1, UnionRef::NONE).unwrap();
        assert!(b.check_union_field(1));
        assert!(b.check_required(&[0]));
        assert!(!b.check_required(&[1]));
        let root = b.end_table().unwrap();
        assert!(b.end_buffer(root).is_ok());
    }

    #[test]
    fn mismatched_union_member_is_rejected() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_table(2).unwrap();
        assert!(b.table_add_union(1, UnionRef::new(0, Ref(-4))).is_err());
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(12)]
    #[case(512)]
    fn unusable_alignments_are_rejected(#[case] align: u16) {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        assert!(matches!(
            b.create_struct(&[0u8; 4], align),
            Err(ForgeError::InvalidUsage(_))
        ));
    }

    #[test]
    fn truncate_past_empty_is_rejected() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_vector(2, 2, 100).unwrap();
        b.vector_push(&[1, 0]).unwrap();
        b.truncate_vector(1).unwrap();
        assert!(matches!(
            b.truncate_vector(1),
            Err(ForgeError::InvalidUsage(_))
        ));
    }

    #[test]
    fn offset_vector_rejects_null_elements() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_offset_vector().unwrap();
        b.offset_vector_push(Ref::NULL).unwrap();
        assert!(matches!(
            b.end_offset_vector(),
            Err(ForgeError::InvalidUsage(_))
        ));
    }

    #[test]
    fn union_vector_pairs_types_and_values() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let table = u16_table(&mut b, 11);
        b.start_union_vector().unwrap();
        b.union_vector_push(UnionRef::new(2, table)).unwrap();
        b.union_vector_push(UnionRef::NONE).unwrap();
        assert_eq!(b.union_vector_count(), 2);
        let uv = b.end_union_vector().unwrap();
        assert!(!uv.types.is_null());
        assert!(!uv.values.is_null());

        b.start_table(3).unwrap();
        b.table_add_union_vector(2, uv).unwrap();
        let root = b.end_table().unwrap();
        assert!(b.end_buffer(root).is_ok());
    }

    #[test]
    fn vector_stack_ops_compose() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_vector(2, 2, 1000).unwrap();
        b.vector_push(&1u16.to_le_bytes()).unwrap();
        let tail = (2u16..5).flat_map(|v| v.to_le_bytes()).collect_vec();
        b.append_vector(&tail).unwrap();
        assert_eq!(b.vector_count(), 4);
        b.truncate_vector(1).unwrap();
        let v = b.end_vector().unwrap();
        b.start_table(1).unwrap();
        b.table_add_offset(0, v).unwrap();
        let root = b.end_table().unwrap();
        assert!(b.end_buffer(root).is_ok());
    }

    #[test]
    fn strings_support_append_and_truncate() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_string().unwrap();
        b.append_string("hello, wo").unwrap();
        b.append_string("rldXX").unwrap();
        b.truncate_string(2).unwrap();
        assert_eq!(b.string_len(), 12);
        assert_eq!(b.string_bytes().unwrap(), b"hello, world");
        let s = b.end_string().unwrap();
        b.start_table(1).unwrap();
        b.table_add_offset(0, s).unwrap();
        let root = b.end_table().unwrap();
        assert!(b.end_buffer(root).is_ok());
    }

    #[test]
    fn struct_stack_matches_one_shot() {
        let mut staged = Builder::new();
        staged.start_buffer(None, 0, false).unwrap();
        staged.start_struct(8, 4).unwrap();
        staged
            .struct_bytes()
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let root = staged.end_struct().unwrap();
        staged.end_buffer(root).unwrap();

        let mut direct = Builder::new();
        direct.start_buffer(None, 0, false).unwrap();
        let root = direct
            .create_struct(&[1, 2, 3, 4, 5, 6, 7, 8], 4)
            .unwrap();
        direct.end_buffer(root).unwrap();

        assert_eq!(staged.finalize_buffer(), direct.finalize_buffer());
    }

    #[test]
    fn user_frames_nest_independently() {
        let mut b = Builder::new();
        assert_eq!(b.current_user_frame(), 0);
        let outer = b.enter_user_frame(16);
        b.user_frame_bytes(outer)[..4].copy_from_slice(b"outa");
        let inner = b.enter_user_frame(8);
        assert!(inner > outer);
        b.user_frame_bytes(inner)[..4].copy_from_slice(b"innr");
        assert_eq!(b.current_user_frame(), inner);

        assert_eq!(b.exit_user_frame(), outer);
        assert_eq!(&b.user_frame_bytes(outer)[..4], b"outa");
        assert_eq!(b.exit_user_frame(), 0);

        // Handles may be reused for stack unwinding in one step.
        let a = b.enter_user_frame(4);
        let _b2 = b.enter_user_frame(4);
        assert_eq!(b.exit_user_frame_at(a), 0);
    }

    #[test]
    fn finalize_aligned_buffer_rounds_up() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let root = {
            b.start_table(1).unwrap();
            b.table_add_scalar(0, 0x0102_0304_0506_0708u64).unwrap();
            b.end_table().unwrap()
        };
        b.end_buffer(root).unwrap();

        let aligned = b.finalize_aligned_buffer().unwrap();
        assert_eq!(b.buffer_alignment(), 8);
        assert_eq!(aligned.as_ptr() as usize % 8, 0);
        assert_eq!(aligned.len() % 8, 0);
        assert!(aligned.len() >= b.buffer_size());
        assert_eq!(&aligned[..b.buffer_size()], &b.finalize_buffer()[..]);
    }

    #[test]
    fn clear_releases_and_builder_remains_usable() {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        let root = u16_table(&mut b, 1);
        b.end_buffer(root).unwrap();
        b.clear();
        assert_eq!(b.buffer_size(), 0);
        assert_eq!(b.level(), 0);

        b.start_buffer(None, 0, false).unwrap();
        let root = u16_table(&mut b, 1);
        assert!(b.end_buffer(root).is_ok());
    }
}
