//! Table construction and the vtable engine.
//!
//! A table is built field-by-field on the data stack while its vtable grows
//! on a separate build stack, hashed incrementally. At close, the vtable is
//! deduplicated through a cache keyed by that hash, the patch log rewrites
//! stored refs into field-relative offsets, and the table body is emitted
//! with its vtable offset prepended.

use flatforge_emitter::{Emit, IoSlices};
use flatforge_error::{forge_bail, ForgeResult};
use flatforge_types::{align_up, Soffset, Uoffset, Voffset, WireScalar, FIELD_SIZE, ID_MAX};

use super::{Builder, UnionRef, UnionVecRef, PADDING, TABLE_LIMIT};
use crate::frame::{ContainerKind, FrameBody};
use crate::refs::{Ref, VtRef};

const VT_HASH_SEED: u32 = 0x2f69_3b52;
/// Knuth's multiplicative constant.
const VT_HASH_MUL: u32 = 0x9E37_79B1;
const MIN_HASH_BUCKETS: usize = 64;

/// One cached vtable: where it was emitted, which buffer may reuse it, and
/// where its words are cached for comparison.
#[derive(Clone, Copy)]
pub(crate) struct VtDescriptor {
    pub vt_ref: VtRef,
    pub nest_id: Uoffset,
    pub vb_start: Uoffset,
    /// Next descriptor index in the bucket chain; 0 terminates.
    pub next: Uoffset,
}

impl Default for VtDescriptor {
    fn default() -> Self {
        Self {
            vt_ref: VtRef(0),
            nest_id: 0,
            vb_start: 0,
            next: 0,
        }
    }
}

#[inline]
fn update_vt_hash(hash: &mut u32, id: u32, offset: u32) {
    *hash = ((id ^ *hash).wrapping_mul(VT_HASH_MUL) ^ offset).wrapping_mul(VT_HASH_MUL);
}

/// Bucket from the high bits; the low bits of the incremental hash are the
/// weaker ones.
#[inline]
fn bucket_of(hash: u32, width: u32) -> usize {
    (hash >> (32 - width)) as usize
}

impl<E: Emit> Builder<E> {
    /// Open a table expected to carry up to `field_count` fields. The count
    /// sizes the working stacks; fields with higher ids still work.
    pub fn start_table(&mut self, field_count: usize) -> ForgeResult<()> {
        self.scoped(|b| {
            b.enter_frame(
                ContainerKind::Table,
                FIELD_SIZE as u16,
                TABLE_LIMIT,
                FrameBody::Table {
                    saved_vs_base: b.vs_base,
                    pl_end: b.pl.len(),
                    saved_vt_hash: b.vt_hash,
                    saved_id_end: b.id_end,
                },
            )?;
            // Entries start past the parent's, leaving two header slots.
            let base = b.vs_base + b.id_end as usize + 2;
            b.vs.grow_to(base + field_count);
            b.pl.reserve(field_count + 1);
            b.vs_base = base;
            b.vt_hash = VT_HASH_SEED;
            b.id_end = 0;
            Ok(())
        })
    }

    /// Reserve a field slot: vtable entry, aligned data-stack bytes, and
    /// the incremental hash. Returns the window-relative byte offset and
    /// whether the slot is fresh (false only under repeat-add).
    fn table_field_slot(
        &mut self,
        id: u16,
        size: Uoffset,
        align: u16,
    ) -> ForgeResult<(Uoffset, bool)> {
        self.expect_kind(ContainerKind::Table)?;
        if id > ID_MAX {
            forge_bail!("field id {} exceeds the vtable limit {}", id, ID_MAX);
        }
        super::require_align(align)?;
        if align > self.align {
            self.align = align;
        }
        let slot = self.vs_base + id as usize;
        self.vs.grow_to(slot + 1);
        if self.vs[slot] != 0 {
            if self.allow_repeat_table_add {
                return Ok((self.vs[slot] as Uoffset - FIELD_SIZE as Uoffset, false));
            }
            forge_bail!("field id {} already set", id);
        }
        update_vt_hash(&mut self.vt_hash, id as u32, size);
        let aligned = align_up(self.ds_offset as usize, align as usize) as Uoffset;
        let pad = aligned - self.ds_offset;
        let offset = self.push_ds(pad + size)? + pad;
        // Field positions are measured from the table start, which begins
        // with the vtable-pointer field.
        self.vs[slot] = (offset + FIELD_SIZE as Uoffset) as Voffset;
        if id >= self.id_end {
            self.id_end = id + 1;
        }
        Ok((offset, true))
    }

    /// Add a scalar or struct field, returning its bytes to fill with
    /// little-endian content.
    pub fn table_add(&mut self, id: u16, size: usize, align: u16) -> ForgeResult<&mut [u8]> {
        self.ready()?;
        let (offset, _) = match self.table_field_slot(id, size as Uoffset, align) {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };
        let at = (self.ds_first + offset) as usize;
        Ok(&mut self.ds[at..at + size])
    }

    /// Add a field from already little-endian bytes.
    pub fn table_add_copy(&mut self, id: u16, data: &[u8], align: u16) -> ForgeResult<()> {
        self.table_add(id, data.len(), align)?.copy_from_slice(data);
        Ok(())
    }

    /// Add a scalar field with its natural size and alignment.
    pub fn table_add_scalar<T: WireScalar>(&mut self, id: u16, value: T) -> ForgeResult<()> {
        let slot = self.table_add(id, T::SIZE, T::SIZE as u16)?;
        value.write_le(slot);
        Ok(())
    }

    /// Add an offset field referencing an already completed object. The ref
    /// is recorded in the patch log and rewritten into a relative offset
    /// when the table closes.
    pub fn table_add_offset(&mut self, id: u16, value: Ref) -> ForgeResult<()> {
        self.scoped(|b| b.add_offset_field(id, value))
    }

    fn add_offset_field(&mut self, id: u16, value: Ref) -> ForgeResult<()> {
        if value.is_null() {
            forge_bail!("offset field {} cannot reference null", id);
        }
        let (offset, fresh) = self.table_field_slot(id, FIELD_SIZE as Uoffset, FIELD_SIZE as u16)?;
        if fresh {
            self.pl.push(offset as Voffset);
        }
        let at = (self.ds_first + offset) as usize;
        value.addr().write_le(&mut self.ds[at..]);
        Ok(())
    }

    /// Add a union field: the discriminator lands at `id - 1`, the value at
    /// `id`. A NONE member stores only the zero discriminator.
    pub fn table_add_union(&mut self, id: u16, uref: UnionRef) -> ForgeResult<()> {
        self.scoped(|b| {
            if id == 0 {
                forge_bail!("union fields need id >= 1 for the type slot");
            }
            if (uref.utype == 0) != uref.value.is_null() {
                forge_bail!("union type NONE must pair with a null value");
            }
            if !uref.value.is_null() {
                b.add_offset_field(id, uref.value)?;
            }
            let (offset, _) = b.table_field_slot(id - 1, 1, 1)?;
            let at = (b.ds_first + offset) as usize;
            b.ds[at] = uref.utype;
            Ok(())
        })
    }

    /// Add a union vector field pair: type vector at `id - 1`, value vector
    /// at `id`. An entirely absent union vector stores neither.
    pub fn table_add_union_vector(&mut self, id: u16, uvref: UnionVecRef) -> ForgeResult<()> {
        self.scoped(|b| {
            if id == 0 {
                forge_bail!("union vector fields need id >= 1 for the type slot");
            }
            if uvref.types.is_null() != uvref.values.is_null() {
                forge_bail!("union vector needs both type and value vectors, or neither");
            }
            if !uvref.types.is_null() {
                b.add_offset_field(id - 1, uvref.types)?;
                b.add_offset_field(id, uvref.values)?;
            }
            Ok(())
        })
    }

    /// True when every id in `required` has been set on the open table.
    pub fn check_required(&self, required: &[u16]) -> bool {
        if self.container_kind() != ContainerKind::Table {
            return false;
        }
        required.iter().all(|&id| {
            self.vs
                .get(self.vs_base + id as usize)
                .is_some_and(|&slot| slot != 0)
        })
    }

    /// True when the union field pair at `id - 1` / `id` is consistent:
    /// both absent, or a nonzero discriminator with a value, or an explicit
    /// NONE discriminator without one.
    pub fn check_union_field(&self, id: u16) -> bool {
        if self.container_kind() != ContainerKind::Table || id == 0 {
            return false;
        }
        let slot_at = |i: u16| {
            self.vs
                .get(self.vs_base + i as usize)
                .copied()
                .unwrap_or(0)
        };
        let type_slot = slot_at(id - 1);
        let value_slot = slot_at(id);
        if type_slot == 0 {
            return value_slot == 0;
        }
        let at = (self.ds_first + type_slot as Uoffset - FIELD_SIZE as Uoffset) as usize;
        if self.ds[at] != 0 {
            value_slot != 0
        } else {
            value_slot == 0
        }
    }

    /// Close the open table: finalize and deduplicate its vtable, rewrite
    /// patched offset fields, and emit the table body.
    pub fn end_table(&mut self) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Table)?;
            let words = b.id_end as usize + 2;
            let hdr = b.vs_base - 2;
            b.vs.grow_to(hdr + words);
            b.vs[hdr] = (words * size_of::<Voffset>()) as Voffset;
            b.vs[hdr + 1] = (b.ds_offset + FIELD_SIZE as Uoffset) as Voffset;
            let mut hash = b.vt_hash;
            update_vt_hash(&mut hash, b.vs[hdr] as u32, b.vs[hdr + 1] as u32);
            let vt_ref = b.cached_vtable(hdr, words, hash)?;
            // Ready the build stack for the next vtable; the data stack is
            // cleared by the frame exit.
            b.vs[hdr..hdr + words].fill(0);

            let FrameBody::Table {
                saved_vs_base,
                pl_end,
                saved_vt_hash,
                saved_id_end,
            } = *b.frame_body()
            else {
                forge_bail!("table frame body mismatch");
            };
            let table_ref = b.emit_table_parts(pl_end, vt_ref)?;
            b.vs_base = saved_vs_base;
            b.vt_hash = saved_vt_hash;
            b.id_end = saved_id_end;
            b.pl.truncate(pl_end);
            b.exit_frame();
            Ok(table_ref)
        })
    }

    /// Emit a vtable without caching. The slice is the complete vtable
    /// including its two header words.
    pub fn create_vtable(&mut self, vt: &[Voffset]) -> ForgeResult<VtRef> {
        self.scoped(|b| {
            if vt.len() < 2 || vt[0] as usize != vt.len() * size_of::<Voffset>() {
                forge_bail!("vtable header disagrees with its length");
            }
            b.vt_scratch.clear();
            for word in vt {
                b.vt_scratch.extend_from_slice(&word.to_le_bytes());
            }
            b.emit_scratch_vtable()
        })
    }

    /// Emit a table from caller-owned bytes against an already emitted
    /// vtable. `offsets` lists positions of offset fields within `data`,
    /// whose stored refs are rewritten in place to relative offsets.
    pub fn create_table(
        &mut self,
        data: &mut [u8],
        align: u16,
        offsets: &[Voffset],
        vt_ref: VtRef,
    ) -> ForgeResult<Ref> {
        self.scoped(|b| {
            let (table_addr, pad, vt_field) =
                b.table_header(data.len() as Uoffset, align, vt_ref)?;
            for &off in offsets {
                rewrite_offset_field(data, off, table_addr);
            }
            let mut iov = IoSlices::new();
            iov.push(&vt_field);
            iov.push(data);
            iov.push(&PADDING[..pad as usize]);
            b.stream.front(&iov)
        })
    }

    /// Emit the open table's data-stack window, patch log applied.
    fn emit_table_parts(&mut self, pl_start: usize, vt_ref: VtRef) -> ForgeResult<Ref> {
        let size = self.ds_offset;
        let align = self.align;
        let (table_addr, pad, vt_field) = self.table_header(size, align, vt_ref)?;
        let first = self.ds_first as usize;
        for &off in &self.pl[pl_start..] {
            rewrite_offset_field(&mut self.ds[first..first + size as usize], off, table_addr);
        }
        let mut iov = IoSlices::new();
        iov.push(&vt_field);
        iov.push(&self.ds[first..first + size as usize]);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }

    /// Alignment, padding, and the encoded vtable-offset field for a table
    /// of `size` bytes emitted now.
    fn table_header(
        &mut self,
        size: Uoffset,
        align: u16,
        vt_ref: VtRef,
    ) -> ForgeResult<(Soffset, Uoffset, [u8; FIELD_SIZE])> {
        if !vt_ref.is_valid() {
            forge_bail!("table requires a valid vtable ref");
        }
        let align = align.max(FIELD_SIZE as u16);
        self.bump_min_align(align);
        // Alignment is computed for the first field, not the vtable-pointer
        // header.
        let pad = self.front_pad(size, align);
        let total = (pad + size) as usize + FIELD_SIZE;
        let table_addr = self.stream.preview_front(total)?;
        let vt_offset = i64::from(table_addr) - i64::from(vt_ref.addr());
        let Ok(vt_offset) = Soffset::try_from(vt_offset) else {
            forge_bail!(Overflow: "vtable offset exceeds the signed offset range");
        };
        let mut vt_field = [0u8; FIELD_SIZE];
        vt_offset.write_le(&mut vt_field);
        Ok((table_addr, pad, vt_field))
    }

    /// Find or emit the vtable held in `vs[hdr..hdr + words]`.
    ///
    /// A cache hit from the same buffer reuses the emitted vtable outright.
    /// A hit from another (nested) buffer reuses only the cached bytes:
    /// emitted vtables never cross buffer boundaries.
    fn cached_vtable(&mut self, hdr: usize, words: usize, hash: u32) -> ForgeResult<VtRef> {
        if self.ht.is_empty() {
            self.ht = vec![0; MIN_HASH_BUCKETS];
            self.ht_width = MIN_HASH_BUCKETS.trailing_zeros();
        }
        if self.vd.is_empty() {
            // Descriptor 0 terminates chains and is never a real entry.
            self.vd.push(VtDescriptor::default());
        }
        let bucket = bucket_of(hash, self.ht_width);
        let head = self.ht[bucket] as usize;
        let mut prev: Option<usize> = None;
        let mut cur = head;
        let mut foreign: Option<Uoffset> = None;
        while cur != 0 {
            let d = self.vd[cur];
            let start = d.vb_start as usize;
            let cached = &self.vb[start..];
            let vt = &self.vs[hdr..hdr + words];
            if cached.len() < words || cached[..words] != *vt {
                prev = Some(cur);
                cur = d.next as usize;
                continue;
            }
            if d.nest_id != self.nest_id {
                foreign = Some(d.vb_start);
                prev = Some(cur);
                cur = d.next as usize;
                continue;
            }
            if let Some(p) = prev {
                // Move to front of the chain.
                self.vd[p].next = d.next;
                self.vd[cur].next = head as Uoffset;
                self.ht[bucket] = cur as Uoffset;
            }
            return Ok(d.vt_ref);
        }

        let vt_ref = self.emit_vs_vtable(hdr, words)?;
        let new_idx = self.vd.len();
        self.vd.push(VtDescriptor {
            vt_ref,
            nest_id: self.nest_id,
            vb_start: 0,
            next: head as Uoffset,
        });
        self.ht[bucket] = new_idx as Uoffset;
        if let Some(vb_start) = foreign {
            self.vd[new_idx].vb_start = vb_start;
        } else if self.vb_flush_limit > 0
            && (self.vb.len() + words) * size_of::<Voffset>() > self.vb_flush_limit
        {
            self.flush_vtable_cache();
        } else {
            self.vd[new_idx].vb_start = self.vb.len() as Uoffset;
            let vt = &self.vs[hdr..hdr + words];
            self.vb.extend_from_slice(vt);
        }
        Ok(vt_ref)
    }

    fn emit_vs_vtable(&mut self, hdr: usize, words: usize) -> ForgeResult<VtRef> {
        self.vt_scratch.clear();
        for word in &self.vs[hdr..hdr + words] {
            self.vt_scratch.extend_from_slice(&word.to_le_bytes());
        }
        self.emit_scratch_vtable()
    }

    /// Emit the wire-encoded vtable in the scratch buffer. Top-level
    /// vtables cluster at the back unless disabled; nested buffers cannot
    /// extend past their end, so theirs go to the front.
    fn emit_scratch_vtable(&mut self) -> ForgeResult<VtRef> {
        let mut iov = IoSlices::new();
        iov.push(&self.vt_scratch);
        if self.is_top_buffer() && !self.disable_vt_clustering {
            self.stream.back(&iov)
        } else {
            let r = self.stream.front(&iov)?;
            Ok(VtRef::bias(r.addr()))
        }
    }

    /// Drop every cached vtable. Subsequent tables emit fresh vtables even
    /// when identical ones exist in the buffer.
    pub fn flush_vtable_cache(&mut self) {
        if self.ht.is_empty() {
            return;
        }
        log::debug!(
            "flushing vtable cache: {} descriptors, {} cached bytes",
            self.vd.len().saturating_sub(1),
            self.vb.len() * size_of::<Voffset>()
        );
        self.ht.fill(0);
        self.vd.truncate(1);
        self.vb.clear();
    }
}

/// Rewrite the ref stored at `off` within a table body into the relative
/// offset FlatBuffers readers expect: target minus field position.
fn rewrite_offset_field(data: &mut [u8], off: Voffset, table_addr: Soffset) {
    let at = off as usize;
    let stored = Soffset::read_le(&data[at..]);
    let rel = (stored as Uoffset)
        .wrapping_sub(table_addr as Uoffset)
        .wrapping_sub(off as Uoffset)
        .wrapping_sub(FIELD_SIZE as Uoffset);
    rel.write_le(&mut data[at..]);
}
