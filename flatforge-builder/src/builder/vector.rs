//! Vector, string, and union-vector construction.
//!
//! All vectors share the wire layout `[count][elem_0]..[elem_n-1]` with the
//! ref addressing the count prefix. Offset vectors hold refs on the data
//! stack until close, then rewrite each element into the relative offset
//! readers expect. Union vectors are a pair of parallel vectors (types and
//! values) built from one logical sequence.

use flatforge_emitter::{Emit, IoSlices};
use flatforge_error::{forge_bail, ForgeResult};
use flatforge_types::{count_max, Soffset, Uoffset, Utype, WireScalar, FIELD_SIZE};

use super::{Builder, UnionRef, UnionVecRef, DATA_LIMIT, PADDING};
use crate::frame::{ContainerKind, FrameBody};
use crate::refs::Ref;

/// Data-stack record for one union element: value ref plus discriminator.
const UNION_ELEM_SIZE: Uoffset = FIELD_SIZE as Uoffset + 1;

/// Byte view of a ref slice for in-place wire rewriting.
fn ref_bytes_mut(refs: &mut [Ref]) -> &mut [u8] {
    let len = refs.len() * FIELD_SIZE;
    // SAFETY: Ref is repr(transparent) over a 4-byte integer, so the byte
    // view covers exactly the same initialized region.
    unsafe { std::slice::from_raw_parts_mut(refs.as_mut_ptr().cast::<u8>(), len) }
}

impl<E: Emit> Builder<E> {
    fn vector_frame(&self) -> Option<(Uoffset, Uoffset, Uoffset)> {
        match self.frames.last()?.body {
            FrameBody::Vector {
                elem_size,
                count,
                max_count,
            } => Some((elem_size, count, max_count)),
            _ => None,
        }
    }

    /// Account `add` more elements on the open vector-like container.
    fn vec_count_add(&mut self, add: Uoffset) -> ForgeResult<()> {
        let FrameBody::Vector {
            count, max_count, ..
        } = self.frame_body_mut()
        else {
            forge_bail!("no vector-like container open");
        };
        let Some(n) = count.checked_add(add).filter(|n| *n <= *max_count) else {
            forge_bail!(Overflow: "vector exceeds its maximum element count");
        };
        *count = n;
        Ok(())
    }

    fn vec_count_sub(&mut self, kind: ContainerKind, remove: Uoffset) -> ForgeResult<Uoffset> {
        self.expect_kind(kind)?;
        let FrameBody::Vector {
            count, elem_size, ..
        } = self.frame_body_mut()
        else {
            forge_bail!("no vector-like container open");
        };
        if *count < remove {
            forge_bail!("cannot truncate {} of {} elements", remove, count);
        }
        *count -= remove;
        Ok(*elem_size * remove)
    }

    // --- scalar/struct element vectors ---

    /// Open a vector of `elem_size`-byte elements. `max_count` caps growth;
    /// it is clamped so the byte size always stays representable.
    pub fn start_vector(
        &mut self,
        elem_size: usize,
        align: u16,
        max_count: usize,
    ) -> ForgeResult<()> {
        self.scoped(|b| {
            super::require_align(align)?;
            let align = align.max(FIELD_SIZE as u16);
            b.enter_frame(
                ContainerKind::Vector,
                align,
                DATA_LIMIT,
                FrameBody::Vector {
                    elem_size: elem_size as Uoffset,
                    count: 0,
                    max_count: max_count.min(count_max(elem_size)) as Uoffset,
                },
            )
        })
    }

    /// Reserve `count` more zeroed elements, returning their bytes.
    pub fn extend_vector(&mut self, count: usize) -> ForgeResult<&mut [u8]> {
        self.ready()?;
        let extend = |b: &mut Self| {
            b.expect_kind(ContainerKind::Vector)?;
            let Some((elem_size, ..)) = b.vector_frame() else {
                forge_bail!("no vector open");
            };
            b.vec_count_add(count as Uoffset)?;
            let Some(bytes) = elem_size.checked_mul(count as Uoffset) else {
                forge_bail!(Overflow: "vector byte size overflows");
            };
            let offset = b.push_ds(bytes)?;
            Ok(((b.ds_first + offset) as usize, bytes as usize))
        };
        let (at, len) = match extend(self) {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };
        Ok(&mut self.ds[at..at + len])
    }

    /// Append one element, already little-endian.
    pub fn vector_push(&mut self, elem: &[u8]) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Vector)?;
            let Some((elem_size, ..)) = b.vector_frame() else {
                forge_bail!("no vector open");
            };
            if elem.len() as Uoffset != elem_size {
                forge_bail!(
                    "element is {} bytes, vector holds {} byte elements",
                    elem.len(),
                    elem_size
                );
            }
            b.vec_count_add(1)?;
            b.push_ds_copy(elem)?;
            Ok(())
        })
    }

    /// Append whole elements from already little-endian bytes.
    pub fn append_vector(&mut self, data: &[u8]) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Vector)?;
            let Some((elem_size, ..)) = b.vector_frame() else {
                forge_bail!("no vector open");
            };
            if elem_size != 0 && data.len() % elem_size as usize != 0 {
                forge_bail!("appended bytes are not whole elements");
            }
            let count = if elem_size == 0 {
                0
            } else {
                (data.len() / elem_size as usize) as Uoffset
            };
            b.vec_count_add(count)?;
            b.push_ds_copy(data)?;
            Ok(())
        })
    }

    /// Drop the last `count` elements.
    pub fn truncate_vector(&mut self, count: usize) -> ForgeResult<()> {
        self.scoped(|b| {
            let bytes = b.vec_count_sub(ContainerKind::Vector, count as Uoffset)?;
            b.unpush_ds(bytes);
            Ok(())
        })
    }

    /// Element count of the open vector-like container.
    pub fn vector_count(&self) -> usize {
        self.vector_frame().map_or(0, |(_, count, _)| count as usize)
    }

    /// The open vector's element bytes.
    pub fn vector_bytes(&mut self) -> ForgeResult<&mut [u8]> {
        self.ready()?;
        if let Err(e) = self.expect_kind(ContainerKind::Vector) {
            return Err(self.fail(e));
        }
        Ok(self.ds_window())
    }

    /// Close the open vector and emit it.
    pub fn end_vector(&mut self) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::Vector)?;
            let Some((elem_size, count, _)) = b.vector_frame() else {
                forge_bail!("no vector open");
            };
            let align = b.align;
            let r = b.emit_vector_at(b.ds_first as usize, count, elem_size, align)?;
            b.exit_frame();
            Ok(r)
        })
    }

    /// One-shot vector from caller bytes, already little-endian.
    pub fn create_vector(
        &mut self,
        data: &[u8],
        count: usize,
        elem_size: usize,
        align: u16,
        max_count: usize,
    ) -> ForgeResult<Ref> {
        self.scoped(|b| {
            super::require_align(align)?;
            if count > max_count {
                forge_bail!("vector of {} elements exceeds the cap {}", count, max_count);
            }
            let Some(vec_size) = count.checked_mul(elem_size) else {
                forge_bail!(Overflow: "vector byte size overflows");
            };
            if data.len() != vec_size {
                forge_bail!(
                    "{} data bytes for {} elements of {} bytes",
                    data.len(),
                    count,
                    elem_size
                );
            }
            let align = align.max(FIELD_SIZE as u16);
            b.bump_min_align(align);
            let header = (count as Uoffset).to_le_bytes();
            let pad = b.front_pad(vec_size as Uoffset, align);
            let mut iov = IoSlices::new();
            iov.push(&header);
            iov.push(data);
            iov.push(&PADDING[..pad as usize]);
            b.stream.front(&iov)
        })
    }

    /// One-shot vector of native scalars, converted to little-endian.
    pub fn create_vector_scalar<T: WireScalar>(&mut self, items: &[T]) -> ForgeResult<Ref> {
        self.start_vector(T::SIZE, T::SIZE as u16, count_max(T::SIZE))?;
        let dst = self.extend_vector(items.len())?;
        for (i, item) in items.iter().enumerate() {
            item.write_le(&mut dst[i * T::SIZE..]);
        }
        self.end_vector()
    }

    /// Emit `[count][elements][pad]` from a data-stack region.
    fn emit_vector_at(
        &mut self,
        at: usize,
        count: Uoffset,
        elem_size: Uoffset,
        align: u16,
    ) -> ForgeResult<Ref> {
        let Some(vec_size) = count.checked_mul(elem_size) else {
            forge_bail!(Overflow: "vector byte size overflows");
        };
        let align = align.max(FIELD_SIZE as u16);
        self.bump_min_align(align);
        let header = count.to_le_bytes();
        let pad = self.front_pad(vec_size, align);
        let mut iov = IoSlices::new();
        iov.push(&header);
        iov.push(&self.ds[at..at + vec_size as usize]);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }

    // --- offset vectors ---

    /// Open a vector of refs to completed objects.
    pub fn start_offset_vector(&mut self) -> ForgeResult<()> {
        self.scoped(|b| {
            b.enter_frame(
                ContainerKind::OffsetVector,
                FIELD_SIZE as u16,
                DATA_LIMIT,
                FrameBody::Vector {
                    elem_size: FIELD_SIZE as Uoffset,
                    count: 0,
                    max_count: count_max(FIELD_SIZE) as Uoffset,
                },
            )
        })
    }

    /// Append one ref. Null refs fail the vector at close unless it ends as
    /// the value side of a union vector.
    pub fn offset_vector_push(&mut self, r: Ref) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::OffsetVector)?;
            b.vec_count_add(1)?;
            let offset = b.push_ds(FIELD_SIZE as Uoffset)?;
            let at = (b.ds_first + offset) as usize;
            r.addr().write_le(&mut b.ds[at..]);
            Ok(())
        })
    }

    pub fn append_offset_vector(&mut self, refs: &[Ref]) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::OffsetVector)?;
            b.vec_count_add(refs.len() as Uoffset)?;
            let offset = b.push_ds((refs.len() * FIELD_SIZE) as Uoffset)?;
            let mut at = (b.ds_first + offset) as usize;
            for r in refs {
                r.addr().write_le(&mut b.ds[at..]);
                at += FIELD_SIZE;
            }
            Ok(())
        })
    }

    pub fn truncate_offset_vector(&mut self, count: usize) -> ForgeResult<()> {
        self.scoped(|b| {
            let bytes = b.vec_count_sub(ContainerKind::OffsetVector, count as Uoffset)?;
            b.unpush_ds(bytes);
            Ok(())
        })
    }

    pub fn offset_vector_count(&self) -> usize {
        self.vector_count()
    }

    /// Close the open offset vector, rewriting each stored ref into the
    /// relative offset readers expect.
    pub fn end_offset_vector(&mut self) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::OffsetVector)?;
            let Some((_, count, _)) = b.vector_frame() else {
                forge_bail!("no offset vector open");
            };
            let r = b.emit_offset_vector_at(b.ds_first as usize, count, None)?;
            b.exit_frame();
            Ok(r)
        })
    }

    /// One-shot offset vector.
    pub fn create_offset_vector(&mut self, refs: &[Ref]) -> ForgeResult<Ref> {
        self.start_offset_vector()?;
        self.append_offset_vector(refs)?;
        self.end_offset_vector()
    }

    /// Zero-copy variant: rewrites `refs` in place to wire offsets and
    /// emits them without staging on the data stack. The slice content is
    /// destroyed.
    pub fn create_offset_vector_direct(&mut self, refs: &mut [Ref]) -> ForgeResult<Ref> {
        self.scoped(|b| b.offset_vector_direct(refs, None))
    }

    /// Emit `[count][rewritten refs][pad]` from caller memory.
    fn offset_vector_direct(
        &mut self,
        refs: &mut [Ref],
        types: Option<&[Utype]>,
    ) -> ForgeResult<Ref> {
        let count = refs.len();
        if count > count_max(FIELD_SIZE) {
            forge_bail!(Overflow: "offset vector exceeds its maximum element count");
        }
        self.bump_min_align(FIELD_SIZE as u16);
        let vec_size = (count * FIELD_SIZE) as Uoffset;
        let header = (count as Uoffset).to_le_bytes();
        let pad = self.front_pad(vec_size, FIELD_SIZE as u16);
        let total = FIELD_SIZE + (vec_size + pad) as usize;
        let base = self.stream.preview_front(total)?;
        let bytes = ref_bytes_mut(refs);
        for i in 0..count {
            let at = i * FIELD_SIZE;
            let mut raw = [0u8; FIELD_SIZE];
            raw.copy_from_slice(&bytes[at..at + FIELD_SIZE]);
            let stored = Soffset::from_ne_bytes(raw);
            check_union_pairing(stored, types.map(|t| t[i]))?;
            if stored != 0 {
                let rel = (stored as Uoffset)
                    .wrapping_sub(base as Uoffset)
                    .wrapping_sub(at as Uoffset)
                    .wrapping_sub(FIELD_SIZE as Uoffset);
                rel.write_le(&mut bytes[at..]);
            }
        }
        let mut iov = IoSlices::new();
        iov.push(&header);
        iov.push(bytes);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }

    /// Emit `[count][rewritten refs][pad]` from a data-stack region. Refs
    /// are stored little-endian on the stack; `types_at` points at the
    /// parallel discriminators when closing a union value vector.
    fn emit_offset_vector_at(
        &mut self,
        at: usize,
        count: Uoffset,
        types_at: Option<usize>,
    ) -> ForgeResult<Ref> {
        self.bump_min_align(FIELD_SIZE as u16);
        let vec_size = count * FIELD_SIZE as Uoffset;
        let header = count.to_le_bytes();
        let pad = self.front_pad(vec_size, FIELD_SIZE as u16);
        let total = FIELD_SIZE + (vec_size + pad) as usize;
        let base = self.stream.preview_front(total)?;
        for i in 0..count as usize {
            let pos = at + i * FIELD_SIZE;
            let stored = Soffset::read_le(&self.ds[pos..]);
            check_union_pairing(stored, types_at.map(|t| self.ds[t + i]))?;
            if stored != 0 {
                let rel = (stored as Uoffset)
                    .wrapping_sub(base as Uoffset)
                    .wrapping_sub((i * FIELD_SIZE) as Uoffset)
                    .wrapping_sub(FIELD_SIZE as Uoffset);
                rel.write_le(&mut self.ds[pos..]);
            }
        }
        let mut iov = IoSlices::new();
        iov.push(&header);
        iov.push(&self.ds[at..at + vec_size as usize]);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }

    // --- strings ---

    /// Open a string; content arrives via [`Builder::append_string`].
    pub fn start_string(&mut self) -> ForgeResult<()> {
        self.scoped(|b| {
            b.enter_frame(
                ContainerKind::String,
                1,
                DATA_LIMIT,
                FrameBody::Vector {
                    elem_size: 1,
                    count: 0,
                    max_count: count_max(1) as Uoffset,
                },
            )
        })
    }

    /// Append UTF-8 content. Embedded nulls are allowed; the terminator is
    /// added at emission.
    pub fn append_string(&mut self, s: &str) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::String)?;
            b.vec_count_add(s.len() as Uoffset)?;
            b.push_ds_copy(s.as_bytes())?;
            Ok(())
        })
    }

    pub fn truncate_string(&mut self, len: usize) -> ForgeResult<()> {
        self.scoped(|b| {
            let bytes = b.vec_count_sub(ContainerKind::String, len as Uoffset)?;
            b.unpush_ds(bytes);
            Ok(())
        })
    }

    /// Length of the open string, excluding the terminator.
    pub fn string_len(&self) -> usize {
        self.vector_count()
    }

    /// The open string's bytes.
    pub fn string_bytes(&mut self) -> ForgeResult<&mut [u8]> {
        self.ready()?;
        if let Err(e) = self.expect_kind(ContainerKind::String) {
            return Err(self.fail(e));
        }
        Ok(self.ds_window())
    }

    pub fn end_string(&mut self) -> ForgeResult<Ref> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::String)?;
            let first = b.ds_first as usize;
            let len = b.ds_offset as usize;
            let r = b.emit_string_parts(first, len)?;
            b.exit_frame();
            Ok(r)
        })
    }

    /// One-shot string emission.
    pub fn create_string(&mut self, s: &str) -> ForgeResult<Ref> {
        self.scoped(|b| {
            let header = (s.len() as Uoffset).to_le_bytes();
            let pad = b.string_pad(s.len())?;
            let mut iov = IoSlices::new();
            iov.push(&header);
            iov.push(s.as_bytes());
            iov.push(&PADDING[..pad]);
            b.stream.front(&iov)
        })
    }

    fn emit_string_parts(&mut self, first: usize, len: usize) -> ForgeResult<Ref> {
        let header = (len as Uoffset).to_le_bytes();
        let pad = self.string_pad(len)?;
        let mut iov = IoSlices::new();
        iov.push(&header);
        iov.push(&self.ds[first..first + len]);
        iov.push(&PADDING[..pad]);
        self.stream.front(&iov)
    }

    /// Padding for a string of `len` bytes: at least the null terminator,
    /// plus whatever aligns the content start.
    fn string_pad(&mut self, len: usize) -> ForgeResult<usize> {
        if len >= count_max(1) {
            forge_bail!(Overflow: "string exceeds the representable length");
        }
        self.bump_min_align(FIELD_SIZE as u16);
        Ok(self.front_pad(len as Uoffset + 1, FIELD_SIZE as u16) as usize + 1)
    }

    // --- union vectors ---

    /// Open a union vector; elements are (type, value) pairs.
    pub fn start_union_vector(&mut self) -> ForgeResult<()> {
        self.scoped(|b| {
            b.enter_frame(
                ContainerKind::UnionVector,
                FIELD_SIZE as u16,
                DATA_LIMIT,
                FrameBody::Vector {
                    elem_size: UNION_ELEM_SIZE,
                    count: 0,
                    max_count: count_max(2 * FIELD_SIZE) as Uoffset,
                },
            )
        })
    }

    pub fn union_vector_push(&mut self, uref: UnionRef) -> ForgeResult<()> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::UnionVector)?;
            if (uref.utype == 0) != uref.value.is_null() {
                forge_bail!("union element type NONE must pair with a null value");
            }
            b.vec_count_add(1)?;
            let offset = b.push_ds(UNION_ELEM_SIZE)?;
            let at = (b.ds_first + offset) as usize;
            uref.value.addr().write_le(&mut b.ds[at..]);
            b.ds[at + FIELD_SIZE] = uref.utype;
            Ok(())
        })
    }

    pub fn append_union_vector(&mut self, urefs: &[UnionRef]) -> ForgeResult<()> {
        for uref in urefs {
            self.union_vector_push(*uref)?;
        }
        Ok(())
    }

    pub fn truncate_union_vector(&mut self, count: usize) -> ForgeResult<()> {
        self.scoped(|b| {
            let bytes = b.vec_count_sub(ContainerKind::UnionVector, count as Uoffset)?;
            b.unpush_ds(bytes);
            Ok(())
        })
    }

    pub fn union_vector_count(&self) -> usize {
        self.vector_count()
    }

    /// Close the open union vector, splitting it into its value and type
    /// vectors.
    pub fn end_union_vector(&mut self) -> ForgeResult<UnionVecRef> {
        self.scoped(|b| {
            b.expect_kind(ContainerKind::UnionVector)?;
            let Some((_, count, _)) = b.vector_frame() else {
                forge_bail!("no union vector open");
            };
            let n = count as usize;
            // Scratch past the records: value refs, then discriminators.
            let scratch = b.push_ds(count * (FIELD_SIZE as Uoffset + 1))?;
            let records = b.ds_first as usize;
            let refs_at = (b.ds_first + scratch) as usize;
            let types_at = refs_at + n * FIELD_SIZE;
            for i in 0..n {
                let rec = records + i * UNION_ELEM_SIZE as usize;
                b.ds
                    .copy_within(rec..rec + FIELD_SIZE, refs_at + i * FIELD_SIZE);
                b.ds[types_at + i] = b.ds[rec + FIELD_SIZE];
            }
            let values = b.emit_offset_vector_at(refs_at, count, Some(types_at))?;
            let types = b.emit_vector_at(types_at, count, 1, 1)?;
            b.exit_frame();
            Ok(UnionVecRef { types, values })
        })
    }

    /// One-shot union vector from (type, value) pairs.
    pub fn create_union_vector(&mut self, urefs: &[UnionRef]) -> ForgeResult<UnionVecRef> {
        self.scoped(|b| {
            let n = urefs.len();
            b.enter_frame(
                ContainerKind::OffsetVector,
                FIELD_SIZE as u16,
                DATA_LIMIT,
                FrameBody::Vector {
                    elem_size: FIELD_SIZE as Uoffset,
                    count: 0,
                    max_count: count_max(FIELD_SIZE) as Uoffset,
                },
            )?;
            let scratch = b.push_ds((n * (FIELD_SIZE + 1)) as Uoffset)?;
            let refs_at = (b.ds_first + scratch) as usize;
            let types_at = refs_at + n * FIELD_SIZE;
            for (i, uref) in urefs.iter().enumerate() {
                uref.value
                    .addr()
                    .write_le(&mut b.ds[refs_at + i * FIELD_SIZE..]);
                b.ds[types_at + i] = uref.utype;
            }
            let values = b.emit_offset_vector_at(refs_at, n as Uoffset, Some(types_at))?;
            let types = b.emit_vector_at(types_at, n as Uoffset, 1, 1)?;
            b.exit_frame();
            Ok(UnionVecRef { types, values })
        })
    }

    /// Zero-copy union vector: `values` is rewritten in place; `types`
    /// provides the parallel discriminators.
    pub fn create_union_vector_direct(
        &mut self,
        types: &[Utype],
        values: &mut [Ref],
    ) -> ForgeResult<UnionVecRef> {
        self.scoped(|b| {
            if types.len() != values.len() {
                forge_bail!(
                    "{} types for {} values in union vector",
                    types.len(),
                    values.len()
                );
            }
            let values_ref = b.offset_vector_direct(values, Some(types))?;
            let types_ref = b.type_vector_parts(types)?;
            Ok(UnionVecRef {
                types: types_ref,
                values: values_ref,
            })
        })
    }

    /// One-shot vector of union discriminators.
    pub fn create_type_vector(&mut self, types: &[Utype]) -> ForgeResult<Ref> {
        self.scoped(|b| b.type_vector_parts(types))
    }

    fn type_vector_parts(&mut self, types: &[Utype]) -> ForgeResult<Ref> {
        self.bump_min_align(FIELD_SIZE as u16);
        let header = (types.len() as Uoffset).to_le_bytes();
        let pad = self.front_pad(types.len() as Uoffset, FIELD_SIZE as u16);
        let mut iov = IoSlices::new();
        iov.push(&header);
        iov.push(types);
        iov.push(&PADDING[..pad as usize]);
        self.stream.front(&iov)
    }
}

/// A stored ref and its union discriminator must agree: NONE pairs with
/// null, anything else with a real ref. Without discriminators a null ref
/// is always an error.
fn check_union_pairing(stored: Soffset, utype: Option<Utype>) -> ForgeResult<()> {
    match utype {
        None if stored == 0 => forge_bail!("offset vector cannot contain a null element"),
        Some(0) if stored != 0 => forge_bail!("union element with type NONE must be null"),
        Some(t) if t != 0 && stored == 0 => {
            forge_bail!("union element with a type must reference a value")
        }
        _ => Ok(()),
    }
}
