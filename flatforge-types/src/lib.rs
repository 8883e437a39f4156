//! Wire-level scalar types shared by the flatforge crates.
//!
//! FlatBuffers fixes three offset widths and a union discriminator width.
//! They must agree across an entire build, so they are defined once here
//! together with the derived limits, the little-endian scalar codec, and the
//! type-hash identifier scheme.

use static_assertions::const_assert_eq;

pub mod identifier;
mod scalar;

pub use scalar::WireScalar;

/// Offset to vectors, strings, and the buffer root. Also the vector count
/// and string length prefix type.
pub type Uoffset = u32;
/// Offset from a table to its vtable. Signed because the vtable may sit at a
/// lower or higher address than the table.
pub type Soffset = i32;
/// Vtable entry: a field position within a table, or a vtable/table size.
pub type Voffset = u16;
/// Union discriminator.
pub type Utype = u8;
/// FNV-1a hash of a fully qualified type name, doubling as the wire
/// representation of a four-byte file identifier.
pub type TypeHash = u32;

/// Width of the `uoffset` fields that prefix vectors, strings, tables, and
/// buffer headers.
pub const FIELD_SIZE: usize = size_of::<Uoffset>();
/// File identifiers are exactly four bytes on the wire.
pub const IDENTIFIER_SIZE: usize = size_of::<TypeHash>();

const_assert_eq!(FIELD_SIZE, 4);
const_assert_eq!(size_of::<Soffset>(), 4);
const_assert_eq!(size_of::<Voffset>(), 2);
const_assert_eq!(size_of::<Utype>(), 1);

/// The largest field id a vtable can address. Two voffset slots go to the
/// vtable header and the topmost index is unaddressable because the vtable
/// size itself is a voffset.
pub const ID_MAX: u16 = (Voffset::MAX / size_of::<Voffset>() as u16) - 3;

/// Largest element count representable for a given element size.
///
/// Zero-size struct elements are clamped to one byte so the division stays
/// defined.
pub const fn count_max(elem_size: usize) -> usize {
    Uoffset::MAX as usize / if elem_size == 0 { 1 } else { elem_size }
}

/// Round `x` up to `align`, which must be a power of two.
#[inline]
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}
