//! Streaming FlatBuffers construction.
//!
//! Flatforge assembles standard FlatBuffers byte streams while content is
//! still being built: every completed object goes straight to an [`Emit`]
//! sink in an order that guarantees offsets only ever point at bytes the
//! sink has already received. Buffers of any size can therefore be built
//! and transmitted without ever existing contiguously in memory, while the
//! default [`PageEmitter`] still hands small buffers back as a single
//! slice.
//!
//! ```
//! use flatforge::Builder;
//!
//! let mut b = Builder::new();
//! b.start_buffer(None, 0, false)?;
//! let name = b.create_string("orc")?;
//! b.start_table(2)?;
//! b.table_add_scalar(0, 9000u32)?;
//! b.table_add_offset(1, name)?;
//! let root = b.end_table()?;
//! b.end_buffer(root)?;
//!
//! let bytes = b.finalize_buffer();
//! assert!(!bytes.is_empty());
//! # Ok::<(), flatforge::ForgeError>(())
//! ```

pub use flatforge_builder::{
    AlignedBytes, Builder, BufferFlags, ContainerKind, Ref, Refmap, UnionRef, UnionVecRef, VtRef,
};
pub use flatforge_emitter::{Emit, IoSlices, PageEmitter, IOV_COUNT_MAX, PAGE_SIZE};
pub use flatforge_error::{ForgeError, ForgeResult};

/// Wire scalar types, widths, and identifier hashing.
pub mod types {
    pub use flatforge_types::identifier::{
        disperse_type_hash, identifier_from_type_hash, type_hash_from_identifier,
        type_hash_from_name, type_hash_from_string,
    };
    pub use flatforge_types::{
        align_up, count_max, Soffset, TypeHash, Uoffset, Utype, Voffset, WireScalar, FIELD_SIZE,
        IDENTIFIER_SIZE, ID_MAX,
    };
}
