//! A streaming FlatBuffers builder.
//!
//! The builder assembles a standard FlatBuffers byte stream while content is
//! still being constructed, without ever materializing the buffer in one
//! contiguous allocation: completed objects are handed to an
//! [`Emit`](flatforge_emitter::Emit) sink immediately, in an order that
//! guarantees every offset refers to bytes the sink has already seen.
//!
//! Construction works middle-out over a signed virtual address space.
//! Ordinary content grows toward lower addresses; vtables are clustered at
//! the high end of a top-level buffer so consumers can cache or ship them
//! together. Object identity is an opaque [`Ref`] coordinate in that space,
//! valid as an operand to field and vector operations within the same
//! buffer.
//!
//! Nested containers (tables, vectors, strings, nested buffers) are opened
//! and closed on an explicit frame stack, so deeply recursive data needs no
//! recursion in the caller.

mod aligned;
mod arena;
mod builder;
mod frame;
mod refmap;
mod refs;
mod stream;

pub use aligned::AlignedBytes;
pub use builder::{Builder, BufferFlags, UnionRef, UnionVecRef};
pub use frame::ContainerKind;
pub use refmap::Refmap;
pub use refs::{Ref, VtRef};
