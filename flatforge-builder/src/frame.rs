use std::fmt;

use flatforge_types::{Soffset, TypeHash, Uoffset};

/// What kind of container currently sits at a given nesting level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContainerKind {
    /// No container open at this level.
    Empty,
    Buffer,
    Struct,
    Table,
    Vector,
    OffsetVector,
    String,
    UnionVector,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "nothing",
            Self::Buffer => "buffer",
            Self::Struct => "struct",
            Self::Table => "table",
            Self::Vector => "vector",
            Self::OffsetVector => "offset vector",
            Self::String => "string",
            Self::UnionVector => "union vector",
        };
        f.write_str(name)
    }
}

/// Saved state of one open container.
///
/// `enter` snapshots the parent's data-stack window and active alignment;
/// `exit` restores them and folds the child's alignment requirement upward.
/// The payload carries whatever else the container kind needs across its
/// open/close pair.
pub(crate) struct Frame {
    pub kind: ContainerKind,
    /// Parent's data-stack base.
    pub saved_ds_first: Uoffset,
    /// Parent's data-stack fill.
    pub saved_ds_offset: Uoffset,
    /// Parent's active object alignment.
    pub saved_align: u16,
    /// This container's own data-stack size cap.
    pub type_limit: Uoffset,
    pub body: FrameBody,
}

#[derive(Clone, Copy)]
pub(crate) enum FrameBody {
    /// Structs carry no extra state.
    None,
    Table {
        /// Parent table's entry base in the vtable build stack.
        saved_vs_base: usize,
        /// Patch-log length at open; entries past it belong to this table.
        pl_end: usize,
        saved_vt_hash: u32,
        saved_id_end: u16,
    },
    Vector {
        elem_size: Uoffset,
        count: Uoffset,
        max_count: Uoffset,
    },
    Buffer {
        saved_identifier: TypeHash,
        saved_mark: Soffset,
        saved_nest_id: Uoffset,
        saved_with_size: bool,
        saved_block_align: u16,
    },
}
