//! End-to-end wire format checks against hand-computed byte layouts.

use flatforge::types::{count_max, type_hash_from_string};
use flatforge::{Builder, BufferFlags, Ref, Refmap};
use itertools::Itertools;

fn rd_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn rd_i32(b: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn rd_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    (0..haystack.len().saturating_sub(needle.len() - 1))
        .filter(|&i| &haystack[i..i + needle.len()] == needle)
        .count()
}

#[test]
fn empty_table_buffer_is_sixteen_bytes() {
    let mut b = Builder::new();
    b.start_buffer(Some(type_hash_from_string("TEST")), 0, false)
        .unwrap();
    b.start_table(0).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(
        bytes,
        [
            8, 0, 0, 0, // root offset
            b'T', b'E', b'S', b'T', // identifier
            0xFC, 0xFF, 0xFF, 0xFF, // vtable offset -4
            4, 0, // vtable size
            4, 0, // table size
        ]
    );
}

#[test]
fn struct_only_root_buffer() {
    let mut b = Builder::new();
    let root = b.create_struct(&0x0102_0304u32.to_le_bytes(), 4).unwrap();
    b.create_buffer(None, 0, root, 4, BufferFlags::default())
        .unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(bytes, [4, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn u16_vector_layout_and_padding() {
    let mut b = Builder::new();
    b.create_vector_scalar(&[1u16, 2, 3]).unwrap();
    let bytes = b.finalize_buffer();
    assert_eq!(bytes, [3, 0, 0, 0, 1, 0, 2, 0, 3, 0, 0, 0]);

    let mut one_shot = Builder::new();
    let data = [1u16, 2, 3]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect_vec();
    one_shot
        .create_vector(&data, 3, 2, 2, count_max(2))
        .unwrap();
    assert_eq!(one_shot.finalize_buffer(), bytes);
}

#[test]
fn u64_vector_elements_land_aligned() {
    let mut b = Builder::new();
    b.create_vector_scalar(&[0x1122_3344_5566_7788u64]).unwrap();
    let bytes = b.finalize_buffer();
    assert_eq!(bytes.len(), 12);
    assert_eq!(rd_u32(&bytes, 0), 1);
    assert_eq!(
        &bytes[4..],
        &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn string_layout_includes_terminator_outside_length() {
    let mut b = Builder::new();
    b.create_string("hello").unwrap();
    let bytes = b.finalize_buffer();
    assert_eq!(
        bytes,
        [5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o', 0, 0, 0]
    );

    let mut staged = Builder::new();
    staged.start_string().unwrap();
    staged.append_string("hello").unwrap();
    staged.end_string().unwrap();
    assert_eq!(staged.finalize_buffer(), bytes);
}

#[test]
fn staged_vector_matches_one_shot() {
    let mut staged = Builder::new();
    staged.start_vector(2, 2, count_max(2)).unwrap();
    for v in [1u16, 2, 3] {
        staged.vector_push(&v.to_le_bytes()).unwrap();
    }
    staged.end_vector().unwrap();

    let mut one_shot = Builder::new();
    one_shot.create_vector_scalar(&[1u16, 2, 3]).unwrap();

    assert_eq!(staged.finalize_buffer(), one_shot.finalize_buffer());
}

#[test]
fn nested_buffer_slices_out_as_a_valid_buffer() {
    let mut b = Builder::new();
    b.start_buffer(Some(type_hash_from_string("OUTR")), 0, false)
        .unwrap();

    b.start_buffer(Some(type_hash_from_string("INNR")), 0, false)
        .unwrap();
    b.start_table(1).unwrap();
    b.table_add_scalar(0, 0x7777u16).unwrap();
    let inner_root = b.end_table().unwrap();
    let inner = b.end_buffer(inner_root).unwrap();

    b.start_table(1).unwrap();
    b.table_add_offset(0, inner).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(bytes.len(), 46);
    assert_eq!(&bytes[4..8], b"OUTR");

    // Follow the outer root to its only field: the nested-buffer vector.
    let table = rd_u32(&bytes, 0) as usize;
    let vtable = (table as i64 - rd_i32(&bytes, table) as i64) as usize;
    assert_eq!(rd_u16(&bytes, vtable), 6);
    let field = table + rd_u16(&bytes, vtable + 4) as usize;
    let vec_at = field + rd_u32(&bytes, field) as usize;
    let inner_len = rd_u32(&bytes, vec_at) as usize;
    assert_eq!(inner_len, 20);

    // The sliced-out vector content is itself a complete buffer.
    let inner_bytes = &bytes[vec_at + 4..vec_at + 4 + inner_len];
    assert_eq!(&inner_bytes[4..8], b"INNR");
    let itable = rd_u32(inner_bytes, 0) as usize;
    let ivtable = (itable as i64 - rd_i32(inner_bytes, itable) as i64) as usize;
    assert_eq!(
        &inner_bytes[ivtable..ivtable + 6],
        &[6, 0, 6, 0, 4, 0]
    );
    let ifield = itable + rd_u16(inner_bytes, ivtable + 4) as usize;
    assert_eq!(rd_u16(inner_bytes, ifield), 0x7777);
}

#[test]
fn refmap_preserves_identity_across_a_clone() {
    let alpha = String::from("alpha");
    let beta = String::from("beta");
    let mut map = Refmap::new();
    let mut b = Builder::new();
    b.start_buffer(None, 0, false).unwrap();

    let clone_string = |b: &mut Builder, map: &mut Refmap, s: &String| -> Ref {
        let found = map.find(s.as_ptr());
        if !found.is_null() {
            return found;
        }
        let r = b.create_string(s).unwrap();
        map.insert(s.as_ptr(), r)
    };

    // The same source cloned twice must reuse its ref, not re-emit.
    let r1 = clone_string(&mut b, &mut map, &alpha);
    let r2 = clone_string(&mut b, &mut map, &beta);
    let r3 = clone_string(&mut b, &mut map, &alpha);
    assert_eq!(r1, r3);
    assert_ne!(r1, r2);

    let vec = b.create_offset_vector(&[r1, r2, r3]).unwrap();
    b.start_table(1).unwrap();
    b.table_add_offset(0, vec).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(count_occurrences(&bytes, b"alpha"), 1);
    assert_eq!(count_occurrences(&bytes, b"beta"), 1);
}

#[test]
fn embedding_equals_a_ubyte_vector_of_the_same_bytes() {
    // A complete 16-byte buffer to embed.
    let payload = {
        let mut b = Builder::new();
        b.start_buffer(Some(type_hash_from_string("TEST")), 0, false)
            .unwrap();
        b.start_table(0).unwrap();
        let root = b.end_table().unwrap();
        b.end_buffer(root).unwrap();
        b.finalize_buffer()
    };

    let build = |embed: bool| {
        let mut b = Builder::new();
        b.start_buffer(None, 0, false).unwrap();
        b.start_buffer(None, 0, false).unwrap();
        let nested = if embed {
            b.embed_buffer(0, &payload, 4, false).unwrap()
        } else {
            b.create_vector(&payload, payload.len(), 1, 4, count_max(1))
                .unwrap()
        };
        let root = {
            b.start_table(1).unwrap();
            b.table_add_offset(0, nested).unwrap();
            b.end_table().unwrap()
        };
        let outer = b.end_buffer(root).unwrap();
        b.start_table(1).unwrap();
        b.table_add_offset(0, outer).unwrap();
        let top = b.end_table().unwrap();
        b.end_buffer(top).unwrap();
        b.finalize_buffer()
    };

    assert_eq!(build(true), build(false));
}

#[test]
fn with_size_prefixes_the_buffer_length() {
    let mut b = Builder::new();
    b.start_buffer(None, 0, true).unwrap();
    b.start_table(1).unwrap();
    b.table_add_scalar(0, 0x1234u16).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(rd_u32(&bytes, 0) as usize, bytes.len() - 4);
    // The size-stripped remainder is a normal buffer.
    let rest = &bytes[4..];
    let table = rd_u32(rest, 0) as usize;
    let vtable = (table as i64 - rd_i32(rest, table) as i64) as usize;
    let field = table + rd_u16(rest, vtable + 4) as usize;
    assert_eq!(rd_u16(rest, field), 0x1234);
}

#[test]
fn block_alignment_pads_the_buffer_to_a_multiple() {
    let mut b = Builder::new();
    b.start_buffer(None, 16, false).unwrap();
    b.start_table(1).unwrap();
    b.table_add_scalar(0, 0x1234u16).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    let bytes = b.finalize_buffer();
    assert_eq!(bytes.len() % 16, 0);
    assert_eq!(b.buffer_alignment(), 16);
    let table = rd_u32(&bytes, 0) as usize;
    let vtable = (table as i64 - rd_i32(&bytes, table) as i64) as usize;
    let field = table + rd_u16(&bytes, vtable + 4) as usize;
    assert_eq!(rd_u16(&bytes, field), 0x1234);
}

#[test]
fn type_vector_is_a_plain_ubyte_vector() {
    let mut b = Builder::new();
    b.create_type_vector(&[1, 0]).unwrap();
    assert_eq!(b.finalize_buffer(), [2, 0, 0, 0, 1, 0, 0, 0]);
}

#[test]
fn emitted_bytes_equal_virtual_range() {
    let mut b = Builder::new();
    b.start_buffer(None, 0, false).unwrap();
    let s = b.create_string("streamed").unwrap();
    b.start_table(2).unwrap();
    b.table_add_scalar(0, 1.5f64).unwrap();
    b.table_add_offset(1, s).unwrap();
    let root = b.end_table().unwrap();
    b.end_buffer(root).unwrap();

    assert_eq!(
        (b.buffer_end() - b.buffer_start()) as usize,
        b.finalize_buffer().len()
    );
}
