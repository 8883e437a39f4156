//! Default emitter: a two-ended ring of fixed-size pages.
//!
//! The first page is shared between the front and back cursor, split at its
//! midpoint, so small buffers never allocate a second page. The front cursor
//! fills pages toward lower addresses, the back cursor toward higher ones.
//! Pages stay stable in memory until `reset`, `clear`, or `recycle_page`,
//! unlike an exponentially growing vector.

use std::collections::VecDeque;

use flatforge_error::{forge_bail, ForgeResult};
use flatforge_types::Soffset;

use crate::{Emit, IoSlices};

const MAX_PAGE_SIZE: usize = 48_000;
const PAGE_MULTIPLE: usize = 64;

/// Rounded down so that page offsets stay a multiple of [`PAGE_MULTIPLE`]
/// after the initial half-page split.
pub const PAGE_SIZE: usize = MAX_PAGE_SIZE & !(2 * PAGE_MULTIPLE - 1);

struct Page {
    bytes: Box<[u8]>,
    /// Virtual offset of the first byte of this page. Only meaningful while
    /// the page is linked between the cursors; useful to transports that
    /// ship pages individually.
    page_offset: Soffset,
}

impl Page {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            page_offset: 0,
        }
    }
}

/// The default [`Emit`] sink.
///
/// `reset` keeps an adaptive number of pages allocated between builds;
/// `clear` releases everything.
#[derive(Default)]
pub struct PageEmitter {
    /// Pages holding content, front to back.
    pages: VecDeque<Page>,
    /// Unlinked pages available for reuse before new allocation.
    spare: Vec<Page>,
    /// Free bytes at the low end of the front page.
    front_left: usize,
    /// Free bytes at the high end of the back page.
    back_left: usize,
    used: usize,
    used_average: usize,
}

impl PageEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes emitted since the last `reset`/`clear`.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes currently allocated in pages, linked or spare.
    pub fn capacity(&self) -> usize {
        (self.pages.len() + self.spare.len()) * PAGE_SIZE
    }

    fn take_page(&mut self) -> Page {
        self.spare.pop().unwrap_or_else(Page::new)
    }

    /// Lay out the shared first page with the cursors meeting mid-page.
    fn open_first_page(&mut self) {
        let mut page = self.take_page();
        self.front_left = PAGE_SIZE / 2;
        self.back_left = PAGE_SIZE - self.front_left;
        page.page_offset = -(self.front_left as Soffset);
        self.pages.push_back(page);
    }

    fn advance_front(&mut self) {
        if self.pages.is_empty() {
            self.open_first_page();
            return;
        }
        let mut page = self.take_page();
        page.page_offset = self.pages[0].page_offset - PAGE_SIZE as Soffset;
        self.pages.push_front(page);
        self.front_left = PAGE_SIZE;
    }

    fn advance_back(&mut self) {
        if self.pages.is_empty() {
            self.open_first_page();
            return;
        }
        let mut page = self.take_page();
        page.page_offset = self.pages[self.pages.len() - 1].page_offset + PAGE_SIZE as Soffset;
        self.pages.push_back(page);
        self.back_left = PAGE_SIZE;
    }

    /// Copy `data` in front of existing front content, filling tail-first so
    /// the bytes end up in stream order across page boundaries.
    fn copy_front(&mut self, data: &[u8]) {
        let mut remaining = data;
        while !remaining.is_empty() {
            if self.front_left == 0 || self.pages.is_empty() {
                self.advance_front();
            }
            let k = self.front_left.min(remaining.len());
            let (rest, chunk) = remaining.split_at(remaining.len() - k);
            self.pages[0].bytes[self.front_left - k..self.front_left].copy_from_slice(chunk);
            self.front_left -= k;
            remaining = rest;
        }
    }

    fn copy_back(&mut self, data: &[u8]) {
        let mut remaining = data;
        while !remaining.is_empty() {
            if self.back_left == 0 || self.pages.is_empty() {
                self.advance_back();
            }
            let k = self.back_left.min(remaining.len());
            let (chunk, rest) = remaining.split_at(k);
            let last = self.pages.len() - 1;
            let page = &mut self.pages[last];
            let cursor = PAGE_SIZE - self.back_left;
            page.bytes[cursor..cursor + k].copy_from_slice(chunk);
            self.back_left -= k;
            remaining = rest;
        }
    }

    /// The whole buffer as one slice, available only while it fits on a
    /// single page. Useful for small buffers; roughly half a page since the
    /// other half belongs to the back cursor.
    pub fn direct_buffer(&self) -> Option<&[u8]> {
        (self.pages.len() == 1)
            .then(|| &self.pages[0].bytes[self.front_left..PAGE_SIZE - self.back_left])
    }

    /// Concatenate all pages into `dst`, which must hold at least `len()`
    /// bytes. Not meaningful after `recycle_page`.
    pub fn copy_buffer(&self, dst: &mut [u8]) -> ForgeResult<()> {
        if dst.len() < self.used {
            forge_bail!(
                "destination holds {} bytes, buffer needs {}",
                dst.len(),
                self.used
            );
        }
        let Some(front) = self.pages.front() else {
            return Ok(());
        };
        if self.pages.len() == 1 {
            dst[..self.used]
                .copy_from_slice(&front.bytes[self.front_left..PAGE_SIZE - self.back_left]);
            return Ok(());
        }
        let mut at = PAGE_SIZE - self.front_left;
        dst[..at].copy_from_slice(&front.bytes[self.front_left..]);
        for page in self.pages.iter().skip(1).take(self.pages.len() - 2) {
            dst[at..at + PAGE_SIZE].copy_from_slice(&page.bytes);
            at += PAGE_SIZE;
        }
        let back = &self.pages[self.pages.len() - 1];
        let back_used = PAGE_SIZE - self.back_left;
        dst[at..at + back_used].copy_from_slice(&back.bytes[..back_used]);
        Ok(())
    }

    /// Unlink a page strictly between the front and back pages, making it
    /// reusable before the buffer completes (e.g. after transmitting it).
    /// Copy operations are no longer well defined afterwards.
    pub fn recycle_page(&mut self, index: usize) -> ForgeResult<()> {
        if index == 0 || index + 1 >= self.pages.len() {
            forge_bail!("cannot recycle the front or back page");
        }
        let page = self
            .pages
            .remove(index)
            .ok_or_else(|| flatforge_error::forge_err!("page index {} out of range", index))?;
        self.spare.push(page);
        Ok(())
    }

}

impl Emit for PageEmitter {
    fn emit(&mut self, iov: &IoSlices<'_>, offset: Soffset, len: usize) -> ForgeResult<()> {
        self.used += len;
        if offset < 0 {
            for part in iov.as_slices().iter().rev() {
                self.copy_front(part);
            }
        } else {
            for part in iov.as_slices() {
                self.copy_back(part);
            }
        }
        Ok(())
    }

    /// Collapse back to a single shared page, keeping an adaptive amount of
    /// allocation: spare pages are freed while capacity exceeds twice a
    /// decaying average of observed usage.
    fn reset(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        while self.pages.len() > 1 {
            if let Some(page) = self.pages.pop_back() {
                self.spare.push(page);
            }
        }
        self.front_left = PAGE_SIZE / 2;
        self.back_left = PAGE_SIZE - self.front_left;
        self.pages[0].page_offset = -(self.front_left as Soffset);
        if self.used_average == 0 {
            self.used_average = self.used;
        }
        self.used_average = self.used_average * 3 / 4 + self.used / 4;
        self.used = 0;
        let mut freed = 0usize;
        while self.used_average * 2 < self.capacity() && !self.spare.is_empty() {
            self.spare.pop();
            freed += 1;
        }
        if freed > 0 {
            log::trace!(
                "page pool shrank by {freed} pages to {} bytes",
                self.capacity()
            );
        }
    }

    /// Free all pages.
    fn clear(&mut self) {
        *self = Self::default();
    }
}
