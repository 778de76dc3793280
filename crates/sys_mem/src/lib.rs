//! Anonymous memory reservations for managed heaps.
//!
//! A [`MemMap`] owns one read/write anonymous mapping. Heaps carve their
//! spaces out of a single reservation and hand unused pages back to the OS
//! with [`MemMap::release`]; released pages read as zero when touched again.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `value` up to the next page boundary.
///
/// # Panics
///
/// Panics if the rounded value does not fit in `usize`. Use
/// [`checked_page_round_up`] for untrusted sizes.
#[must_use]
pub fn page_round_up(value: usize) -> usize {
    checked_page_round_up(value).unwrap_or_else(|| panic!("{value:#x} overflows when rounded to a page"))
}

/// Rounds `value` up to the next page boundary, or `None` on overflow.
#[must_use]
pub fn checked_page_round_up(value: usize) -> Option<usize> {
    let page = page_size();
    Some(value.checked_add(page - 1)? & !(page - 1))
}

/// Rounds `value` down to a page boundary.
#[must_use]
pub fn page_round_down(value: usize) -> usize {
    value & !(page_size() - 1)
}

/// An owned anonymous mapping.
///
/// The region is unmapped when the handle is dropped.
pub struct MemMap {
    name: String,
    inner: os::MapInner,
}

impl MemMap {
    /// Name given at creation, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First byte of the mapping.
    #[must_use]
    pub fn begin(&self) -> usize {
        self.inner.ptr() as usize
    }

    /// One past the last byte of the mapping.
    #[must_use]
    pub fn end(&self) -> usize {
        self.begin() + self.len()
    }

    /// Returns a raw pointer to the start of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `addr` lies inside the mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.end()
    }

    /// Returns the pages fully covered by `[begin, end)` to the OS.
    ///
    /// The range is shrunk inward to page boundaries; a range covering no
    /// whole page is a no-op. Returns the number of bytes released.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pages could not be released.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the mapping.
    pub fn release(&self, begin: usize, end: usize) -> io::Result<usize> {
        assert!(
            begin >= self.begin() && end <= self.end() && begin <= end,
            "release range {begin:#x}..{end:#x} outside {} ({:#x}..{:#x})",
            self.name,
            self.begin(),
            self.end()
        );
        let first = page_round_up(begin);
        let last = page_round_down(end);
        if first >= last {
            return Ok(0);
        }
        // SAFETY: the range is page aligned and inside our mapping.
        unsafe { self.inner.release(first, last - first)? };
        Ok(last - first)
    }

    /// Zeroes `[begin, end)`, releasing whole pages and writing the edges.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the inner pages could not be released.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the mapping.
    pub fn zero(&self, begin: usize, end: usize) -> io::Result<()> {
        assert!(begin >= self.begin() && end <= self.end() && begin <= end);
        let first = page_round_up(begin).min(end);
        let last = page_round_down(end).max(first);
        // SAFETY: both edge ranges are inside our read/write mapping.
        unsafe {
            std::ptr::write_bytes(begin as *mut u8, 0, first - begin);
            std::ptr::write_bytes(last as *mut u8, 0, end - last);
        }
        if first < last {
            // SAFETY: page aligned and inside our mapping.
            unsafe { self.inner.release(first, last - first)? };
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemMap")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.begin()))
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for MemMap {}
// SAFETY: all mutation through the handle goes through OS calls.
unsafe impl Sync for MemMap {}

/// Builder for an anonymous mapping.
#[derive(Debug, Clone)]
pub struct MemMapOptions {
    name: String,
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl MemMapOptions {
    /// Creates options for a mapping called `name`. A length must be set.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            len: 0,
            populate: false,
            no_reserve: true,
        }
    }

    /// Sets the length of the mapping; it is rounded up to whole pages.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Prefault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skip swap reservation (`MAP_NORESERVE`). On by default.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates the anonymous read/write mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error if the
    /// mapping could not be created.
    pub fn map_anonymous(&self) -> io::Result<MemMap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = checked_page_round_up(self.len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping length overflows"))?;
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let inner = unsafe { os::MapInner::map_anon(len, self.populate, self.no_reserve)? };
        Ok(MemMap {
            name: self.name.clone(),
            inner,
        })
    }
}
