//! Bounds-checked views over a loaded image or a mapped file.
//!
//! Every table the loader consumes lives at an image-relative offset.  The
//! views here replace raw pointer arithmetic: each access names an offset and
//! a width, and anything outside the backing slice is reported as a
//! [`ViewError`] instead of being dereferenced.

use crate::error::ViewError;

// ---------------------------------------------------------------------------
// Pointer width
// ---------------------------------------------------------------------------

/// Width of a native pointer inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    U32,
    U64,
}

impl PointerWidth {
    /// Width of the running process.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::U64
        } else {
            PointerWidth::U32
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            PointerWidth::U32 => 4,
            PointerWidth::U64 => 8,
        }
    }

    /// Truncate `value` to this width.
    pub const fn mask(self, value: u64) -> u64 {
        match self {
            PointerWidth::U32 => value & 0xFFFF_FFFF,
            PointerWidth::U64 => value,
        }
    }
}

// ---------------------------------------------------------------------------
// Little-endian helpers
// ---------------------------------------------------------------------------

fn span(data_len: usize, offset: u64, len: usize) -> Result<core::ops::Range<usize>, ViewError> {
    let err = ViewError {
        offset,
        len,
        size: data_len,
    };
    let start = usize::try_from(offset).map_err(|_| err)?;
    let end = start.checked_add(len).ok_or(err)?;
    if end > data_len {
        return Err(err);
    }
    Ok(start..end)
}

/// Read `N` bytes at `offset`.
pub fn read_array<const N: usize>(data: &[u8], offset: u64) -> Result<[u8; N], ViewError> {
    let r = span(data.len(), offset, N)?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[r]);
    Ok(buf)
}

pub fn read_u16(data: &[u8], offset: u64) -> Result<u16, ViewError> {
    read_array::<2>(data, offset).map(u16::from_le_bytes)
}

pub fn read_u32(data: &[u8], offset: u64) -> Result<u32, ViewError> {
    read_array::<4>(data, offset).map(u32::from_le_bytes)
}

pub fn read_u64(data: &[u8], offset: u64) -> Result<u64, ViewError> {
    read_array::<8>(data, offset).map(u64::from_le_bytes)
}

// ---------------------------------------------------------------------------
// Read-only view
// ---------------------------------------------------------------------------

/// Read-only window over image memory that starts at `base`.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    bytes: &'a [u8],
    base: u64,
    width: PointerWidth,
}

impl<'a> ImageView<'a> {
    pub fn new(bytes: &'a [u8], base: u64, width: PointerWidth) -> Self {
        ImageView { bytes, base, width }
    }

    /// Absolute address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Absolute address of `offset`.
    pub fn address_of(&self, offset: u64) -> u64 {
        self.width.mask(self.base.wrapping_add(offset))
    }

    /// Offset of an absolute address, if it falls inside the view.
    pub fn offset_of(&self, address: u64) -> Option<u64> {
        let off = address.checked_sub(self.base)?;
        (off < self.bytes.len() as u64).then_some(off)
    }

    pub fn contains(&self, offset: u64, len: usize) -> bool {
        span(self.bytes.len(), offset, len).is_ok()
    }

    pub fn range(&self, offset: u64, len: usize) -> Result<&'a [u8], ViewError> {
        let r = span(self.bytes.len(), offset, len)?;
        Ok(&self.bytes[r])
    }

    /// Everything from `offset` to the end of the view.
    pub fn tail(&self, offset: u64) -> Result<&'a [u8], ViewError> {
        let len = (self.bytes.len() as u64).saturating_sub(offset) as usize;
        self.range(offset, len)
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, ViewError> {
        read_array::<1>(self.bytes, offset).map(|b| b[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16, ViewError> {
        read_u16(self.bytes, offset)
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, ViewError> {
        read_u32(self.bytes, offset)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, ViewError> {
        read_u64(self.bytes, offset)
    }

    /// Read a native pointer, zero-extended to `u64`.
    pub fn read_ptr(&self, offset: u64) -> Result<u64, ViewError> {
        match self.width {
            PointerWidth::U32 => self.read_u32(offset).map(u64::from),
            PointerWidth::U64 => self.read_u64(offset),
        }
    }

    /// NUL-terminated byte string at `offset`, without the terminator.
    /// At most `max` bytes are scanned.
    pub fn c_str(&self, offset: u64, max: usize) -> Result<&'a [u8], ViewError> {
        let tail = self.tail(offset)?;
        let limit = tail.len().min(max);
        match tail[..limit].iter().position(|&b| b == 0) {
            Some(n) => Ok(&tail[..n]),
            None => Err(ViewError {
                offset,
                len: limit + 1,
                size: self.bytes.len(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Mutable view
// ---------------------------------------------------------------------------

/// Writable window over image memory.  Used by the unpacker, the fixup
/// applier and the import resolver; everything else reads through
/// [`ImageViewMut::view`].
#[derive(Debug)]
pub struct ImageViewMut<'a> {
    bytes: &'a mut [u8],
    base: u64,
    width: PointerWidth,
}

impl<'a> ImageViewMut<'a> {
    pub fn new(bytes: &'a mut [u8], base: u64, width: PointerWidth) -> Self {
        ImageViewMut { bytes, base, width }
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(self.bytes, self.base, self.width)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn range_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8], ViewError> {
        let r = span(self.bytes.len(), offset, len)?;
        Ok(&mut self.bytes[r])
    }

    pub fn write_bytes(&mut self, offset: u64, src: &[u8]) -> Result<(), ViewError> {
        self.range_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Copy `len` bytes between two offsets of the same view.
    pub fn copy_within(&mut self, src: u64, dst: u64, len: usize) -> Result<(), ViewError> {
        let from = span(self.bytes.len(), src, len)?;
        let to = span(self.bytes.len(), dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    pub fn write_u16(&mut self, offset: u64, value: u16) -> Result<(), ViewError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<(), ViewError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), ViewError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a native pointer; the upper half is dropped on 32-bit images.
    pub fn write_ptr(&mut self, offset: u64, value: u64) -> Result<(), ViewError> {
        match self.width {
            PointerWidth::U32 => self.write_u32(offset, value as u32),
            PointerWidth::U64 => self.write_u64(offset, value),
        }
    }
}
