//! Introspection of an already-mapped module image: which regions of memory belong to it, and
//! what they are for. Only the in-memory PE/COFF headers are read; nothing is relocated or
//! resolved.

use core::ops::Range;

use object::{
    pe::{self, ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64, ImageSectionHeader},
    read::pe::{optional_header_magic, ImageNtHeaders},
    LittleEndian as LE,
};
use tracing::debug;

use crate::ImageError;

bitflags::bitflags! {
    /// What a section holds and how it is mapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        const CODE = pe::IMAGE_SCN_CNT_CODE;
        const INITIALIZED_DATA = pe::IMAGE_SCN_CNT_INITIALIZED_DATA;
        const UNINITIALIZED_DATA = pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        const DISCARDABLE = pe::IMAGE_SCN_MEM_DISCARDABLE;
        const SHARED = pe::IMAGE_SCN_MEM_SHARED;
        const EXECUTE = pe::IMAGE_SCN_MEM_EXECUTE;
        const READ = pe::IMAGE_SCN_MEM_READ;
        const WRITE = pe::IMAGE_SCN_MEM_WRITE;
    }
}

/// A view of a module image as the loader mapped it, starting at the image base.
#[derive(Debug, Clone, Copy)]
pub struct MappedImage<'a> {
    data: &'a [u8],
}

impl<'a> MappedImage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// # Safety
    /// `base..base + len` must be readable and stay mapped for `'a`.
    pub unsafe fn from_raw(base: *const u8, len: usize) -> Self {
        Self {
            data: core::slice::from_raw_parts(base, len),
        }
    }

    /// The image base address.
    pub fn base(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Validate the image headers and return an enumerator positioned before the first section.
    pub fn sections(&self) -> Result<SectionEnumerator<'a>, ImageError> {
        let headers = if optional_header_magic(self.data)? == pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC {
            section_headers::<ImageNtHeaders64>(self.data)?
        } else {
            section_headers::<ImageNtHeaders32>(self.data)?
        };
        debug!(
            "image at {:#x}: {} sections",
            self.base(),
            headers.len()
        );
        Ok(SectionEnumerator {
            base: self.base(),
            headers,
            next: 0,
        })
    }

    /// Validate the headers and produce the first section. An image without sections reports
    /// [ImageError::NoMoreSections].
    pub fn enumerate_first_section(
        &self,
    ) -> Result<(SectionEnumerator<'a>, SectionDescriptor), ImageError> {
        let mut sections = self.sections()?;
        let first = sections.enumerate_next_section()?;
        Ok((sections, first))
    }

    /// Find a section by name, e.g. `.text`.
    pub fn find_section(&self, name: &str) -> Result<Option<SectionDescriptor>, ImageError> {
        Ok(self
            .sections()?
            .find(|s| s.name_bytes() == name.as_bytes()))
    }

    /// Find the section whose mapped range contains `addr`.
    pub fn section_containing(&self, addr: usize) -> Result<Option<SectionDescriptor>, ImageError> {
        Ok(self.sections()?.find(|s| s.contains(addr)))
    }
}

impl MappedImage<'static> {
    /// The image of the module this code is linked into, as the loader mapped it.
    #[cfg(windows)]
    pub fn current() -> Result<Self, ImageError> {
        extern "C" {
            static __ImageBase: u8;
        }
        // Safety: the linker places `__ImageBase` at the start of the mapped image, whose headers
        // stay mapped for the life of the process.
        unsafe {
            let base = core::ptr::addr_of!(__ImageBase);
            let dos = ImageDosHeader::parse(core::slice::from_raw_parts(
                base,
                core::mem::size_of::<ImageDosHeader>(),
            ))?;
            let size_at = dos.nt_headers_offset() as usize + SIZE_OF_IMAGE_OFFSET;
            let size = base.add(size_at).cast::<u32>().read_unaligned();
            Ok(Self::from_raw(base, size as usize))
        }
    }

    /// The image of the module this code is linked into. Only PE hosts have one.
    #[cfg(not(windows))]
    pub fn current() -> Result<Self, ImageError> {
        Err(ImageError::NoHostImage)
    }
}

// PE signature and file header, then `SizeOfImage`, which sits at the same offset in PE32 and PE32+
// optional headers.
#[cfg(windows)]
const SIZE_OF_IMAGE_OFFSET: usize = 4 + 20 + 56;

fn section_headers<'a, Pe: ImageNtHeaders>(
    data: &'a [u8],
) -> Result<&'a [ImageSectionHeader], ImageError> {
    let dos = ImageDosHeader::parse(data)?;
    let mut offset = dos.nt_headers_offset().into();
    let (nt, _) = Pe::parse(data, &mut offset)?;
    let table = nt.sections(data, offset)?;
    Ok(table.iter().as_slice())
}

/// One entry of the section table, resolved against the image base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    name: [u8; 8],
    /// Address of the section in memory.
    pub base: usize,
    /// Size of the section in memory.
    pub size: usize,
    /// Size of the section's initialized data on disk.
    pub raw_size: usize,
    pub flags: SectionFlags,
}

impl SectionDescriptor {
    fn from_header(image_base: usize, header: &ImageSectionHeader) -> Self {
        Self {
            name: header.name,
            base: image_base.wrapping_add(header.virtual_address.get(LE) as usize),
            size: header.virtual_size.get(LE) as usize,
            raw_size: header.size_of_raw_data.get(LE) as usize,
            flags: SectionFlags::from_bits_truncate(header.characteristics.get(LE)),
        }
    }

    /// The fixed-width name field, which need not be NUL-terminated.
    pub fn raw_name(&self) -> [u8; 8] {
        self.name
    }

    /// The name with NUL padding removed.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }

    pub fn name(&self) -> Option<&str> {
        core::str::from_utf8(self.name_bytes()).ok()
    }

    pub fn range(&self) -> Range<usize> {
        self.base..self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }
}

/// A restartable cursor over the section table of a validated image.
#[derive(Debug, Clone)]
pub struct SectionEnumerator<'a> {
    base: usize,
    headers: &'a [ImageSectionHeader],
    next: usize,
}

impl SectionEnumerator<'_> {
    /// Produce the next section, or [ImageError::NoMoreSections] once the table is exhausted.
    pub fn enumerate_next_section(&mut self) -> Result<SectionDescriptor, ImageError> {
        let header = self
            .headers
            .get(self.next)
            .ok_or(ImageError::NoMoreSections)?;
        self.next += 1;
        Ok(SectionDescriptor::from_header(self.base, header))
    }

    /// Go back to before the first section.
    pub fn restart(&mut self) {
        self.next = 0;
    }

    pub fn section_count(&self) -> usize {
        self.headers.len()
    }
}

impl Iterator for SectionEnumerator<'_> {
    type Item = SectionDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        self.enumerate_next_section().ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.headers.len() - self.next;
        (left, Some(left))
    }
}
