//! XBE executable image decoding
//!
//! Header and section table are decoded field by field from little-endian
//! bytes, with every offset checked against the image length before use.

use thiserror::Error;

pub const XBE_MAGIC: &[u8; 4] = b"XBEH";
/// Magic plus fifteen 32-bit header fields
pub const HEADER_LEN: usize = 64;
/// Five 32-bit fields per section header
pub const SECTION_HEADER_LEN: usize = 20;
/// Section must be copied into memory at load time
pub const SECTION_FLAG_LOADED: u32 = 0x0000_0001;

const MAX_SECTIONS: u32 = 256;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum XbeError {
    #[error("image truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },
    #[error("bad magic")]
    BadMagic,
    #[error("section table at {addr:#010x} lies outside the image")]
    SectionTableOutOfBounds { addr: u32 },
    #[error("too many sections: {0}")]
    TooManySections(u32),
    #[error("section {index} raw data {offset:#x}+{size:#x} lies outside the image")]
    SectionOutOfBounds { index: usize, offset: u32, size: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XbeHeader {
    pub base_addr: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    pub section_headers_addr: u32,
    pub number_of_sections: u32,
    pub timestamp: u32,
    pub certificate_addr: u32,
    pub entry_point: u32,
    pub title_name_addr: u32,
    pub number_of_library_imports: u32,
    pub library_imports_addr: u32,
    pub kernel_library_import_addr: u32,
    pub xapi_library_import_addr: u32,
    pub logo_bitmap_addr: u32,
    pub logo_bitmap_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XbeSection {
    pub flags: u32,
    pub virtual_addr: u32,
    pub virtual_size: u32,
    pub file_addr: u32,
    pub file_size: u32,
}

impl XbeSection {
    pub fn is_loaded(&self) -> bool {
        self.flags & SECTION_FLAG_LOADED != 0
    }
}

/// A parsed image borrowing the raw file bytes
#[derive(Debug)]
pub struct XbeImage<'a> {
    pub header: XbeHeader,
    pub sections: Vec<XbeSection>,
    data: &'a [u8],
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Reader { data, pos }
    }

    fn u32(&mut self) -> Result<u32, XbeError> {
        let truncated = XbeError::Truncated {
            needed: self.pos.saturating_add(4),
            len: self.data.len(),
        };
        let end = self.pos.checked_add(4).ok_or(truncated.clone())?;
        let bytes = self.data.get(self.pos..end).ok_or(truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl<'a> XbeImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, XbeError> {
        if data.len() < HEADER_LEN {
            return Err(XbeError::Truncated {
                needed: HEADER_LEN,
                len: data.len(),
            });
        }
        if &data[..4] != XBE_MAGIC {
            return Err(XbeError::BadMagic);
        }

        let mut r = Reader::at(data, 4);
        let header = XbeHeader {
            base_addr: r.u32()?,
            size_of_headers: r.u32()?,
            size_of_image: r.u32()?,
            section_headers_addr: r.u32()?,
            number_of_sections: r.u32()?,
            timestamp: r.u32()?,
            certificate_addr: r.u32()?,
            entry_point: r.u32()?,
            title_name_addr: r.u32()?,
            number_of_library_imports: r.u32()?,
            library_imports_addr: r.u32()?,
            kernel_library_import_addr: r.u32()?,
            xapi_library_import_addr: r.u32()?,
            logo_bitmap_addr: r.u32()?,
            logo_bitmap_size: r.u32()?,
        };

        if header.number_of_sections > MAX_SECTIONS {
            return Err(XbeError::TooManySections(header.number_of_sections));
        }
        let table = header
            .section_headers_addr
            .checked_sub(header.base_addr)
            .ok_or(XbeError::SectionTableOutOfBounds {
                addr: header.section_headers_addr,
            })? as usize;
        let table_end = (header.number_of_sections as usize)
            .checked_mul(SECTION_HEADER_LEN)
            .and_then(|len| table.checked_add(len));
        if table_end.map_or(true, |end| end > data.len()) {
            return Err(XbeError::SectionTableOutOfBounds {
                addr: header.section_headers_addr,
            });
        }

        let mut r = Reader::at(data, table);
        let mut sections = Vec::with_capacity(header.number_of_sections as usize);
        for index in 0..header.number_of_sections as usize {
            let section = XbeSection {
                flags: r.u32()?,
                virtual_addr: r.u32()?,
                virtual_size: r.u32()?,
                file_addr: r.u32()?,
                file_size: r.u32()?,
            };
            let raw_end = section.file_addr as u64 + section.file_size.min(section.virtual_size) as u64;
            if raw_end > data.len() as u64 {
                return Err(XbeError::SectionOutOfBounds {
                    index,
                    offset: section.file_addr,
                    size: section.file_size,
                });
            }
            sections.push(section);
        }

        Ok(XbeImage { header, sections, data })
    }

    /// Bytes of a section present in the file (bounded by its virtual size)
    pub fn section_data(&self, section: &XbeSection) -> &'a [u8] {
        let start = section.file_addr as usize;
        let len = section.file_size.min(section.virtual_size) as usize;
        &self.data[start..start + len]
    }

    pub fn entry_point(&self) -> u32 {
        self.header.base_addr.wrapping_add(self.header.entry_point)
    }
}

/// Assemble a minimal image from `(virtual address, raw bytes, virtual size)` sections
pub fn build_image(base: u32, entry: u32, sections: &[(u32, &[u8], u32)]) -> Vec<u8> {
    let table = HEADER_LEN as u32;
    let data_start = table + (sections.len() * SECTION_HEADER_LEN) as u32;
    let mut out = Vec::new();
    out.extend_from_slice(XBE_MAGIC);
    let mut total = data_start;
    for (_, bytes, _) in sections {
        total += bytes.len() as u32;
    }
    let fields = [
        base,
        data_start,
        total,
        base + table,
        sections.len() as u32,
        0,
        0,
        entry,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    for f in fields {
        out.extend_from_slice(&f.to_le_bytes());
    }
    let mut file_addr = data_start;
    for (va, bytes, vsize) in sections {
        for f in [SECTION_FLAG_LOADED, *va, *vsize, file_addr, bytes.len() as u32] {
            out.extend_from_slice(&f.to_le_bytes());
        }
        file_addr += bytes.len() as u32;
    }
    for (_, bytes, _) in sections {
        out.extend_from_slice(bytes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_of_builder() {
        let code = [0x90u8, 0x90, 0xC3];
        let image = build_image(0x10000, 0x1000, &[(0x11000, &code, 0x2000)]);
        let xbe = XbeImage::parse(&image).unwrap();
        assert_eq!(xbe.header.base_addr, 0x10000);
        assert_eq!(xbe.sections.len(), 1);
        assert!(xbe.sections[0].is_loaded());
        assert_eq!(xbe.section_data(&xbe.sections[0]), &code);
        assert_eq!(xbe.entry_point(), 0x11000);
    }

    #[test]
    fn test_bad_magic() {
        let mut image = build_image(0x10000, 0, &[]);
        image[0] = b'M';
        assert_eq!(XbeImage::parse(&image).unwrap_err(), XbeError::BadMagic);
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            XbeImage::parse(b"XBEH\0\0"),
            Err(XbeError::Truncated { needed: HEADER_LEN, .. })
        ));
    }

    #[test]
    fn test_section_outside_image() {
        let code = [0u8; 8];
        let mut image = build_image(0x10000, 0, &[(0x11000, &code, 8)]);
        image.truncate(image.len() - 4);
        assert!(matches!(
            XbeImage::parse(&image),
            Err(XbeError::SectionOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn test_section_table_outside_image() {
        let mut image = build_image(0x10000, 0, &[]);
        // number_of_sections = 4 with no table present
        image[20..24].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            XbeImage::parse(&image),
            Err(XbeError::SectionTableOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_section_table_at_end_of_address_space() {
        let mut image = build_image(0, 0, &[]);
        image[16..20].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        image[20..24].copy_from_slice(&MAX_SECTIONS.to_le_bytes());
        assert!(matches!(
            XbeImage::parse(&image),
            Err(XbeError::SectionTableOutOfBounds { addr: 0xFFFF_FFFF })
        ));
    }
}
