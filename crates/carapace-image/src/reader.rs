//! Byte-range readers over image partitions and sections.
//!
//! Readers borrow the image's file and use positional reads, so they never
//! duplicate the descriptor holding the image's locks and never move its
//! file offset.

use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use carapace_common::{CarapaceError, CarapaceResult};

use crate::image::{Image, ImageType, Section};

/// A bounded reader over one section of an image file.
#[derive(Debug)]
pub struct SectionReader<'a> {
    image: &'a Image,
    offset: u64,
    size: u64,
    pos: u64,
}

impl<'a> SectionReader<'a> {
    fn new(image: &'a Image, section: &Section) -> Self {
        Self {
            image,
            offset: section.offset,
            size: section.size,
            pos: 0,
        }
    }

    /// Length of the section.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self
            .image
            .file()
            .read_at(&mut buf[..want], self.offset + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.size.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of section")
        })?;
        self.pos = target;
        Ok(target)
    }
}

fn select<'s>(
    entries: &'s [Section],
    name: Option<&str>,
    index: Option<usize>,
) -> CarapaceResult<Option<&'s Section>> {
    if let Some(index) = index {
        if index >= entries.len() {
            return Err(CarapaceError::IndexTooLarge {
                index,
                len: entries.len(),
            });
        }
    }
    if let Some(found) = name.and_then(|n| entries.iter().find(|s| s.name == n)) {
        return Ok(Some(found));
    }
    Ok(index.map(|i| &entries[i]))
}

fn check_readable(image: &Image) -> CarapaceResult<()> {
    if image.image_type == ImageType::Sandbox {
        return Err(CarapaceError::Unsupported {
            feature: "byte-range reads of sandbox images".into(),
        });
    }
    Ok(())
}

/// Reader over a partition picked by exact name or by index. A name match
/// wins over the index.
pub fn partition_reader<'a>(
    image: &'a Image,
    name: Option<&str>,
    index: Option<usize>,
) -> CarapaceResult<SectionReader<'a>> {
    check_readable(image)?;
    let part = select(&image.partitions, name, index)?.ok_or(CarapaceError::PartitionNotFound)?;
    Ok(SectionReader::new(image, part))
}

/// Reader over an opaque section picked by exact name or by index. A name
/// match wins over the index.
pub fn section_reader<'a>(
    image: &'a Image,
    name: Option<&str>,
    index: Option<usize>,
) -> CarapaceResult<SectionReader<'a>> {
    check_readable(image)?;
    let section = select(&image.sections, name, index)?.ok_or(CarapaceError::SectionNotFound)?;
    Ok(SectionReader::new(image, section))
}
