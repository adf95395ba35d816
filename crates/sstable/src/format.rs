use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// "TRUN" in little-endian byte order.
pub const RUN_MAGIC: u32 = 0x4E55_5254;

/// entry_count (8) + index_offset (8) + magic (4).
pub const FOOTER_BYTES: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub entry_count: u64,
    pub index_offset: u64,
}

pub(crate) fn write_footer<W: Write>(w: &mut W, footer: &Footer) -> io::Result<()> {
    w.write_u64::<LittleEndian>(footer.entry_count)?;
    w.write_u64::<LittleEndian>(footer.index_offset)?;
    w.write_u32::<LittleEndian>(RUN_MAGIC)?;
    Ok(())
}

/// Reads the footer from the end of `f`. Returns `None` when the magic does
/// not match.
pub(crate) fn read_footer<R: Read + Seek>(f: &mut R) -> io::Result<Option<Footer>> {
    f.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
    let entry_count = f.read_u64::<LittleEndian>()?;
    let index_offset = f.read_u64::<LittleEndian>()?;
    let magic = f.read_u32::<LittleEndian>()?;
    if magic != RUN_MAGIC {
        return Ok(None);
    }
    Ok(Some(Footer {
        entry_count,
        index_offset,
    }))
}
