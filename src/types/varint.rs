use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Bitcoin's `CompactSize` variable-length integer encoding.
pub fn write_varint<W: Write>(w: &mut W, n: u64) -> io::Result<()> {
    if n < 0xfd {
        w.write_u8(n as u8)
    } else if n <= 0xffff {
        w.write_u8(0xfd)?;
        w.write_u16::<LittleEndian>(n as u16)
    } else if n <= 0xffff_ffff {
        w.write_u8(0xfe)?;
        w.write_u32::<LittleEndian>(n as u32)
    } else {
        w.write_u8(0xff)?;
        w.write_u64::<LittleEndian>(n)
    }
}

pub fn read_varint<R: Read>(r: &mut R) -> io::Result<u64> {
    let first = r.read_u8()?;
    match first {
        0xfd => Ok(r.read_u16::<LittleEndian>()? as u64),
        0xfe => Ok(r.read_u32::<LittleEndian>()? as u64),
        0xff => Ok(r.read_u64::<LittleEndian>()?),
        n => Ok(n as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrips_across_size_classes() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(read_varint(&mut cur).unwrap(), n);
        }
    }
}
