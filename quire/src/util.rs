use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

#[inline]
pub fn write_vint(write: &mut dyn Write, mut value: u64) -> Result<u32, Error> {
    let mut count = 1;
    while (value & !0x7F) != 0 {
        write.write_all(&[((value & 0x7F) | 0x80) as u8])?;
        value >>= 7;
        count += 1;
    }
    write.write_all(&[(value as u8)])?;
    Result::Ok(count)
}

#[inline]
pub fn read_vint(read: &mut dyn Read) -> Result<u64, Error> {
    let mut buf = [1];
    read.read_exact(&mut buf)?;
    let mut res: u64 = u64::from(buf[0] & 0x7F);
    let mut shift = 7;
    while (buf[0] & 0x80) != 0 {
        if shift > 63 {
            return Err(Error::new(ErrorKind::InvalidData, "vint too long"));
        }
        read.read_exact(&mut buf)?;
        res |= u64::from(buf[0] & 0x7F) << shift;
        shift += 7
    }
    Ok(res)
}

/// Writes a vint length prefix followed by the bytes. Returns the number of bytes written.
pub fn write_bytes(write: &mut dyn Write, bytes: &[u8]) -> Result<u64, Error> {
    let prefix = write_vint(write, bytes.len() as u64)?;
    write.write_all(bytes)?;
    Ok(u64::from(prefix) + bytes.len() as u64)
}

pub fn read_bytes(read: &mut dyn Read) -> Result<Vec<u8>, Error> {
    let len = read_vint(read)? as usize;
    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(Config::with_cases(10_000))]
        #[test]
        fn read_write_correct(num in any::<u64>()) {
            let mut write = Cursor::new(vec![0 as u8; 100]);
            write_vint(&mut write, num).unwrap();
            write.set_position(0);
            assert!(num == read_vint(&mut write).unwrap())
        }
    }

    #[test]
    fn byte_strings_follow_each_other() {
        let mut buf = Vec::new();
        let written = write_bytes(&mut buf, b"quire").unwrap();
        write_bytes(&mut buf, b"").unwrap();
        assert_eq!(6, written);
        let mut input: &[u8] = &buf;
        assert_eq!(b"quire".to_vec(), read_bytes(&mut input).unwrap());
        assert!(read_bytes(&mut input).unwrap().is_empty());
        assert!(input.is_empty());
    }

    #[test]
    fn truncated_input_fails() {
        let mut input: &[u8] = &[0x80, 0x80];
        assert!(read_vint(&mut input).is_err());
    }
}
