use crate::error::PlatenError;

/// Checked sequential reader over an untrusted byte source. Every decoder and
/// interpreter goes through this; a read past the end is reported as a
/// truncation error tagged with the format being parsed, never a panic.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    format: &'static str,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], format: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            format,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], PlatenError> {
        if count > self.remaining() {
            return Err(PlatenError::truncated(
                self.format,
                count,
                self.remaining(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], PlatenError> {
        self.take(count)
    }

    pub fn read_u8(&mut self) -> Result<u8, PlatenError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, PlatenError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16_le(&mut self) -> Result<i16, PlatenError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, PlatenError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, PlatenError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, PlatenError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, PlatenError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, PlatenError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn skip(&mut self, count: usize) -> Result<(), PlatenError> {
        self.take(count).map(|_| ())
    }

    /// Forward-only absolute seek. Declared offsets that point behind the
    /// cursor indicate a malformed file.
    pub fn seek_to(&mut self, target: usize) -> Result<(), PlatenError> {
        if target < self.pos {
            return Err(PlatenError::format(
                self.format,
                format!("declared offset {} precedes cursor at {}", target, self.pos),
            ));
        }
        if target > self.data.len() {
            return Err(PlatenError::truncated(
                self.format,
                target - self.pos,
                self.remaining(),
            ));
        }
        self.pos = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields_in_order() {
        let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0xFF, 0xFF, 0xFF];
        let mut cur = Cursor::new(&data, "test");
        assert_eq!(cur.read_u8().unwrap(), 0x01);
        assert_eq!(cur.read_u16_le().unwrap(), 0x0302);
        assert_eq!(cur.read_u32_le().unwrap(), 0xFFFF0504);
        assert_eq!(cur.remaining(), 1);
    }

    #[test]
    fn truncated_read_reports_needed_and_available() {
        let data = [0x01u8, 0x02];
        let mut cur = Cursor::new(&data, "bmp");
        let err = cur.read_u32_le().unwrap_err();
        match err {
            PlatenError::Truncated {
                format,
                needed,
                available,
            } => {
                assert_eq!(format, "bmp");
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn seek_is_forward_only() {
        let data = [0u8; 16];
        let mut cur = Cursor::new(&data, "test");
        cur.seek_to(8).unwrap();
        assert_eq!(cur.pos(), 8);
        assert!(cur.seek_to(4).is_err());
        assert!(cur.seek_to(32).is_err());
    }
}
