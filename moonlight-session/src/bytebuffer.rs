//! Byte buffer reader/writer used by the RTSP parser and control-stream wire codec.
//!
//! Grounded in `ByteBuffer.c`/`ByteBuffer.h`. The original wraps a caller-owned
//! buffer with a cursor and a byte-order flag; this keeps the same shape but
//! owns a growable `Vec<u8>` for the writer side and borrows a slice for the
//! reader side, which is the idiomatic split for this kind of cursor type.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds;

/// Cursor over a borrowed byte slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
    order: ByteOrder,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self {
            data,
            position: 0,
            order,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn advance(&mut self, offset: i64) -> Result<(), OutOfBounds> {
        let new_pos = self.position as i64 + offset;
        if new_pos < 0 || new_pos as usize > self.data.len() {
            return Err(OutOfBounds);
        }
        self.position = new_pos as usize;
        Ok(())
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], OutOfBounds> {
        if self.remaining() < len {
            return Err(OutOfBounds);
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, OutOfBounds> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, OutOfBounds> {
        let bytes: [u8; 2] = self.get_bytes(2)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32, OutOfBounds> {
        let bytes: [u8; 4] = self.get_bytes(4)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64, OutOfBounds> {
        let bytes: [u8; 8] = self.get_bytes(8)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        })
    }
}

/// Growable byte-order-aware writer.
pub struct ByteWriter {
    buffer: Vec<u8>,
    order: ByteOrder,
}

impl ByteWriter {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buffer: Vec::new(),
            order,
        }
    }

    pub fn with_capacity(capacity: usize, order: ByteOrder) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            order,
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.extend_from_slice(&bytes);
    }

    pub fn put_u32(&mut self, value: u32) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.extend_from_slice(&bytes);
    }

    pub fn put_u64(&mut self, value: u64) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.extend_from_slice(&bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_u16(order: ByteOrder, value: u16) {
        let mut writer = ByteWriter::new(order);
        writer.put_u16(value);
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes, order);
        assert_eq!(reader.get_u16().unwrap(), value);
    }

    fn roundtrip_u32(order: ByteOrder, value: u32) {
        let mut writer = ByteWriter::new(order);
        writer.put_u32(value);
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes, order);
        assert_eq!(reader.get_u32().unwrap(), value);
    }

    fn roundtrip_u64(order: ByteOrder, value: u64) {
        let mut writer = ByteWriter::new(order);
        writer.put_u64(value);
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes, order);
        assert_eq!(reader.get_u64().unwrap(), value);
    }

    #[test]
    fn roundtrip_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for value in [0u16, 1, 0x1234, u16::MAX] {
                roundtrip_u16(order, value);
            }
            for value in [0u32, 1, 0x1234_5678, u32::MAX] {
                roundtrip_u32(order, value);
            }
            for value in [0u64, 1, 0x0123_4567_89AB_CDEF, u64::MAX] {
                roundtrip_u64(order, value);
            }
        }
    }

    #[test]
    fn reading_past_end_is_out_of_bounds() {
        let data = [1u8, 2];
        let mut reader = ByteReader::new(&data, ByteOrder::Big);
        assert_eq!(reader.get_u32(), Err(OutOfBounds));
    }

    #[test]
    fn advance_bounds_checked() {
        let data = [0u8; 4];
        let mut reader = ByteReader::new(&data, ByteOrder::Big);
        assert!(reader.advance(4).is_ok());
        assert_eq!(reader.advance(1), Err(OutOfBounds));
        assert!(reader.advance(-4).is_ok());
        assert_eq!(reader.advance(-1), Err(OutOfBounds));
    }
}
