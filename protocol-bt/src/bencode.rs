//! Minimal bencode subset used by the BT request protocol.
//!
//! Only the shapes that appear on the wire are supported: byte strings
//! (`<len>:<bytes>`), signed 64-bit integers (`i<digits>e`), and a single
//! flat list (`l ... e`). Parsing is strict: leading zeros and `-0` are
//! rejected, as is trailing garbage after the list.

use std::ops::Range;

use crate::error::FrameError;

/// Serializes a flat bencoded list.
///
/// ```
/// use protocol_bt::ListProducer;
///
/// let mut list = ListProducer::new();
/// list.append_str("C");
/// list.append_int(42);
/// list.append_str("ping");
/// list.append_bytes(b"");
/// assert_eq!(list.finish(), b"l1:Ci42e4:ping0:e");
/// ```
pub struct ListProducer {
    out: Vec<u8>,
}

impl ListProducer {
    pub fn new() -> Self {
        ListProducer { out: vec![b'l'] }
    }

    /// Append a byte string entry.
    pub fn append_bytes(&mut self, value: &[u8]) {
        self.out.extend_from_slice(itoa(value.len() as i64).as_bytes());
        self.out.push(b':');
        self.out.extend_from_slice(value);
    }

    /// Append a UTF-8 string entry.
    pub fn append_str(&mut self, value: &str) {
        self.append_bytes(value.as_bytes());
    }

    /// Append an integer entry.
    pub fn append_int(&mut self, value: i64) {
        self.out.push(b'i');
        self.out.extend_from_slice(itoa(value).as_bytes());
        self.out.push(b'e');
    }

    /// Close the list and return the serialized bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.out.push(b'e');
        self.out
    }
}

impl Default for ListProducer {
    fn default() -> Self {
        Self::new()
    }
}

fn itoa(value: i64) -> String {
    value.to_string()
}

/// Incrementally consumes the entries of a single bencoded list.
///
/// String entries are returned as offset ranges into the input so callers
/// can keep views into a shared backing buffer without copying.
pub struct ListConsumer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ListConsumer<'a> {
    /// Begin consuming. Fails unless the input starts with `l`.
    pub fn new(data: &'a [u8]) -> Result<Self, FrameError> {
        if data.first() != Some(&b'l') {
            return Err(FrameError::Bencode("expected list"));
        }
        Ok(ListConsumer { data, pos: 1 })
    }

    /// Consume the next entry as a byte string, returning its content range.
    pub fn next_bytes(&mut self) -> Result<Range<usize>, FrameError> {
        let (len, digits) = self.read_decimal()?;
        if self.data.get(self.pos + digits) != Some(&b':') {
            return Err(FrameError::Bencode("expected ':' after string length"));
        }
        let start = self.pos + digits + 1;
        let end = start
            .checked_add(len)
            .ok_or(FrameError::Bencode("string length overflow"))?;
        if end > self.data.len() {
            return Err(FrameError::Bencode("string extends past end of input"));
        }
        self.pos = end;
        Ok(start..end)
    }

    /// Consume the next entry as a signed integer.
    pub fn next_int(&mut self) -> Result<i64, FrameError> {
        if self.data.get(self.pos) != Some(&b'i') {
            return Err(FrameError::Bencode("expected integer"));
        }
        self.pos += 1;

        let negative = self.data.get(self.pos) == Some(&b'-');
        if negative {
            self.pos += 1;
        }

        let digits = count_digits(&self.data[self.pos.min(self.data.len())..]);
        if digits == 0 {
            return Err(FrameError::Bencode("integer has no digits"));
        }
        let raw = &self.data[self.pos..self.pos + digits];
        if raw[0] == b'0' && (digits > 1 || negative) {
            return Err(FrameError::Bencode("invalid integer encoding"));
        }

        let mut value: i64 = 0;
        for &b in raw {
            value = value
                .checked_mul(10)
                .and_then(|v| {
                    let d = (b - b'0') as i64;
                    if negative { v.checked_sub(d) } else { v.checked_add(d) }
                })
                .ok_or(FrameError::Bencode("integer out of range"))?;
        }
        self.pos += digits;

        if self.data.get(self.pos) != Some(&b'e') {
            return Err(FrameError::Bencode("unterminated integer"));
        }
        self.pos += 1;
        Ok(value)
    }

    /// Finish consuming: expects the list terminator and end of input.
    pub fn finish(mut self) -> Result<(), FrameError> {
        if self.data.get(self.pos) != Some(&b'e') {
            return Err(FrameError::Bencode("unterminated list"));
        }
        self.pos += 1;
        if self.pos != self.data.len() {
            return Err(FrameError::Bencode("trailing data after list"));
        }
        Ok(())
    }

    /// Reads a non-negative decimal at the cursor without consuming it.
    /// Returns `(value, digit_count)`.
    fn read_decimal(&self) -> Result<(usize, usize), FrameError> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let digits = count_digits(rest);
        if digits == 0 {
            return Err(FrameError::Bencode("expected string length"));
        }
        if rest[0] == b'0' && digits > 1 {
            return Err(FrameError::Bencode("invalid string length encoding"));
        }
        let mut value: usize = 0;
        for &b in &rest[..digits] {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as usize))
                .ok_or(FrameError::Bencode("string length out of range"))?;
        }
        Ok((value, digits))
    }
}

fn count_digits(data: &[u8]) -> usize {
    data.iter().take_while(|b| b.is_ascii_digit()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_command_shape() {
        let mut list = ListProducer::new();
        list.append_str("C");
        list.append_int(42);
        list.append_str("end");
        list.append_bytes(b"");
        assert_eq!(list.finish(), b"l1:Ci42e3:end0:e");
    }

    #[test]
    fn produce_negative_integer() {
        let mut list = ListProducer::new();
        list.append_int(-17);
        assert_eq!(list.finish(), b"li-17ee");
    }

    #[test]
    fn consume_round_trip() {
        let mut list = ListProducer::new();
        list.append_str("R");
        list.append_int(7);
        list.append_bytes(b"payload bytes");
        let data = list.finish();

        let mut consumer = ListConsumer::new(&data).unwrap();
        let kind = consumer.next_bytes().unwrap();
        assert_eq!(&data[kind], b"R");
        assert_eq!(consumer.next_int().unwrap(), 7);
        let body = consumer.next_bytes().unwrap();
        assert_eq!(&data[body], b"payload bytes");
        consumer.finish().unwrap();
    }

    #[test]
    fn consume_extreme_integers() {
        for value in [i64::MIN, i64::MAX, 0, -1] {
            let mut list = ListProducer::new();
            list.append_int(value);
            let data = list.finish();
            let mut consumer = ListConsumer::new(&data).unwrap();
            assert_eq!(consumer.next_int().unwrap(), value);
            consumer.finish().unwrap();
        }
    }

    #[test]
    fn reject_leading_zero_integer() {
        let mut consumer = ListConsumer::new(b"li03ee").unwrap();
        assert!(consumer.next_int().is_err());
    }

    #[test]
    fn reject_negative_zero() {
        let mut consumer = ListConsumer::new(b"li-0ee").unwrap();
        assert!(consumer.next_int().is_err());
    }

    #[test]
    fn reject_truncated_string() {
        let mut consumer = ListConsumer::new(b"l5:abce").unwrap();
        assert!(consumer.next_bytes().is_err());
    }

    #[test]
    fn reject_trailing_garbage() {
        let mut consumer = ListConsumer::new(b"li1eex").unwrap();
        consumer.next_int().unwrap();
        assert!(consumer.finish().is_err());
    }

    #[test]
    fn reject_non_list() {
        assert!(ListConsumer::new(b"i42e").is_err());
        assert!(ListConsumer::new(b"").is_err());
    }
}
