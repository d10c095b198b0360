use bytes::Bytes;

use super::error::BencodeError;
use super::value::{Dict, Value};

const MAX_DEPTH: usize = 64;

/// Decodes exactly one bencode value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;

    if cursor.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes(),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let text = self.take_until(b'e')?;
        let text =
            std::str::from_utf8(text).map_err(|_| BencodeError::InvalidInteger("not utf8".into()))?;

        if text.is_empty() || text == "-" {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if text.starts_with("-0") || (text.len() > 1 && text.starts_with('0')) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        let value = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;
        self.pos += 1; // the 'e'
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Value, BencodeError> {
        let len_text = self.take_until(b':')?;
        let len: usize = std::str::from_utf8(len_text)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        self.pos += 1; // the ':'

        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(Value::Bytes(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = Dict::new();
        while self.peek()? != b'e' {
            let key = match self.value(depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(BencodeError::InvalidDictKey),
            };
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }

    // Advances to (but not past) the delimiter and returns the bytes skipped.
    fn take_until(&mut self, delimiter: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != delimiter {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        Ok(&self.data[start..self.pos])
    }
}
