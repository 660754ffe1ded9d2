//! External Term Format codec over `serde_json::Value`.
//!
//! Only the term types the gateway actually sends are supported. Decoding maps
//! atoms `nil`/`null` to null, `true`/`false` to booleans and every other atom
//! to a string; integers wider than 64 bits are rejected.

use crate::error::TransportError;
use serde_json::{Map, Number, Value};

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Nesting limit so a hostile frame cannot exhaust the stack
const MAX_DEPTH: usize = 128;

/// Encode a JSON value as a versioned term.
pub fn encode(value: &Value) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    encode_term(value, &mut out)?;
    Ok(out)
}

/// Decode a versioned term into a JSON value.
pub fn decode(bytes: &[u8]) -> Result<Value, TransportError> {
    let mut reader = Reader { bytes, pos: 0 };
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(TransportError::Decode(format!(
            "unsupported term format version {}",
            version
        )));
    }
    let value = reader.term(0)?;
    if reader.pos != bytes.len() {
        return Err(TransportError::Decode(format!(
            "{} trailing bytes after term",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

fn encode_term(value: &Value, out: &mut Vec<u8>) -> Result<(), TransportError> {
    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(true) => encode_atom("true", out),
        Value::Bool(false) => encode_atom("false", out),
        Value::Number(n) => encode_number(n, out)?,
        Value::String(s) => encode_binary(s.as_bytes(), out)?,
        Value::Array(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
            } else {
                out.push(LIST_EXT);
                out.extend_from_slice(&length_u32(items.len())?.to_be_bytes());
                for item in items {
                    encode_term(item, out)?;
                }
                out.push(NIL_EXT);
            }
        }
        Value::Object(map) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&length_u32(map.len())?.to_be_bytes());
            for (key, item) in map {
                encode_binary(key.as_bytes(), out)?;
                encode_term(item, out)?;
            }
        }
    }
    Ok(())
}

fn encode_atom(name: &str, out: &mut Vec<u8>) {
    out.push(ATOM_EXT);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
}

fn encode_binary(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), TransportError> {
    out.push(BINARY_EXT);
    out.extend_from_slice(&length_u32(bytes.len())?.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode_number(n: &Number, out: &mut Vec<u8>) -> Result<(), TransportError> {
    if let Some(u) = n.as_u64() {
        if u <= u8::MAX as u64 {
            out.push(SMALL_INTEGER_EXT);
            out.push(u as u8);
        } else if u <= i32::MAX as u64 {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&(u as i32).to_be_bytes());
        } else {
            encode_big(u, false, out);
        }
    } else if let Some(i) = n.as_i64() {
        if i >= i32::MIN as i64 {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&(i as i32).to_be_bytes());
        } else {
            encode_big(i.unsigned_abs(), true, out);
        }
    } else if let Some(f) = n.as_f64() {
        out.push(NEW_FLOAT_EXT);
        out.extend_from_slice(&f.to_bits().to_be_bytes());
    } else {
        return Err(TransportError::Encode(format!("unrepresentable number {}", n)));
    }
    Ok(())
}

fn encode_big(magnitude: u64, negative: bool, out: &mut Vec<u8>) {
    let digits = magnitude.to_le_bytes();
    let len = digits.iter().rposition(|&b| b != 0).map_or(1, |p| p + 1);
    out.push(SMALL_BIG_EXT);
    out.push(len as u8);
    out.push(u8::from(negative));
    out.extend_from_slice(&digits[..len]);
}

fn length_u32(len: usize) -> Result<u32, TransportError> {
    u32::try_from(len).map_err(|_| TransportError::Encode(format!("length {} exceeds u32", len)))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                TransportError::Decode(format!(
                    "unexpected end of term at offset {} (wanted {} bytes)",
                    self.pos, n
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TransportError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn utf8(&mut self, n: usize) -> Result<String, TransportError> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::Decode(format!("invalid utf-8: {}", e)))
    }

    fn latin1(&mut self, n: usize) -> Result<String, TransportError> {
        Ok(self.take(n)?.iter().map(|&b| b as char).collect())
    }

    fn term(&mut self, depth: usize) -> Result<Value, TransportError> {
        if depth > MAX_DEPTH {
            return Err(TransportError::Decode("term nesting too deep".to_string()));
        }

        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => {
                let b = self.take(4)?;
                let i = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                Ok(if i >= 0 { Value::from(i as u64) } else { Value::from(i as i64) })
            }
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                float_value(f64::from_bits(u64::from_be_bytes(raw)))
            }
            FLOAT_EXT => {
                let text = self.latin1(31)?;
                let f: f64 = text
                    .trim_end_matches('\0')
                    .trim()
                    .parse()
                    .map_err(|e| TransportError::Decode(format!("invalid float: {}", e)))?;
                float_value(f)
            }
            ATOM_EXT => {
                let n = self.u16()? as usize;
                let name = self.latin1(n)?;
                Ok(atom_value(name))
            }
            SMALL_ATOM_EXT => {
                let n = self.u8()? as usize;
                let name = self.latin1(n)?;
                Ok(atom_value(name))
            }
            ATOM_UTF8_EXT => {
                let n = self.u16()? as usize;
                let name = self.utf8(n)?;
                Ok(atom_value(name))
            }
            SMALL_ATOM_UTF8_EXT => {
                let n = self.u8()? as usize;
                let name = self.utf8(n)?;
                Ok(atom_value(name))
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let n = self.u16()? as usize;
                Ok(Value::String(self.latin1(n)?))
            }
            BINARY_EXT => {
                let n = self.u32()? as usize;
                Ok(Value::String(self.utf8(n)?))
            }
            LIST_EXT => {
                let n = self.u32()? as usize;
                let mut items = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    items.push(self.term(depth + 1)?);
                }
                match self.u8()? {
                    NIL_EXT => Ok(Value::Array(items)),
                    tag => Err(TransportError::Decode(format!(
                        "improper list, tail tag {}",
                        tag
                    ))),
                }
            }
            SMALL_TUPLE_EXT => {
                let n = self.u8()? as usize;
                self.sequence(n, depth)
            }
            LARGE_TUPLE_EXT => {
                let n = self.u32()? as usize;
                self.sequence(n, depth)
            }
            MAP_EXT => {
                let n = self.u32()? as usize;
                let mut map = Map::new();
                for _ in 0..n {
                    let key = match self.term(depth + 1)? {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        Value::Null => "nil".to_string(),
                        other => {
                            return Err(TransportError::Decode(format!(
                                "unsupported map key {}",
                                other
                            )))
                        }
                    };
                    let value = self.term(depth + 1)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            SMALL_BIG_EXT => {
                let n = self.u8()? as usize;
                self.big(n)
            }
            LARGE_BIG_EXT => {
                let n = self.u32()? as usize;
                self.big(n)
            }
            other => Err(TransportError::Decode(format!("unsupported term tag {}", other))),
        }
    }

    fn sequence(&mut self, n: usize, depth: usize) -> Result<Value, TransportError> {
        let mut items = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            items.push(self.term(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn big(&mut self, n: usize) -> Result<Value, TransportError> {
        let negative = self.u8()? != 0;
        let digits = self.take(n)?;
        let significant = digits.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        if significant > 8 {
            return Err(TransportError::Decode(format!(
                "integer of {} bytes does not fit in 64 bits",
                significant
            )));
        }
        let mut raw = [0u8; 8];
        raw[..significant].copy_from_slice(&digits[..significant]);
        let magnitude = u64::from_le_bytes(raw);

        if !negative {
            return Ok(Value::from(magnitude));
        }
        if magnitude == 0 {
            return Ok(Value::from(0u64));
        }
        if magnitude <= i64::MAX as u64 + 1 {
            Ok(Value::from((magnitude as i128).wrapping_neg() as i64))
        } else {
            Err(TransportError::Decode("negative integer below i64::MIN".to_string()))
        }
    }
}

fn atom_value(name: String) -> Value {
    match name.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name),
    }
}

fn float_value(f: f64) -> Result<Value, TransportError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| TransportError::Decode(format!("non-finite float {}", f)))
}
