//! AMF0 codec
//!
//! Only what RTMP command messages carry in practice is modelled. Typed
//! objects decode as plain objects (the class name is dropped) and
//! references resolve to a copy of the referenced value. AMF3 switching
//! (marker 0x11) is rejected; the proxy never negotiates objectEncoding 3.
//!
//! ```text
//! 0x00 Number      0x01 Boolean     0x02 String      0x03 Object
//! 0x05 Null        0x06 Undefined   0x07 Reference   0x08 ECMA Array
//! 0x09 Object End  0x0A Strict Arr  0x0B Date        0x0C Long String
//! 0x0D Unsupported 0x0F XML         0x10 Typed Obj
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfValue, Properties};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;

const MAX_NESTING_DEPTH: usize = 64;

/// Stateful AMF0 reader over one message body
pub struct Amf0Decoder {
    references: Vec<AmfValue>,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self {
            references: Vec::new(),
            depth: 0,
        }
    }

    /// Decode the next value
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_marker(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_marker(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                ensure(buf, 8)?;
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_XML_DOCUMENT => Ok(AmfValue::Xml(read_utf8_long(buf)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            MARKER_OBJECT => self.decode_complex(buf, AmfValue::Object),
            MARKER_TYPED_OBJECT => {
                let _class_name = read_utf8(buf)?;
                self.decode_complex(buf, AmfValue::Object)
            }
            MARKER_ECMA_ARRAY => {
                ensure(buf, 4)?;
                // The count is only a hint; the end marker is authoritative.
                let _count = buf.get_u32();
                self.decode_complex(buf, AmfValue::EcmaArray)
            }
            MARKER_STRICT_ARRAY => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let index = self.reserve_reference();
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                let value = AmfValue::StrictArray(elements);
                self.references[index] = value.clone();
                Ok(value)
            }
            MARKER_DATE => {
                ensure(buf, 10)?;
                let millis = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(millis))
            }
            MARKER_REFERENCE => {
                ensure(buf, 2)?;
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    /// Objects, typed objects and ECMA arrays share the property layout
    fn decode_complex(
        &mut self,
        buf: &mut Bytes,
        wrap: fn(Properties) -> AmfValue,
    ) -> Result<AmfValue, AmfError> {
        let index = self.reserve_reference();
        let mut properties = Properties::new();

        loop {
            let key = read_utf8(buf)?;
            if key.is_empty() {
                // Some encoders end the final object at the buffer end
                // without the 0x09 marker.
                if buf.is_empty() {
                    break;
                }
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::InvalidObjectEnd);
                }
                break;
            }
            let value = self.decode(buf)?;
            properties.push((key, value));
        }

        let value = wrap(properties);
        self.references[index] = value.clone();
        Ok(value)
    }

    fn reserve_reference(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    read_utf8_bytes(buf, len)
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    read_utf8_bytes(buf, len)
}

fn read_utf8_bytes(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 writer
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) if s.len() > 0xFFFF => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::String(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_utf8(s);
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for element in elements {
                    self.encode(element);
                }
            }
            AmfValue::Date(millis) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(0);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML_DOCUMENT);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &Properties) {
        for (key, value) in props {
            self.write_utf8(key);
            self.encode(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Length-prefixed string without a marker; keys longer than 65535
    /// bytes are cut at the nearest char boundary
    fn write_utf8(&mut self, s: &str) {
        let mut len = s.len().min(0xFFFF);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a sequence of values into one buffer
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode every value in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_bytes() {
        let values = vec![
            AmfValue::from("connect"),
            AmfValue::Number(1.0),
            AmfValue::object([("app", "live")]),
        ];
        let encoded = encode_all(&values);

        let expected: &[u8] = &[
            0x02, 0x00, 0x07, b'c', b'o', b'n', b'n', b'e', b'c', b't', //
            0x00, 0x3F, 0xF0, 0, 0, 0, 0, 0, 0, //
            0x03, 0x00, 0x03, b'a', b'p', b'p', 0x02, 0x00, 0x04, b'l', b'i', b'v', b'e', //
            0x00, 0x00, 0x09,
        ];
        assert_eq!(&encoded[..], expected);
        assert_eq!(decode_all(&encoded).unwrap(), values);
    }

    #[test]
    fn test_ecma_array_and_nested_values() {
        let value = AmfValue::object([
            ("code", AmfValue::from("NetConnection.Connect.Success")),
            (
                "data",
                AmfValue::ecma_array([("version", "3,5,3,888"), ("srs_id", "abc")]),
            ),
            ("list", AmfValue::StrictArray(vec![AmfValue::Null, true.into()])),
        ]);
        let decoded = decode_all(&encode_all(&[value.clone()])).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn test_missing_object_end_at_buffer_end() {
        // Object with one property, then the empty key and no 0x09.
        let data = [0x03, 0x00, 0x01, b'a', 0x05, 0x00, 0x00];
        let decoded = decode_all(&data).unwrap();
        assert_eq!(decoded, vec![AmfValue::object([("a", AmfValue::Null)])]);
    }

    #[test]
    fn test_bad_object_end() {
        let data = [0x03, 0x00, 0x00, 0x07];
        assert_eq!(decode_all(&data), Err(AmfError::InvalidObjectEnd));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode_all(&[0x00, 0x3F]), Err(AmfError::UnexpectedEof));
        assert_eq!(decode_all(&[0x02, 0x00, 0x05, b'a']), Err(AmfError::UnexpectedEof));
    }

    #[test]
    fn test_typed_object_and_reference() {
        // Typed object "T" { x: 1.0 }, then a reference to it.
        let mut data = vec![0x10, 0x00, 0x01, b'T', 0x00, 0x01, b'x', 0x00];
        data.extend_from_slice(&1.0f64.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00, 0x09, 0x07, 0x00, 0x00]);

        let decoded = decode_all(&data).unwrap();
        let expected = AmfValue::object([("x", 1.0)]);
        assert_eq!(decoded, vec![expected.clone(), expected]);
        assert_eq!(
            decode_all(&[0x07, 0x00, 0x03]),
            Err(AmfError::InvalidReference(3))
        );
    }

    #[test]
    fn test_amf3_switch_rejected() {
        assert_eq!(decode_all(&[0x11, 0x01]), Err(AmfError::UnknownMarker(0x11)));
    }

    #[test]
    fn test_nesting_limit() {
        let data = vec![MARKER_STRICT_ARRAY, 0, 0, 0, 1].repeat(MAX_NESTING_DEPTH + 1);
        assert_eq!(decode_all(&data), Err(AmfError::NestingTooDeep));
    }

    #[test]
    fn test_long_string() {
        let s = "x".repeat(70_000);
        let encoded = encode_all(&[AmfValue::from(s.as_str())]);
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(decode_all(&encoded).unwrap(), vec![AmfValue::String(s)]);
    }
}
