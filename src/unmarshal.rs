//! The D-Bus unmarshaller (§4.C): inverse of [`crate::marshal`], reading
//! [`Value`]s from a byte slice in lockstep with a [`Signature`].

use crate::error::{Error, ErrorKind};
use crate::marshal::{AlignMode, MAX_ARRAY_LENGTH};
use crate::object_path::ObjectPathBuf;
use crate::protocol::Endianness;
use crate::signature::{Element, Signature};
use crate::value::{Value, Variant};

/// Reads [`Value`]s from a byte slice against a [`Signature`], in
/// left-to-right order.
pub struct Unmarshaller<'de, 'a> {
    buf: &'de [u8],
    endianness: Endianness,
    #[allow(dead_code)]
    mode: AlignMode,
    elements: std::slice::Iter<'a, Element>,
    base_offset: usize,
    pos: usize,
}

impl<'de, 'a> Unmarshaller<'de, 'a> {
    /// Construct an unmarshaller over `buf`, as if its first byte sat at
    /// `base_offset` within the enclosing message.
    pub fn new(
        buf: &'de [u8],
        signature: &'a Signature,
        endianness: Endianness,
        mode: AlignMode,
        base_offset: usize,
    ) -> Unmarshaller<'de, 'a> {
        Unmarshaller {
            buf,
            endianness,
            mode,
            elements: signature.elements().iter(),
            base_offset,
            pos: 0,
        }
    }

    /// How many bytes have been consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Decode the next value in signature order.
    pub fn pop(&mut self) -> Result<Value, Error> {
        let Some(element) = self.elements.next() else {
            return Err(ErrorKind::ElementMismatch {
                got: "value",
                expected: "end of signature",
            }
            .into());
        };

        self.decode_value(element)
    }

    /// Assert the whole signature has been consumed.
    pub fn finish(mut self) -> Result<(), Error> {
        if self.elements.next().is_some() {
            return Err(ErrorKind::Incomplete.into());
        }

        Ok(())
    }

    fn position(&self) -> usize {
        self.base_offset + self.pos
    }

    fn align_to(&mut self, align: usize) -> Result<(), Error> {
        let pos = self.position();
        let pad = (align - (pos % align)) % align;
        self.advance(pad)
    }

    fn advance(&mut self, n: usize) -> Result<(), Error> {
        if self.pos + n > self.buf.len() {
            return Err(ErrorKind::Truncated.into());
        }

        self.pos += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'de [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(ErrorKind::Truncated.into());
        }

        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();

        Ok(match self.endianness {
            Endianness::LITTLE => u16::from_le_bytes(bytes),
            _ => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();

        Ok(match self.endianness {
            Endianness::LITTLE => u32::from_le_bytes(bytes),
            _ => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();

        Ok(match self.endianness {
            Endianness::LITTLE => u64::from_le_bytes(bytes),
            _ => u64::from_be_bytes(bytes),
        })
    }

    fn read_string_like(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)?.to_string();
        let nul = self.take(1)?;

        if nul != [0] {
            return Err(ErrorKind::InvalidValue("string").into());
        }

        Ok(s)
    }

    fn decode_value(&mut self, element: &Element) -> Result<Value, Error> {
        self.align_to(element.alignment())?;

        Ok(match element {
            Element::Byte => Value::Byte(self.take(1)?[0]),
            Element::Bool => {
                let v = self.read_u32()?;

                match v {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    _ => return Err(ErrorKind::InvalidValue("bool").into()),
                }
            }
            Element::Int16 => Value::Int16(self.read_u16()? as i16),
            Element::Uint16 => Value::Uint16(self.read_u16()?),
            Element::Int32 => Value::Int32(self.read_u32()? as i32),
            Element::Uint32 => Value::Uint32(self.read_u32()?),
            Element::Int64 => Value::Int64(self.read_u64()? as i64),
            Element::Uint64 => Value::Uint64(self.read_u64()?),
            Element::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            Element::UnixFd => Value::UnixFd(self.read_u32()?),
            Element::String => Value::Str(self.read_string_like()?),
            Element::ObjectPath => {
                let s = self.read_string_like()?;
                Value::ObjectPath(
                    ObjectPathBuf::new(s).map_err(|_| Error::from(ErrorKind::InvalidValue("object_path")))?,
                )
            }
            Element::Signature => {
                let len = self.take(1)?[0] as usize;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes)?;
                let sig = Signature::parse(s)?;
                let nul = self.take(1)?;

                if nul != [0] {
                    return Err(ErrorKind::InvalidValue("signature").into());
                }

                Value::Signature(sig)
            }
            Element::Variant => Value::Variant(self.decode_variant()?),
            Element::Array(inner) => self.decode_array(inner)?,
            Element::Struct(field_elements) => {
                let mut fields = Vec::with_capacity(field_elements.len());

                for field_element in field_elements {
                    fields.push(self.decode_value(field_element)?);
                }

                Value::Struct(fields)
            }
            Element::DictEntry(..) => return Err(ErrorKind::CannotMarshalType.into()),
        })
    }

    fn decode_variant(&mut self) -> Result<Variant, Error> {
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        let sig_str = std::str::from_utf8(bytes)?;
        let sig = Signature::parse(sig_str)?;
        let nul = self.take(1)?;

        if nul != [0] {
            return Err(ErrorKind::InvalidValue("variant").into());
        }

        let inner_element = sig.single()?;
        let value = self.decode_value(inner_element)?;
        Ok(Variant::new(sig, value))
    }

    fn decode_array(&mut self, inner: &Element) -> Result<Value, Error> {
        let payload_len = self.read_u32()?;

        if payload_len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::InvalidValue("array").into());
        }

        self.align_to(inner.alignment())?;
        let start = self.pos;
        let end = start
            .checked_add(payload_len as usize)
            .ok_or_else(|| Error::from(ErrorKind::Truncated))?;

        if end > self.buf.len() {
            return Err(ErrorKind::Truncated.into());
        }

        if let Element::DictEntry(key_element, value_element) = inner {
            let mut entries = Vec::new();

            while self.pos < end {
                self.align_to(inner.alignment())?;
                let key = self.decode_value(key_element)?;
                let value = self.decode_value(value_element)?;
                entries.push((key, value));
            }

            if self.pos != end {
                return Err(ErrorKind::InvalidBodyLength.into());
            }

            return Ok(Value::Dict(entries));
        }

        let mut items = Vec::new();

        while self.pos < end {
            items.push(self.decode_value(inner)?);
        }

        if self.pos != end {
            return Err(ErrorKind::InvalidBodyLength.into());
        }

        Ok(Value::Array(items))
    }
}

/// Unmarshal a single complete value against a single-element signature,
/// starting at message offset 0.
pub fn unmarshal(
    buf: &[u8],
    signature: &Signature,
    endianness: Endianness,
) -> Result<Value, Error> {
    let mut unmarshaller = Unmarshaller::new(buf, signature, endianness, AlignMode::Message, 0);
    let value = unmarshaller.pop()?;
    unmarshaller.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::parse(s).unwrap()
    }

    #[test]
    fn unmarshals_string() {
        let bytes = [0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o', 0x00];
        let value = unmarshal(&bytes, &sig("s"), Endianness::LITTLE).unwrap();
        assert_eq!(value, Value::Str("hello".into()));
    }

    #[test]
    fn rejects_missing_nul_terminator() {
        let bytes = [0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o', b'x'];
        assert!(unmarshal(&bytes, &sig("s"), Endianness::LITTLE).is_err());
    }

    #[test]
    fn round_trips_struct_with_mixed_alignment() {
        use crate::marshal::marshal;

        let value = Value::Struct(vec![Value::Byte(1), Value::Int64(2)]);
        let bytes = marshal(&sig("(yx)"), Endianness::LITTLE, &value).unwrap();
        let decoded = unmarshal(&bytes, &sig("(yx)"), Endianness::LITTLE).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_dict_with_variant() {
        use crate::marshal::marshal;

        let value = Value::Dict(vec![(
            Value::Str("Volume".into()),
            Value::Variant(Variant::new(sig("i"), Value::Int32(7))),
        )]);
        let bytes = marshal(&sig("a{sv}"), Endianness::LITTLE, &value).unwrap();
        let decoded = unmarshal(&bytes, &sig("a{sv}"), Endianness::LITTLE).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn empty_array_round_trips() {
        use crate::marshal::marshal;

        let value = Value::Array(vec![]);
        let bytes = marshal(&sig("ai"), Endianness::LITTLE, &value).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        let decoded = unmarshal(&bytes, &sig("ai"), Endianness::LITTLE).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = [0x05, 0x00, 0x00, 0x00, b'h', b'e'];
        assert!(unmarshal(&bytes, &sig("s"), Endianness::LITTLE).is_err());
    }
}
