//! The D-Bus marshaller (§4.B): byte-exact serialization of [`Value`]s
//! against a [`Signature`], driven element by element.

use crate::error::{Error, ErrorKind};
use crate::protocol::Endianness;
use crate::signature::{Element, Signature};
use crate::value::{Value, Variant};

/// The maximum length of an array payload in bytes.
pub(crate) const MAX_ARRAY_LENGTH: u32 = 1u32 << 26;

/// How alignment padding is applied while marshalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// Apply the usual alignment padding before every element, as if
    /// writing directly into the enclosing message.
    Message,
    /// The caller has already applied the container's own alignment (for
    /// example the 8-byte pad before a struct's fields); per-element
    /// alignment inside the container is still applied, but relative to
    /// the absolute offset supplied to [`Marshaller::new`].
    StructContent,
}

/// Serializes [`Value`]s against a [`Signature`] in left-to-right order.
pub struct Marshaller<'a> {
    endianness: Endianness,
    #[allow(dead_code)]
    mode: AlignMode,
    elements: std::slice::Iter<'a, Element>,
    base_offset: usize,
    buf: Vec<u8>,
}

impl<'a> Marshaller<'a> {
    /// Construct a marshaller for `signature`, writing bytes as if the
    /// first byte landed at `base_offset` within the enclosing message.
    pub fn new(
        signature: &'a Signature,
        endianness: Endianness,
        mode: AlignMode,
        base_offset: usize,
    ) -> Marshaller<'a> {
        Marshaller {
            endianness,
            mode,
            elements: signature.elements().iter(),
            base_offset,
            buf: Vec::new(),
        }
    }

    /// Feed the next value in signature order.
    pub fn push(&mut self, value: &Value) -> Result<(), Error> {
        let Some(element) = self.elements.next() else {
            return Err(ErrorKind::ElementMismatch {
                got: value.type_name(),
                expected: "end of signature",
            }
            .into());
        };

        self.encode_value(element, value)
    }

    /// Finalize the marshaller, producing its byte vector.
    ///
    /// Fails with [`ErrorKind::Incomplete`] if the signature has not been
    /// fully fed.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        if self.elements.next().is_some() {
            return Err(ErrorKind::Incomplete.into());
        }

        Ok(std::mem::take(&mut self.buf))
    }

    fn position(&self) -> usize {
        self.base_offset + self.buf.len()
    }

    fn align_to(&mut self, align: usize) {
        let pos = self.position();
        let pad = (align - (pos % align)) % align;
        self.buf.resize(self.buf.len() + pad, 0);
    }

    fn write_bytes(&mut self, little: [u8; 8], len: usize, big: [u8; 8]) {
        match self.endianness {
            Endianness::LITTLE => self.buf.extend_from_slice(&little[..len]),
            _ => self.buf.extend_from_slice(&big[..len]),
        }
    }

    fn write_u16(&mut self, v: u16) {
        let mut le = [0u8; 8];
        le[..2].copy_from_slice(&v.to_le_bytes());
        let mut be = [0u8; 8];
        be[..2].copy_from_slice(&v.to_be_bytes());
        self.write_bytes(le, 2, be);
    }

    fn write_u32(&mut self, v: u32) {
        let mut le = [0u8; 8];
        le[..4].copy_from_slice(&v.to_le_bytes());
        let mut be = [0u8; 8];
        be[..4].copy_from_slice(&v.to_be_bytes());
        self.write_bytes(le, 4, be);
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(v.to_le_bytes(), 8, v.to_be_bytes());
    }

    fn write_string_like(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn patch_u32_at(&mut self, pos: usize, v: u32) {
        let bytes = match self.endianness {
            Endianness::LITTLE => v.to_le_bytes(),
            _ => v.to_be_bytes(),
        };
        self.buf[pos..pos + 4].copy_from_slice(&bytes);
    }

    fn encode_value(&mut self, element: &Element, value: &Value) -> Result<(), Error> {
        self.align_to(element.alignment());

        match (element, value) {
            (Element::Byte, Value::Byte(v)) => self.buf.push(*v),
            (Element::Bool, Value::Bool(v)) => self.write_u32(u32::from(*v)),
            (Element::Int16, Value::Int16(v)) => self.write_u16(*v as u16),
            (Element::Uint16, Value::Uint16(v)) => self.write_u16(*v),
            (Element::Int32, Value::Int32(v)) => self.write_u32(*v as u32),
            (Element::Uint32, Value::Uint32(v)) => self.write_u32(*v),
            (Element::Int64, Value::Int64(v)) => self.write_u64(*v as u64),
            (Element::Uint64, Value::Uint64(v)) => self.write_u64(*v),
            (Element::Double, Value::Double(v)) => self.write_u64(v.to_bits()),
            (Element::UnixFd, Value::UnixFd(v)) => self.write_u32(*v),
            (Element::String, Value::Str(s)) => self.write_string_like(s),
            (Element::ObjectPath, Value::ObjectPath(p)) => self.write_string_like(p.as_str()),
            (Element::Signature, Value::Signature(sig)) => {
                let s = sig.to_signature_string();

                if s.len() > u8::MAX as usize {
                    return Err(ErrorKind::CannotMarshalType.into());
                }

                self.buf.push(s.len() as u8);
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.push(0);
            }
            (Element::Variant, Value::Variant(variant)) => self.encode_variant(variant)?,
            (Element::Array(inner), Value::Array(items)) => self.encode_array(inner, items)?,
            (Element::Array(dict_entry), Value::Dict(entries)) => {
                self.encode_dict(dict_entry, entries)?
            }
            (Element::Struct(field_elements), Value::Struct(fields)) => {
                if field_elements.len() != fields.len() {
                    return Err(ErrorKind::ElementMismatch {
                        got: "struct",
                        expected: "struct with matching field count",
                    }
                    .into());
                }

                for (field_element, field_value) in field_elements.iter().zip(fields) {
                    self.encode_value(field_element, field_value)?;
                }
            }
            (element, value) => {
                return Err(ErrorKind::ElementMismatch {
                    got: value.type_name(),
                    expected: element_name(element),
                }
                .into())
            }
        }

        Ok(())
    }

    fn encode_variant(&mut self, variant: &Variant) -> Result<(), Error> {
        let sig = variant.signature().to_signature_string();

        if sig.len() > u8::MAX as usize {
            return Err(ErrorKind::CannotMarshalType.into());
        }

        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);

        let inner = variant.signature().single()?;
        self.encode_value(inner, variant.value())
    }

    fn encode_array(&mut self, inner: &Element, items: &[Value]) -> Result<(), Error> {
        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0u8; 4]);
        self.align_to(inner.alignment());
        let start = self.buf.len();

        for item in items {
            self.encode_value(inner, item)?;
        }

        let payload_len = self.buf.len() - start;

        if payload_len as u64 > MAX_ARRAY_LENGTH as u64 {
            return Err(ErrorKind::InvalidValue("array").into());
        }

        self.patch_u32_at(len_pos, payload_len as u32);
        Ok(())
    }

    fn encode_dict(
        &mut self,
        dict_entry: &Element,
        entries: &[(Value, Value)],
    ) -> Result<(), Error> {
        let Element::DictEntry(key_element, value_element) = dict_entry else {
            return Err(ErrorKind::ElementMismatch {
                got: "dict",
                expected: "array of dict-entry",
            }
            .into());
        };

        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0u8; 4]);
        self.align_to(dict_entry.alignment());
        let start = self.buf.len();

        for (key, value) in entries {
            self.align_to(dict_entry.alignment());
            self.encode_value(key_element, key)?;
            self.encode_value(value_element, value)?;
        }

        let payload_len = self.buf.len() - start;

        if payload_len as u64 > MAX_ARRAY_LENGTH as u64 {
            return Err(ErrorKind::InvalidValue("array").into());
        }

        self.patch_u32_at(len_pos, payload_len as u32);
        Ok(())
    }
}

fn element_name(element: &Element) -> &'static str {
    match element {
        Element::Byte => "byte",
        Element::Bool => "bool",
        Element::Int16 => "int16",
        Element::Uint16 => "uint16",
        Element::Int32 => "int32",
        Element::Uint32 => "uint32",
        Element::Int64 => "int64",
        Element::Uint64 => "uint64",
        Element::Double => "double",
        Element::String => "string",
        Element::ObjectPath => "object_path",
        Element::Signature => "signature",
        Element::Variant => "variant",
        Element::UnixFd => "unix_fd",
        Element::Array(_) => "array",
        Element::DictEntry(..) => "dict_entry",
        Element::Struct(_) => "struct",
    }
}

/// Marshal a single complete value against a single-element signature,
/// starting at message offset 0. Convenience wrapper around
/// [`Marshaller`] for the common case.
pub fn marshal(signature: &Signature, endianness: Endianness, value: &Value) -> Result<Vec<u8>, Error> {
    let mut marshaller = Marshaller::new(signature, endianness, AlignMode::Message, 0);
    marshaller.push(value)?;
    marshaller.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::parse(s).unwrap()
    }

    #[test]
    fn marshals_string() {
        let bytes = marshal(&sig("s"), Endianness::LITTLE, &Value::Str("hello".into())).unwrap();
        assert_eq!(
            bytes,
            vec![0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o', 0x00]
        );
    }

    #[test]
    fn marshals_struct_with_mixed_alignment() {
        // (yx) forces 7 bytes of padding between the byte and the int64.
        let bytes = marshal(
            &sig("(yx)"),
            Endianness::LITTLE,
            &Value::Struct(vec![Value::Byte(1), Value::Int64(2)]),
        )
        .unwrap();

        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[8..16], &2i64.to_le_bytes());
    }

    #[test]
    fn marshals_dict_with_variant_value() {
        let entries = vec![(
            Value::Str("Volume".into()),
            Value::Variant(Variant::new(sig("i"), Value::Int32(7))),
        )];

        let bytes = marshal(&sig("a{sv}"), Endianness::LITTLE, &Value::Dict(entries)).unwrap();
        // length(4) + pad-to-8(4) + key len(4) + "Volume"(6) + NUL(1) + pad-to-4(1)
        // + variant sig len(1) + "i"(1) + NUL(1) + pad-to-4(1) + value(4)
        assert_eq!(bytes.len(), 4 + 4 + 4 + 6 + 1 + 1 + 1 + 1 + 1 + 1 + 4);
    }

    #[test]
    fn rejects_element_mismatch() {
        let err = marshal(&sig("s"), Endianness::LITTLE, &Value::Uint32(1));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_incomplete_signature() {
        let mut marshaller = Marshaller::new(&sig("ss"), Endianness::LITTLE, AlignMode::Message, 0);
        marshaller.push(&Value::Str("a".into())).unwrap();
        assert!(marshaller.finish().is_err());
    }
}
