//! The D-Bus signature grammar: parsing, re-emitting and per-element
//! alignment (§4.A).

use std::fmt;

use crate::error::{Error, ErrorKind};

/// A single element of a signature.
///
/// Elements nest: [`Element::Array`] and [`Element::DictEntry`] box their
/// inner element(s), [`Element::Struct`] holds an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// `y`
    Byte,
    /// `b`
    Bool,
    /// `n`
    Int16,
    /// `q`
    Uint16,
    /// `i`
    Int32,
    /// `u`
    Uint32,
    /// `x`
    Int64,
    /// `t`
    Uint64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `g`
    Signature,
    /// `v`
    Variant,
    /// `h`
    UnixFd,
    /// `a<e>`
    Array(Box<Element>),
    /// `a{kv}`, only ever appears as the element of an [`Element::Array`].
    DictEntry(Box<Element>, Box<Element>),
    /// `(e1 e2 ...)`
    Struct(Vec<Element>),
}

impl Element {
    /// The alignment, in bytes, of a value of this element.
    pub fn alignment(&self) -> usize {
        match self {
            Element::Byte | Element::Signature | Element::Variant => 1,
            Element::Int16 | Element::Uint16 => 2,
            Element::Bool
            | Element::Int32
            | Element::Uint32
            | Element::String
            | Element::ObjectPath
            | Element::UnixFd
            | Element::Array(_) => 4,
            Element::Int64
            | Element::Uint64
            | Element::Double
            | Element::Struct(_)
            | Element::DictEntry(..) => 8,
        }
    }

    /// Whether this element is a basic (non-container) type, i.e. one that
    /// may legally act as a dict-entry key.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Element::Array(_) | Element::DictEntry(..) | Element::Struct(_) | Element::Variant
        )
    }

    /// Render this element as its canonical signature string.
    pub fn to_signature_string(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Element::Byte => out.push('y'),
            Element::Bool => out.push('b'),
            Element::Int16 => out.push('n'),
            Element::Uint16 => out.push('q'),
            Element::Int32 => out.push('i'),
            Element::Uint32 => out.push('u'),
            Element::Int64 => out.push('x'),
            Element::Uint64 => out.push('t'),
            Element::Double => out.push('d'),
            Element::String => out.push('s'),
            Element::ObjectPath => out.push('o'),
            Element::Signature => out.push('g'),
            Element::Variant => out.push('v'),
            Element::UnixFd => out.push('h'),
            Element::Array(inner) => {
                out.push('a');
                inner.write_signature(out);
            }
            Element::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            Element::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_signature_string())
    }
}

/// A parsed, owned signature: an ordered sequence of [`Element`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    elements: Vec<Element>,
}

impl Signature {
    /// The empty signature.
    pub const EMPTY: Signature = Signature {
        elements: Vec::new(),
    };

    /// Parse a signature string.
    pub fn parse(input: &str) -> Result<Signature, Error> {
        let bytes = input.as_bytes();
        let mut pos = 0;
        let mut elements = Vec::new();

        while pos < bytes.len() {
            elements.push(parse_element(bytes, &mut pos)?);
        }

        Ok(Signature { elements })
    }

    /// The elements of this signature, in order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// View this signature as a single element, if it contains exactly one.
    pub fn single(&self) -> Result<&Element, Error> {
        match self.elements.as_slice() {
            [element] => Ok(element),
            _ => Err(ErrorKind::InvalidSignature(
                "expected exactly one complete type".into(),
            )
            .into()),
        }
    }

    /// Whether the signature contains no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Render this signature as its canonical string form.
    pub fn to_signature_string(&self) -> String {
        let mut out = String::new();

        for element in &self.elements {
            element.write_signature(&mut out);
        }

        out
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_signature_string())
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Signature::parse(value)
    }
}

fn parse_element(bytes: &[u8], pos: &mut usize) -> Result<Element, Error> {
    let Some(&code) = bytes.get(*pos) else {
        return Err(invalid("unexpected end of signature"));
    };

    *pos += 1;

    Ok(match code {
        b'y' => Element::Byte,
        b'b' => Element::Bool,
        b'n' => Element::Int16,
        b'q' => Element::Uint16,
        b'i' => Element::Int32,
        b'u' => Element::Uint32,
        b'x' => Element::Int64,
        b't' => Element::Uint64,
        b'd' => Element::Double,
        b's' => Element::String,
        b'o' => Element::ObjectPath,
        b'g' => Element::Signature,
        b'v' => Element::Variant,
        b'h' => Element::UnixFd,
        b'a' => {
            if bytes.get(*pos) == Some(&b'{') {
                *pos += 1;
                let key = parse_element(bytes, pos)?;

                if !key.is_basic() {
                    return Err(invalid("dict-entry key must be a basic type"));
                }

                let value = parse_element(bytes, pos)?;

                if bytes.get(*pos) != Some(&b'}') {
                    return Err(invalid("unterminated dict-entry"));
                }

                *pos += 1;
                Element::Array(Box::new(Element::DictEntry(Box::new(key), Box::new(value))))
            } else {
                let inner = parse_element(bytes, pos)?;
                Element::Array(Box::new(inner))
            }
        }
        b'(' => {
            let mut fields = Vec::new();

            loop {
                match bytes.get(*pos) {
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => fields.push(parse_element(bytes, pos)?),
                    None => return Err(invalid("unterminated struct")),
                }
            }

            Element::Struct(fields)
        }
        b')' | b'}' => return Err(invalid("unbalanced closing bracket")),
        b'{' => return Err(invalid("dict-entry outside of an array")),
        other => return Err(invalid_code(other)),
    })
}

fn invalid(detail: &str) -> Error {
    ErrorKind::InvalidSignature(detail.to_string()).into()
}

fn invalid_code(code: u8) -> Error {
    ErrorKind::InvalidSignature(format!("unknown type code `{}`", code as char)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_types() {
        let sig = Signature::parse("ybnqiuxtdsog").unwrap();
        assert_eq!(sig.elements().len(), 12);
        assert_eq!(sig.to_signature_string(), "ybnqiuxtdsog");
    }

    #[test]
    fn parses_nested_containers() {
        let sig = Signature::parse("a{sv}").unwrap();
        assert_eq!(sig.to_signature_string(), "a{sv}");

        let sig = Signature::parse("(yx)").unwrap();
        assert_eq!(sig.to_signature_string(), "(yx)");

        let sig = Signature::parse("aa{sv}").unwrap();
        assert_eq!(sig.to_signature_string(), "aa{sv}");
    }

    #[test]
    fn rejects_dict_entry_with_container_key() {
        assert!(Signature::parse("a{vs}").is_err());
    }

    #[test]
    fn rejects_dict_entry_outside_array() {
        assert!(Signature::parse("{sv}").is_err());
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(Signature::parse("Z").is_err());
    }

    #[test]
    fn rejects_unbalanced_struct() {
        assert!(Signature::parse("(y").is_err());
        assert!(Signature::parse("y)").is_err());
    }

    #[test]
    fn alignment_matches_table() {
        assert_eq!(Element::Byte.alignment(), 1);
        assert_eq!(Element::Int16.alignment(), 2);
        assert_eq!(Element::Uint32.alignment(), 4);
        assert_eq!(Element::Int64.alignment(), 8);
        assert_eq!(Element::Struct(vec![]).alignment(), 8);
    }
}
