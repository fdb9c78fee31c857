//! Bencode encoding ([BEP-3]), enough to hash an info dictionary.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use std::collections::BTreeMap;

use bytes::Bytes;

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Integer(i64),
    Bytes(Bytes),
    /// Keys are kept sorted, as canonical bencode requires.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Builds a dictionary from `(key, value)` pairs in any order.
pub(crate) fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(key, value)| (Bytes::copy_from_slice(key.as_bytes()), value))
            .collect(),
    )
}

/// Encodes a value in canonical form.
pub(crate) fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::Dict(entries) => {
            buf.push(b'd');
            for (key, value) in entries {
                encode_bytes(key, buf);
                encode_value(value, buf);
            }
            buf.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Integer(42)), b"i42e");
        assert_eq!(encode(&Value::Integer(-3)), b"i-3e");
        assert_eq!(encode(&Value::string("spam")), b"4:spam");
        assert_eq!(encode(&Value::Bytes(Bytes::new())), b"0:");
    }

    #[test]
    fn test_dict_keys_are_sorted() {
        let value = dict([
            ("piece length", Value::Integer(16384)),
            ("length", Value::Integer(11)),
            ("name", Value::string("a")),
        ]);
        assert_eq!(
            encode(&value),
            b"d6:lengthi11e4:name1:a12:piece lengthi16384ee"
        );
    }
}
