use bytes::Bytes;

use super::value::{key, Dict};
use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i-e").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::from_static(b"")));
    assert!(decode(b"5:spam").is_err());
}

#[test]
fn test_decode_list() {
    let result = decode(b"l4:spami42ee").unwrap();
    let items = result.as_list().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_str(), Some("spam"));
    assert_eq!(items[1].as_integer(), Some(42));
}

#[test]
fn test_decode_dict() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(result.get_str(b"cow"), Some("moo"));
    assert_eq!(result.get_str(b"spam"), Some("eggs"));
    assert_eq!(result.get(b"missing"), None);
}

#[test]
fn test_dict_key_must_be_string() {
    assert!(matches!(
        decode(b"di1e3:mooe"),
        Err(BencodeError::InvalidDictKey)
    ));
}

#[test]
fn test_encode_scalars() {
    assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
    assert_eq!(encode(&Value::string("spam")), b"4:spam");
}

#[test]
fn test_encode_dict_sorted() {
    let mut dict = Dict::new();
    dict.insert(key("zoo"), Value::Integer(1));
    dict.insert(key("cow"), Value::string("moo"));
    assert_eq!(encode(&Value::Dict(dict)), b"d3:cow3:moo3:zooi1ee");
}

#[test]
fn test_roundtrip() {
    let original: &[u8] =
        b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let decoded = decode(original).unwrap();
    assert_eq!(encode(&decoded), original);
}

#[test]
fn test_trailing_data_error() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn test_nesting_limit() {
    let mut deep = vec![b'l'; 100];
    deep.extend(vec![b'e'; 100]);
    assert!(matches!(decode(&deep), Err(BencodeError::NestingTooDeep)));
}

#[test]
fn test_binary_bytes_survive() {
    let raw = [0u8, 1, 2, 254, 255];
    let mut encoded = Vec::new();
    encoded.extend_from_slice(b"5:");
    encoded.extend_from_slice(&raw);

    let decoded = decode(&encoded).unwrap();
    assert_eq!(decoded.as_bytes().unwrap().as_ref(), &raw);
    assert_eq!(decoded.as_str(), None);
}
