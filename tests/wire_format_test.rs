use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tagform::core::*;
use tagform::{serialize, to_bytes, EncoderError, Encode, Frame, Record, Registry, Writer};
use uuid::Uuid;

const F1: u8 = 17;

#[derive(Record)]
struct One<T> {
    #[tagform(tag = 17)]
    value: T,
}

fn encode<T: Encode>(value: T) -> Vec<u8> {
    to_bytes(&One { value }).unwrap().to_vec()
}

fn with_header(manifest: u8, payload: &[u8]) -> Vec<u8> {
    let mut expected = vec![F1, manifest];
    expected.extend_from_slice(payload);
    expected
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut expected = (payload.len() as i16).to_le_bytes().to_vec();
    expected.extend_from_slice(payload);
    expected
}

#[test]
fn test_bool() {
    assert_eq!(encode(true), vec![F1, MANIFEST_BOOL, 1]);
    assert_eq!(encode(false), vec![F1, MANIFEST_BOOL, 0]);
}

#[test]
fn test_bools() {
    assert_eq!(encode(vec![true]), vec![F1, 17, 1, 0, 1]);
    assert_eq!(
        encode(vec![true, false, true, false]),
        vec![F1, 17, 4, 0, 1, 0, 1, 0]
    );
}

#[test]
fn test_nullable_bool() {
    assert_eq!(encode(Some(true)), vec![F1, 33, 1]);
    assert_eq!(encode(Some(false)), vec![F1, 33, 0]);
    assert_eq!(encode(None::<bool>), Vec::<u8>::new());
}

#[test]
fn test_bytes_and_sbytes() {
    assert_eq!(encode(0u8), vec![F1, MANIFEST_BYTE, 0]);
    assert_eq!(encode(255u8), vec![F1, MANIFEST_BYTE, 255]);
    assert_eq!(encode(i8::MIN), vec![F1, MANIFEST_SBYTE, 128]);
    assert_eq!(encode(i8::MAX), vec![F1, MANIFEST_SBYTE, 127]);
}

#[test]
fn test_byte_arrays() {
    assert_eq!(encode(vec![0u8]), vec![F1, 18, 1, 0, 0]);
    assert_eq!(encode(vec![3u8]), vec![F1, 18, 1, 0, 3]);
    assert_eq!(encode(Bytes::from_static(&[3])), vec![F1, 18, 1, 0, 3]);
    // a fixed-size array goes through the item writer but yields the same bytes
    assert_eq!(encode([3u8]), vec![F1, 18, 1, 0, 3]);
}

#[test]
fn test_16_bit_integers() {
    assert_eq!(encode(1i16), vec![F1, MANIFEST_INT16, 1, 0]);
    assert_eq!(encode(i16::MIN), vec![F1, MANIFEST_INT16, 0, 128]);
    assert_eq!(encode(i16::MAX), vec![F1, MANIFEST_INT16, 255, 127]);
    assert_eq!(encode(2u16), vec![F1, MANIFEST_UINT16, 2, 0]);
    assert_eq!(encode(u16::MAX), vec![F1, MANIFEST_UINT16, 255, 255]);
}

#[test]
fn test_int32() {
    let cases: [(i32, &[u8]); 6] = [
        (0, &[0]),
        (1, &[2]),
        (2, &[4]),
        (-1, &[1]),
        (-2, &[3]),
        (256, &[128, 4]),
    ];
    for (value, payload) in cases {
        assert_eq!(encode(value), with_header(MANIFEST_INT32, payload), "{value}");
    }
}

#[test]
fn test_nullable_int32() {
    assert_eq!(encode(None::<i32>), Vec::<u8>::new());
    assert_eq!(encode(Some(1i32)), vec![F1, 38, 2]);
}

#[test]
fn test_int32_arrays() {
    assert_eq!(encode(vec![0i32]), vec![F1, 22, 1, 0, 0]);
    assert_eq!(encode(vec![256i32]), vec![F1, 22, 2, 0, 128, 4]);
}

#[test]
fn test_nullable_int32_arrays() {
    assert_eq!(encode(vec![Some(256i32)]), vec![F1, 54, 3, 0, 1, 128, 4]);
    assert_eq!(encode(vec![None::<i32>]), vec![F1, 54, 1, 0, 0]);
}

#[test]
fn test_uint32() {
    assert_eq!(encode(1u32), vec![F1, MANIFEST_UINT32, 1]);
    assert_eq!(encode(256u32), vec![F1, MANIFEST_UINT32, 128, 2]);
}

#[test]
fn test_64_bit_integers() {
    assert_eq!(encode(-2i64), vec![F1, MANIFEST_INT64, 3]);
    assert_eq!(encode(256i64), vec![F1, MANIFEST_INT64, 128, 4]);
    assert_eq!(
        encode(i64::MAX),
        with_header(MANIFEST_INT64, &[254, 255, 255, 255, 255, 255, 255, 255, 255, 1])
    );
    assert_eq!(
        encode(i64::MIN),
        with_header(MANIFEST_INT64, &[255, 255, 255, 255, 255, 255, 255, 255, 255, 1])
    );
    assert_eq!(encode(256u64), vec![F1, MANIFEST_UINT64, 128, 2]);
    assert_eq!(
        encode(u64::MAX),
        with_header(MANIFEST_UINT64, &[255, 255, 255, 255, 255, 255, 255, 255, 255, 1])
    );
}

#[test]
fn test_guid() {
    let raw: [u8; 16] = std::array::from_fn(|i| i as u8 + 1);
    assert_eq!(encode(Uuid::from_bytes(raw)), with_header(MANIFEST_GUID, &raw));
    assert_eq!(encode(None::<Uuid>), Vec::<u8>::new());
}

#[test]
fn test_datetime() {
    let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
    assert_eq!(
        encode(epoch),
        with_header(MANIFEST_DATETIME, &UNIX_EPOCH_TICKS.to_le_bytes())
    );

    let later = DateTime::<Utc>::from_timestamp(1, 500).unwrap();
    let ticks = UNIX_EPOCH_TICKS + TICKS_PER_SECOND + 5;
    assert_eq!(encode(later), with_header(MANIFEST_DATETIME, &ticks.to_le_bytes()));
}

#[test]
fn test_string() {
    assert_eq!(
        encode("test".to_string()),
        vec![F1, MANIFEST_STRING, 4, 0, b't', b'e', b's', b't']
    );
    assert_eq!(encode(String::new()), vec![F1, MANIFEST_STRING, 0, 0]);
    assert_eq!(encode("test"), encode("test".to_string()));
    assert_eq!(encode(None::<String>), Vec::<u8>::new());
}

#[derive(Record)]
struct Label {
    #[tagform(tag = 1)]
    name: &'static str,
    #[tagform(tag = 2)]
    aliases: Vec<&'static str>,
}

#[test]
fn test_static_str_fields() {
    let value = Label {
        name: "ab",
        aliases: vec!["c"],
    };
    let mut expected = vec![1, MANIFEST_STRING, 2, 0, b'a', b'b'];
    expected.extend_from_slice(&[2, FLAG_ARRAY | MANIFEST_STRING, 3, 0, 1, 0, b'c']);
    assert_eq!(to_bytes(&value).unwrap().to_vec(), expected);
}

#[test]
fn test_multibyte_string() {
    let value = "żółw";
    assert_eq!(
        encode(value.to_string()),
        with_header(MANIFEST_STRING, &framed(value.as_bytes()))
    );
}

#[test]
fn test_string_arrays() {
    let item = framed(b"test");
    let expected = with_header(26, &framed(&[item.clone(), item].concat()));
    assert_eq!(encode(vec!["test".to_string(), "test".to_string()]), expected);

    let long = "test3452347fh3h4f89h349fh9h3489f8342fh43f98h348fh8348f9h4383h42f";
    let item = framed(long.as_bytes());
    let expected = with_header(26, &framed(&[item.clone(), item].concat()));
    assert_eq!(encode(vec![long.to_string(), long.to_string()]), expected);

    assert_eq!(
        encode(vec![String::new(), String::new()]),
        vec![F1, 26, 4, 0, 0, 0, 0, 0]
    );
}

#[test]
fn test_null_strings_in_array() {
    assert_eq!(
        encode(vec![None::<String>, None]),
        vec![F1, 26, 4, 0, 255, 255, 255, 255]
    );
    assert_eq!(
        encode(vec![Some("a".to_string()), None]),
        vec![F1, 26, 5, 0, 1, 0, b'a', 255, 255]
    );
}

#[test]
fn test_other_sequences() {
    use std::collections::{BTreeSet, VecDeque};

    let expected = vec![F1, 22, 3, 0, 2, 4, 6];
    assert_eq!(encode(VecDeque::from(vec![1i32, 2, 3])), expected);
    assert_eq!(encode(BTreeSet::from([3i32, 1, 2])), expected);
    assert_eq!(encode([1i32, 2, 3]), expected);
    assert_eq!(encode(Vec::<i32>::new()), vec![F1, 22, 0, 0]);
}

#[test]
fn test_optional_array() {
    assert_eq!(encode(None::<Vec<i32>>), Vec::<u8>::new());
    assert_eq!(encode(Some(vec![1i32])), vec![F1, 22, 1, 0, 2]);
}

#[test]
fn test_box_and_arc_are_transparent() {
    assert_eq!(encode(Box::new(256i32)), encode(256i32));
    assert_eq!(encode(Arc::new("x".to_string())), encode("x".to_string()));
    assert_eq!(encode(Some(Box::new(true))), vec![F1, 33, 1]);
}

#[derive(Record)]
struct Scenario {
    #[tagform(tag = 1)]
    flag: bool,
    #[tagform(tag = 2)]
    count: i32,
    #[tagform(tag = 3)]
    name: String,
    #[tagform(tag = 4)]
    maybe: Option<bool>,
    #[tagform(tag = 5)]
    id: Uuid,
}

#[test]
fn test_few_values() {
    let raw: [u8; 16] = std::array::from_fn(|i| 0xA0 + i as u8);
    let value = Scenario {
        flag: true,
        count: 2,
        name: "some".to_string(),
        maybe: Some(true),
        id: Uuid::from_bytes(raw),
    };

    let mut expected = vec![1, 1, 1, 2, 6, 4, 3, 10, 4, 0];
    expected.extend_from_slice(b"some");
    expected.extend_from_slice(&[4, 33, 1, 5, 11]);
    expected.extend_from_slice(&raw);
    assert_eq!(to_bytes(&value).unwrap().to_vec(), expected);
}

#[derive(Record)]
struct Inner {
    #[tagform(tag = 5)]
    value: i32,
}

#[derive(Record)]
struct Outer {
    #[tagform(tag = 3)]
    inner: Inner,
}

#[derive(Record)]
struct OuterWithSibling {
    #[tagform(tag = 1)]
    inner: Option<Inner>,
    #[tagform(tag = 9)]
    after: u8,
}

#[test]
fn test_nested_object() {
    let value = Outer {
        inner: Inner { value: 3 },
    };
    assert_eq!(to_bytes(&value).unwrap().to_vec(), vec![3, 13, 3, 0, 5, 6, 6]);
}

#[test]
fn test_absent_nested_object_is_omitted() {
    let value = OuterWithSibling {
        inner: None,
        after: 7,
    };
    assert_eq!(to_bytes(&value).unwrap().to_vec(), vec![9, MANIFEST_BYTE, 7]);

    let value = OuterWithSibling {
        inner: Some(Inner { value: -1 }),
        after: 7,
    };
    assert_eq!(
        to_bytes(&value).unwrap().to_vec(),
        vec![1, 13, 3, 0, 5, 6, 1, 9, MANIFEST_BYTE, 7]
    );
}

#[test]
fn test_object_arrays() {
    let items = vec![Inner { value: 3 }, Inner { value: 1 }];
    assert_eq!(
        encode(items),
        vec![F1, 29, 10, 0, 3, 0, 5, 6, 6, 3, 0, 5, 6, 2]
    );
    assert_eq!(
        encode(vec![None, Some(Inner { value: 3 })]),
        vec![F1, 29, 7, 0, 255, 255, 3, 0, 5, 6, 6]
    );
}

#[derive(Record)]
struct NoTags {
    _skipped: i32,
}

#[derive(Record)]
struct Unit;

#[derive(Record)]
struct Partial {
    #[tagform(tag = 2)]
    kept: u8,
    _ignored: String,
}

#[test]
fn test_empty_values() {
    assert!(to_bytes(&()).unwrap().is_empty());
    assert!(to_bytes(&Unit).unwrap().is_empty());
    assert!(to_bytes(&NoTags { _skipped: 5 }).unwrap().is_empty());
    // an empty record as a field writes nothing, not even its header
    assert!(encode(Unit).is_empty());
    assert!(encode(Some(())).is_empty());
}

#[test]
fn test_untagged_fields_are_skipped() {
    let value = Partial {
        kept: 4,
        _ignored: "x".to_string(),
    };
    assert_eq!(to_bytes(&value).unwrap().to_vec(), vec![2, MANIFEST_BYTE, 4]);
}

#[derive(Record)]
struct Pair(#[tagform(tag = 1)] u8, #[tagform(tag = 2)] i32);

#[test]
fn test_tuple_struct() {
    assert_eq!(to_bytes(&Pair(1, -1)).unwrap().to_vec(), vec![1, 2, 1, 2, 6, 1]);
}

#[test]
fn test_large_payload_uses_exact_length() {
    let value = "x".repeat(1000);
    let bytes = encode(value.clone());
    assert_eq!(bytes.len(), 2 + 2 + 1000);
    assert_eq!(&bytes[..4], &[F1, MANIFEST_STRING, 0xE8, 0x03]);
    assert_eq!(&bytes[4..], value.as_bytes());
}

#[test]
fn test_frame_too_large() {
    let value = One {
        value: "x".repeat(40_000),
    };
    let mut calls = 0usize;
    let mut sink = |calls: &mut usize, _payload: &[u8]| *calls += 1;
    let err = serialize(&value, &mut calls, &mut sink).unwrap_err();
    assert!(matches!(err, EncoderError::FrameTooLarge(40_000)));
    assert_eq!(calls, 0);
}

#[test]
fn test_sink_receives_context_once() {
    struct Captured {
        calls: usize,
        payload: Vec<u8>,
    }

    let mut context = Captured {
        calls: 0,
        payload: Vec::new(),
    };
    let mut sink = |ctx: &mut Captured, payload: &[u8]| {
        ctx.calls += 1;
        ctx.payload.extend_from_slice(payload);
    };
    let written = serialize(&One { value: 256i32 }, &mut context, &mut sink).unwrap();

    assert_eq!(written, 4);
    assert_eq!(context.calls, 1);
    assert_eq!(context.payload, vec![F1, MANIFEST_INT32, 128, 4]);
}

#[test]
fn test_vec_and_bytes_mut_sinks_append() {
    let mut out = vec![0xEE];
    serialize(&One { value: true }, &mut (), &mut out).unwrap();
    serialize(&One { value: false }, &mut (), &mut out).unwrap();
    assert_eq!(out, vec![0xEE, F1, 1, 1, F1, 1, 0]);

    let mut out = bytes::BytesMut::new();
    serialize(&One { value: 1u8 }, &mut (), &mut out).unwrap();
    assert_eq!(&out[..], &[F1, MANIFEST_BYTE, 1]);
}

struct Celsius(i16);

impl Encode for Celsius {
    fn writer(_registry: &Registry) -> tagform::Result<Writer<Self>> {
        fn put(value: &Celsius, frame: &mut Frame<'_>) -> tagform::Result<()> {
            frame.put_i16_le(value.0)
        }
        Ok(Writer::scalar(MANIFEST_INT16, 2, put))
    }
}

#[test]
fn test_user_defined_scalar() {
    assert_eq!(encode(Celsius(-2)), vec![F1, MANIFEST_INT16, 254, 255]);
    assert_eq!(encode(Celsius(-2)), encode(-2i16));

    // wrappers treat it like any built-in scalar
    assert_eq!(encode(None::<Celsius>), Vec::<u8>::new());
    let present = encode(Some(Celsius(1)));
    assert_eq!(present, vec![F1, FLAG_NULLABLE | MANIFEST_INT16, 1, 0]);
    let items = encode(vec![Celsius(1), Celsius(2)]);
    assert_eq!(items, vec![F1, FLAG_ARRAY | MANIFEST_INT16, 4, 0, 1, 0, 2, 0]);
}
