//! Schema-free decoder.
//!
//! [`visit`] walks any payload produced by a routine and reports what it finds to a
//! [`Visitor`]. It needs no knowledge of the types that wrote the payload; the manifest byte of
//! each field says how many bytes follow or how to find their end.

use crate::core::*;
use crate::*;
use bytes::Buf;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Callbacks invoked while walking a payload. Every method defaults to doing nothing.
///
/// Each top-level field, including the fields of nested records, is bracketed by
/// `push_field`/`pop_field`. Array items are reported inside the scope of their array field.
#[allow(unused_variables)]
pub trait Visitor {
    fn push_field(&mut self, tag: u8) {}
    fn pop_field(&mut self) {}

    fn on_bool(&mut self, value: bool) {}
    fn on_u8(&mut self, value: u8) {}
    fn on_i8(&mut self, value: i8) {}
    fn on_i16(&mut self, value: i16) {}
    fn on_u16(&mut self, value: u16) {}
    fn on_i32(&mut self, value: i32) {}
    fn on_u32(&mut self, value: u32) {}
    fn on_i64(&mut self, value: i64) {}
    fn on_u64(&mut self, value: u64) {}
    /// Borrowed straight from the payload.
    fn on_str(&mut self, value: &str) {}
    fn on_guid(&mut self, value: Uuid) {}
    fn on_datetime(&mut self, value: DateTime<Utc>) {}
    /// An absent value that was written explicitly: a `-1` length or a `0` presence flag.
    fn on_null(&mut self) {}
}

/// Tag and manifest of a top-level field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub tag: u8,
    pub manifest: u8,
}

/// Walks `payload` field by field, invoking `visitor`.
///
/// # Errors
/// Fails on the first truncated or malformed field. Callbacks already made for earlier fields
/// are not undone.
pub fn visit<V: Visitor + ?Sized>(payload: &[u8], visitor: &mut V) -> Result<()> {
    let mut reader = payload;
    read_object(&mut reader, visitor)
}

/// Advances `reader` past one top-level field without decoding its payload.
pub fn skip_field(reader: &mut &[u8]) -> Result<FieldHeader> {
    let header = read_header(reader)?;
    if is_array(header.manifest) {
        skip_framed(reader)?;
        return Ok(header);
    }
    match base_type(header.manifest) {
        MANIFEST_OBJECT | MANIFEST_STRING => skip_framed(reader)?,
        MANIFEST_INT32 | MANIFEST_UINT32 => {
            let (_, len) = decode_varint32(reader)?;
            reader.advance(len);
        }
        MANIFEST_INT64 | MANIFEST_UINT64 => {
            let (_, len) = decode_varint64(reader)?;
            reader.advance(len);
        }
        base => {
            let width = fixed_width(base).ok_or(DecodeError::UnknownManifest(header.manifest))?;
            take(reader, width)?;
        }
    }
    Ok(header)
}

fn read_header(reader: &mut &[u8]) -> Result<FieldHeader> {
    ensure(reader, FIELD_HEADER)?;
    Ok(FieldHeader {
        tag: reader.get_u8(),
        manifest: reader.get_u8(),
    })
}

fn read_object<V: Visitor + ?Sized>(reader: &mut &[u8], v: &mut V) -> Result<()> {
    while reader.has_remaining() {
        let FieldHeader { tag, manifest } = read_header(reader)?;
        v.push_field(tag);
        if is_array(manifest) {
            match read_length(reader)? {
                Some(len) => {
                    let mut items = take(reader, len)?;
                    read_array(&mut items, v, manifest & !FLAG_ARRAY)?;
                }
                None => v.on_null(),
            }
        } else {
            // a nullable field that made it onto the wire is present
            read_value(reader, v, base_type(manifest))?;
        }
        v.pop_field();
    }
    Ok(())
}

fn read_array<V: Visitor + ?Sized>(items: &mut &[u8], v: &mut V, manifest: u8) -> Result<()> {
    let base = base_type(manifest);
    if !is_primitive(base) && base != MANIFEST_OBJECT {
        return Err(DecodeError::UnknownManifest(manifest).into());
    }
    let nullable = is_nullable(manifest);
    while items.has_remaining() {
        if nullable {
            match items.get_u8() {
                0 => {
                    v.on_null();
                    continue;
                }
                1 => {}
                other => return Err(DecodeError::InvalidPresence(other).into()),
            }
        }
        read_value(items, v, base)?;
    }
    Ok(())
}

fn read_value<V: Visitor + ?Sized>(reader: &mut &[u8], v: &mut V, base: u8) -> Result<()> {
    match base {
        MANIFEST_OBJECT => match read_length(reader)? {
            Some(len) => {
                let mut inner = take(reader, len)?;
                read_object(&mut inner, v)
            }
            None => {
                v.on_null();
                Ok(())
            }
        },
        MANIFEST_STRING => {
            match read_length(reader)? {
                Some(len) => {
                    let bytes = take(reader, len)?;
                    v.on_str(std::str::from_utf8(bytes).map_err(DecodeError::from)?);
                }
                None => v.on_null(),
            }
            Ok(())
        }
        _ => read_primitive(reader, v, base),
    }
}

fn read_primitive<V: Visitor + ?Sized>(reader: &mut &[u8], v: &mut V, base: u8) -> Result<()> {
    if let Some(width) = fixed_width(base) {
        ensure(reader, width)?;
    }
    match base {
        MANIFEST_BOOL => v.on_bool(reader.get_u8() != 0),
        MANIFEST_BYTE => v.on_u8(reader.get_u8()),
        MANIFEST_SBYTE => v.on_i8(reader.get_i8()),
        MANIFEST_INT16 => v.on_i16(reader.get_i16_le()),
        MANIFEST_UINT16 => v.on_u16(reader.get_u16_le()),
        MANIFEST_INT32 => {
            let (raw, len) = decode_varint32(reader)?;
            reader.advance(len);
            v.on_i32(unzigzag32(raw));
        }
        MANIFEST_UINT32 => {
            let (raw, len) = decode_varint32(reader)?;
            reader.advance(len);
            v.on_u32(raw);
        }
        MANIFEST_INT64 => {
            let (raw, len) = decode_varint64(reader)?;
            reader.advance(len);
            v.on_i64(unzigzag64(raw));
        }
        MANIFEST_UINT64 => {
            let (raw, len) = decode_varint64(reader)?;
            reader.advance(len);
            v.on_u64(raw);
        }
        MANIFEST_GUID => {
            let mut bytes = [0u8; 16];
            reader.copy_to_slice(&mut bytes);
            v.on_guid(Uuid::from_bytes(bytes));
        }
        MANIFEST_DATETIME => v.on_datetime(ticks_to_datetime(reader.get_i64_le())?),
        other => return Err(DecodeError::UnknownManifest(other).into()),
    }
    Ok(())
}

/// Reads a length prefix; `None` for the `-1` absent marker.
fn read_length(reader: &mut &[u8]) -> Result<Option<usize>> {
    ensure(reader, LENGTH_PREFIX)?;
    match reader.get_i16_le() {
        NULL_LENGTH => Ok(None),
        len if len < 0 => Err(DecodeError::InvalidLength(len).into()),
        len => Ok(Some(len as usize)),
    }
}

fn skip_framed(reader: &mut &[u8]) -> Result<()> {
    if let Some(len) = read_length(reader)? {
        take(reader, len)?;
    }
    Ok(())
}

fn take<'a>(reader: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    ensure(reader, len)?;
    let (head, tail) = std::mem::take(reader).split_at(len);
    *reader = tail;
    Ok(head)
}

#[inline]
fn ensure(reader: &[u8], len: usize) -> Result<()> {
    if reader.len() < len {
        return Err(EncoderError::InsufficientData);
    }
    Ok(())
}
