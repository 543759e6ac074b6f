//! # tagform
//!
//! A compact, self-describing binary serializer.
//!
//! - Records declare tagged fields with `#[derive(Record)]` and `#[tagform(tag = N)]`
//! - Each field is written as `[tag][manifest][payload]`; the manifest byte names the base type
//!   plus `Array`/`Nullable` flags, so payloads can be walked without the writer's types
//! - Strings, arrays and nested records carry a 2-byte length prefix and can be skipped whole
//! - Per type, the writer tree is specialized once into a flattened routine and cached in a
//!   [`Registry`] keyed by `(context type, value type)`
//! - [`visit`] decodes any payload into [`Visitor`] callbacks
//!
//! ## Absent values
//!
//! A top-level `None` is not written at all. Inside arrays an absent scalar is a `0` presence
//! byte and an absent string, array or record is a `-1` length.
//!
//! ## Feature Flags
//!
//! - `indexmap`: `IndexSet` is encoded as an array.
//! - `smol_str`: `SmolStr` is encoded as a string.
//! - `ulid`: `Ulid` is encoded as a GUID (16 bytes, same manifest as `Uuid`).
//!
//! ## Example
//! ```rust
//! use tagform::{to_bytes, visit, Record, Visitor};
//!
//! #[derive(Record)]
//! struct Point {
//!     #[tagform(tag = 1)]
//!     x: i32,
//!     #[tagform(tag = 2)]
//!     label: Option<String>,
//! }
//!
//! let bytes = to_bytes(&Point { x: 2, label: None }).unwrap();
//! assert_eq!(&bytes[..], &[1, 6, 4]);
//!
//! struct Sum(i64);
//! impl Visitor for Sum {
//!     fn on_i32(&mut self, value: i32) {
//!         self.0 += i64::from(value);
//!     }
//! }
//! let mut sum = Sum(0);
//! visit(&bytes, &mut sum).unwrap();
//! assert_eq!(sum.0, 2);
//! ```

mod buffer;
pub mod core;
mod features;
mod routine;
mod visit;
mod writer;

pub use buffer::Frame;
use bytes::{Bytes, BytesMut};
pub use routine::{Registry, Routine};
pub use tagform_derive::Record;
pub use visit::{skip_field, visit, FieldHeader, Visitor};
pub use writer::{Encode, Field, FieldsBuilder, NodeKind, Record, Sequence, Size, Writer};

/// Errors that can occur while building writers, serializing or visiting.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// A type cannot be serialized. Reported once, when its writer is first built.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// A length-framed payload is longer than a 2-byte length can describe.
    #[error("Framed payload of {0} bytes exceeds the 2-byte length prefix")]
    FrameTooLarge(usize),
    /// The writer produced more bytes than its size estimate.
    #[error("Size estimate of {estimated} bytes exceeded, {needed} needed")]
    EstimateExceeded { estimated: usize, needed: usize },
    /// The buffer did not contain enough data to complete the operation.
    #[error("Insufficient data in buffer")]
    InsufficientData,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, EncoderError>;

/// Writer construction failures
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Arrays of arrays are not supported: {type_name}")]
    NestedArray { type_name: &'static str },
    #[error("Optional values cannot be nested: {type_name}")]
    NestedOptional { type_name: &'static str },
    #[error("Duplicate field tag {tag} in {type_name}")]
    DuplicateTag { tag: u8, type_name: &'static str },
    #[error("Recursive type cannot be serialized: {type_name}")]
    Recursive { type_name: &'static str },
    #[error("Registry entry does not hold a {type_name}")]
    Mismatch { type_name: &'static str },
}

/// Payload decoding failures
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Varint does not terminate within {max_bytes} bytes")]
    VarintOverflow { max_bytes: usize },
    #[error("Unknown manifest: {0}")]
    UnknownManifest(u8),
    #[error("Invalid length prefix: {0}")]
    InvalidLength(i16),
    #[error("Invalid presence flag: {0}")]
    InvalidPresence(u8),
    #[error("Invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Ticks out of range: {0}")]
    InvalidDateTime(i64),
}

/// Destination of serialized payloads.
///
/// `write` is called exactly once per successful serialize call. `payload` borrows the scratch
/// buffer of that call and must be copied if it is needed afterwards.
pub trait Sink<C: ?Sized> {
    fn write(&mut self, context: &mut C, payload: &[u8]);
}

impl<C: ?Sized, F> Sink<C> for F
where
    F: FnMut(&mut C, &[u8]),
{
    fn write(&mut self, context: &mut C, payload: &[u8]) {
        self(context, payload)
    }
}

/// Appends every payload.
impl<C: ?Sized> Sink<C> for Vec<u8> {
    fn write(&mut self, _context: &mut C, payload: &[u8]) {
        self.extend_from_slice(payload);
    }
}

/// Appends every payload.
impl<C: ?Sized> Sink<C> for BytesMut {
    fn write(&mut self, _context: &mut C, payload: &[u8]) {
        self.extend_from_slice(payload);
    }
}

/// Serializes `value` with the global registry and hands the bytes to `sink`.
///
/// Returns the number of bytes written.
///
/// # Example
/// ```rust
/// use tagform::{serialize, Record};
///
/// #[derive(Record)]
/// struct Flag {
///     #[tagform(tag = 7)]
///     on: bool,
/// }
///
/// let mut frames = Vec::new();
/// let mut sink = |frames: &mut Vec<Vec<u8>>, payload: &[u8]| frames.push(payload.to_vec());
/// serialize(&Flag { on: true }, &mut frames, &mut sink).unwrap();
/// assert_eq!(frames, vec![vec![7, 1, 1]]);
/// ```
pub fn serialize<C, T, S>(value: &T, context: &mut C, sink: &mut S) -> Result<usize>
where
    C: ?Sized + 'static,
    T: Record,
    S: Sink<C> + ?Sized,
{
    Registry::global().serialize(value, context, sink)
}

/// Serializes `value` into a new buffer.
pub fn to_bytes<T: Record>(value: &T) -> Result<Bytes> {
    let mut out = BytesMut::new();
    serialize(value, &mut (), &mut out)?;
    Ok(out.freeze())
}
