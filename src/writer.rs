//! Writer composition tree.
//!
//! A [`Writer<T>`] describes how one concrete type is laid out on the wire. Writers are built
//! once per type by the [`Registry`], are immutable afterwards and are only read by the
//! generator in [`crate::routine`], which flattens a whole tree into one routine.

use crate::buffer::Frame;
use crate::core::*;
use crate::routine::{self, Step};
use crate::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound on the encoded size of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// The maximum size is known without looking at the value.
    Bounded(usize),
    /// The size depends on the value and needs an estimation pass.
    Variable,
}

impl Size {
    pub fn is_bounded(&self) -> bool {
        matches!(self, Size::Bounded(_))
    }

    pub fn bound(&self) -> Option<usize> {
        match self {
            Size::Bounded(n) => Some(*n),
            Size::Variable => None,
        }
    }

    fn plus(self, extra: usize) -> Size {
        match self {
            Size::Bounded(n) => Size::Bounded(n + extra),
            Size::Variable => Size::Variable,
        }
    }
}

/// The closed set of writer node shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Fixed or varint encoded primitive.
    Scalar,
    /// UTF-8 string payload.
    Text,
    /// Raw byte sequence, copied in one go.
    Bytes,
    /// Sequence of items sharing one item writer.
    Array,
    /// Record with at least one tagged field.
    Composite,
    /// Record without tagged fields; writes nothing at all.
    Empty,
    /// Optional scalar with a presence flag.
    Nullable,
    /// Length prefix around a text, bytes, array or composite node.
    Framed,
    /// Optional framed value, `-1` length when absent.
    Optional,
}

/// Immutable description of how values of type `T` are encoded.
pub struct Writer<T: 'static> {
    manifest: u8,
    size: Size,
    kind: NodeKind,
    requires_address: bool,
    writes_manifest: bool,
    frames_itself: bool,
    pub(crate) node: Node<T>,
}

pub(crate) enum Node<T: 'static> {
    Scalar(fn(&T, &mut Frame<'_>) -> Result<()>),
    Text(fn(&T) -> &str),
    Bytes(fn(&T) -> &[u8]),
    Array(Box<dyn Slot<T>>),
    Composite(Composite<T>),
    Empty,
    Nullable(Box<dyn Slot<T>>),
    Framed(Box<Writer<T>>),
    Optional(Box<dyn Slot<T>>),
    /// Another type's writer reached through a borrow, e.g. `Box<T>`.
    Indirect(Box<dyn Slot<T>>),
}

/// A child writer of some other type, reachable from `T`.
///
/// Slots erase the child's type so that a tree over heterogeneous field types can still be
/// specialized into closures over `T` alone.
pub(crate) trait Slot<T: 'static>: Send + Sync {
    fn specialize(&self) -> Step<T>;
}

fn by_address<T>() -> bool {
    std::mem::size_of::<T>() > std::mem::size_of::<usize>()
}

impl<T: 'static> Writer<T> {
    /// The manifest byte written in front of top-level fields of this type.
    pub fn manifest(&self) -> u8 {
        self.manifest
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn is_bounded(&self) -> bool {
        self.size.is_bounded()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// True when the value is larger than a pointer and is read through a reference.
    pub fn requires_address(&self) -> bool {
        self.requires_address
    }

    /// True when the node decides itself whether the field header is written.
    ///
    /// Nullable, optional and empty nodes defer the header until the value is known to be
    /// present; every other node gets its header written by the enclosing composite.
    pub fn writes_manifest(&self) -> bool {
        self.writes_manifest
    }

    /// True when the node writes its own length prefix.
    pub fn frames_itself(&self) -> bool {
        self.frames_itself
    }

    /// Fields of a composite writer in declaration order; empty for every other kind.
    pub fn fields(&self) -> &[Field<T>] {
        match &self.node {
            Node::Composite(composite) => &composite.fields,
            Node::Framed(inner) => inner.fields(),
            _ => &[],
        }
    }

    /// The writer without its length frame. Root values are written unframed.
    pub fn unframed(&self) -> &Writer<T> {
        match &self.node {
            Node::Framed(inner) => inner,
            _ => self,
        }
    }

    /// A fixed-width or varint scalar. `width` is the most bytes `put` ever writes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tagform::core::MANIFEST_INT16;
    /// use tagform::{Encode, Frame, Registry, Result, Writer};
    ///
    /// struct Celsius(i16);
    ///
    /// impl Encode for Celsius {
    ///     fn writer(_registry: &Registry) -> Result<Writer<Self>> {
    ///         fn put(value: &Celsius, frame: &mut Frame<'_>) -> Result<()> {
    ///             frame.put_i16_le(value.0)
    ///         }
    ///         Ok(Writer::scalar(MANIFEST_INT16, 2, put))
    ///     }
    /// }
    /// ```
    pub fn scalar(
        manifest: u8,
        width: usize,
        put: fn(&T, &mut Frame<'_>) -> Result<()>,
    ) -> Self {
        Self {
            manifest,
            size: Size::Bounded(width),
            kind: NodeKind::Scalar,
            requires_address: by_address::<T>(),
            writes_manifest: false,
            frames_itself: false,
            node: Node::Scalar(put),
        }
    }

    /// A length-framed UTF-8 string.
    pub fn text(get: fn(&T) -> &str) -> Self {
        Self::framed(Self {
            manifest: MANIFEST_STRING,
            size: Size::Variable,
            kind: NodeKind::Text,
            requires_address: by_address::<T>(),
            writes_manifest: false,
            frames_itself: false,
            node: Node::Text(get),
        })
    }

    /// A length-framed byte array, encoded exactly like an array of `u8`.
    pub fn bytes(get: fn(&T) -> &[u8]) -> Self {
        Self::framed(Self {
            manifest: FLAG_ARRAY | MANIFEST_BYTE,
            size: Size::Variable,
            kind: NodeKind::Bytes,
            requires_address: by_address::<T>(),
            writes_manifest: false,
            frames_itself: false,
            node: Node::Bytes(get),
        })
    }

    /// The writer of a record with no tagged fields. It writes nothing, not even a header.
    pub fn empty() -> Self {
        Self {
            manifest: MANIFEST_OBJECT,
            size: Size::Bounded(0),
            kind: NodeKind::Empty,
            requires_address: by_address::<T>(),
            writes_manifest: true,
            frames_itself: true,
            node: Node::Empty,
        }
    }

    fn framed(inner: Self) -> Self {
        Self {
            manifest: inner.manifest,
            size: inner.size.plus(LENGTH_PREFIX),
            kind: NodeKind::Framed,
            requires_address: inner.requires_address,
            writes_manifest: false,
            frames_itself: true,
            node: Node::Framed(Box::new(inner)),
        }
    }

    /// Reuses the writer of `P` for a `T` that borrows a `P`.
    pub fn indirect<P: Encode>(inner: Arc<Writer<P>>, get: fn(&T) -> &P) -> Self {
        Self {
            manifest: inner.manifest,
            size: inner.size,
            kind: inner.kind,
            requires_address: by_address::<T>(),
            writes_manifest: inner.writes_manifest,
            frames_itself: inner.frames_itself,
            node: Node::Indirect(Box::new(Projection { get, writer: inner })),
        }
    }
}

impl<T: Record> Writer<T> {
    /// Builds the composite writer of a record from its field list.
    ///
    /// Records without fields collapse into [`Writer::empty`]; all others are length framed
    /// when nested and written unframed at the root.
    pub fn record(registry: &Registry) -> Result<Self> {
        let mut builder = FieldsBuilder {
            registry,
            fields: Vec::new(),
        };
        T::describe(&mut builder)?;
        if builder.fields.is_empty() {
            return Ok(Self::empty());
        }
        let composite = Composite::new(builder.fields);
        Ok(Self::framed(Self {
            manifest: MANIFEST_OBJECT,
            size: composite.size,
            kind: NodeKind::Composite,
            requires_address: by_address::<T>(),
            writes_manifest: false,
            frames_itself: false,
            node: Node::Composite(composite),
        }))
    }
}

impl<C: Sequence> Writer<C> {
    /// Builds a length-framed array over the item writer of `C`.
    ///
    /// # Errors
    /// `BuildError::NestedArray` when the item is itself an array (or an optional array).
    pub fn sequence(registry: &Registry) -> Result<Self> {
        let item = registry.writer::<C::Item>()?;
        if is_array(item.manifest()) {
            return Err(BuildError::NestedArray {
                type_name: type_name::<C>(),
            }
            .into());
        }
        Ok(Self::framed(Self {
            manifest: FLAG_ARRAY | item.manifest(),
            size: Size::Variable,
            kind: NodeKind::Array,
            requires_address: by_address::<C>(),
            writes_manifest: false,
            frames_itself: false,
            node: Node::Array(Box::new(Items::<C> {
                item,
                _sequence: PhantomData,
            })),
        }))
    }
}

impl<X: Encode> Writer<Option<X>> {
    fn nullable(inner: Arc<Writer<X>>) -> Self {
        Self {
            manifest: inner.manifest | FLAG_NULLABLE,
            size: inner.size.plus(1),
            kind: NodeKind::Nullable,
            requires_address: by_address::<Option<X>>(),
            writes_manifest: true,
            frames_itself: false,
            node: Node::Nullable(Box::new(NullableSlot { inner })),
        }
    }

    fn optional(inner: Arc<Writer<X>>) -> Self {
        Self {
            manifest: inner.manifest,
            size: inner.size,
            kind: NodeKind::Optional,
            requires_address: by_address::<Option<X>>(),
            writes_manifest: true,
            frames_itself: true,
            node: Node::Optional(Box::new(OptionalSlot { inner })),
        }
    }
}

impl<T: 'static> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("type", &type_name::<T>())
            .field("manifest", &self.manifest)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("fields", &self.fields())
            .finish()
    }
}

// --- Composite ---
/// One tagged field of a record.
pub struct Field<T: 'static> {
    tag: u8,
    name: &'static str,
    manifest: u8,
    size: Size,
    writes_manifest: bool,
    pub(crate) slot: Box<dyn Slot<T>>,
}

impl<T: 'static> Field<T> {
    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn manifest(&self) -> u8 {
        self.manifest
    }

    /// Size of the payload, without the 2 header bytes.
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn writes_manifest(&self) -> bool {
        self.writes_manifest
    }
}

impl<T: 'static> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("manifest", &self.manifest)
            .field("size", &self.size)
            .finish()
    }
}

pub(crate) struct Composite<T: 'static> {
    pub(crate) fields: Vec<Field<T>>,
    /// `Bounded` when every field is bounded; the sum includes the field headers.
    pub(crate) size: Size,
}

impl<T: 'static> Composite<T> {
    fn new(fields: Vec<Field<T>>) -> Self {
        let size = fields.iter().try_fold(0usize, |total, field| {
            field.size.bound().map(|n| total + FIELD_HEADER + n)
        });
        Self {
            fields,
            size: size.map_or(Size::Variable, Size::Bounded),
        }
    }
}

/// Collects the ordered field list of a record.
///
/// `#[derive(Record)]` generates the calls; hand-written [`Record`] impls call [`field`]
/// once per serialized field in wire order.
///
/// [`field`]: FieldsBuilder::field
pub struct FieldsBuilder<'r, T: 'static> {
    registry: &'r Registry,
    fields: Vec<Field<T>>,
}

impl<T: Record> FieldsBuilder<'_, T> {
    /// Appends a field with the given tag, resolving the writer of its type.
    ///
    /// # Errors
    /// `BuildError::DuplicateTag` if `tag` is already used by this record, or any build error
    /// of the field type.
    pub fn field<F: Encode>(
        &mut self,
        tag: u8,
        name: &'static str,
        get: fn(&T) -> &F,
    ) -> Result<&mut Self> {
        if self.fields.iter().any(|field| field.tag == tag) {
            return Err(BuildError::DuplicateTag {
                tag,
                type_name: type_name::<T>(),
            }
            .into());
        }
        let writer = self.registry.writer::<F>()?;
        self.fields.push(Field {
            tag,
            name,
            manifest: writer.manifest(),
            size: writer.size(),
            writes_manifest: writer.writes_manifest(),
            slot: Box::new(Projection { get, writer }),
        });
        Ok(self)
    }
}

// --- Slots ---
/// Reads a `F` out of a `S` and hands it to the writer of `F`.
struct Projection<S, F: 'static> {
    get: fn(&S) -> &F,
    writer: Arc<Writer<F>>,
}

impl<S: 'static, F: 'static> Slot<S> for Projection<S, F> {
    fn specialize(&self) -> Step<S> {
        routine::specialize(&self.writer).project(self.get)
    }
}

struct NullableSlot<X: 'static> {
    inner: Arc<Writer<X>>,
}

impl<X: Encode> Slot<Option<X>> for NullableSlot<X> {
    fn specialize(&self) -> Step<Option<X>> {
        routine::nullable(routine::specialize(&self.inner))
    }
}

struct OptionalSlot<X: 'static> {
    inner: Arc<Writer<X>>,
}

impl<X: Encode> Slot<Option<X>> for OptionalSlot<X> {
    fn specialize(&self) -> Step<Option<X>> {
        routine::optional(routine::specialize(&self.inner))
    }
}

struct Items<C: Sequence> {
    item: Arc<Writer<C::Item>>,
    _sequence: PhantomData<fn(&C)>,
}

impl<C: Sequence> Slot<C> for Items<C> {
    fn specialize(&self) -> Step<C> {
        routine::sequence::<C>(routine::specialize(&self.item))
    }
}

// --- Traits ---
/// Types that have a writer.
///
/// Implemented here for primitives, strings, sequences, `Option`, `Box`, `Arc` and the types
/// of enabled features, and by `#[derive(Record)]` for structs.
pub trait Encode: Sized + Send + Sync + 'static {
    /// Builds the writer for `Self`. Child writers must be resolved through `registry` so that
    /// they are shared and cycle-checked.
    fn writer(registry: &Registry) -> Result<Writer<Self>>;
}

/// Composite types: an ordered list of tagged fields.
pub trait Record: Encode {
    fn describe(fields: &mut FieldsBuilder<'_, Self>) -> Result<()>;
}

/// Containers encoded as arrays.
pub trait Sequence: Send + Sync + 'static {
    type Item: Encode;
    type Iter<'a>: Iterator<Item = &'a Self::Item>
    where
        Self: 'a;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter(&self) -> Self::Iter<'_>;
}

// --- Scalars ---
macro_rules! impl_scalar {
    ($ty:ty, $manifest:expr, $width:expr, $put:ident) => {
        impl Encode for $ty {
            fn writer(_registry: &Registry) -> Result<Writer<Self>> {
                Ok(Writer::scalar($manifest, $width, $put))
            }
        }
    };
}

fn put_bool(value: &bool, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_u8(u8::from(*value))
}

fn put_u8(value: &u8, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_u8(*value)
}

fn put_i8(value: &i8, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_u8(*value as u8)
}

fn put_i16(value: &i16, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_i16_le(*value)
}

fn put_u16(value: &u16, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_u16_le(*value)
}

fn put_i32(value: &i32, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_varint32(zigzag32(*value))
}

fn put_u32(value: &u32, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_varint32(*value)
}

fn put_i64(value: &i64, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_varint64(zigzag64(*value))
}

fn put_u64(value: &u64, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_varint64(*value)
}

fn put_uuid(value: &Uuid, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_slice(value.as_bytes())
}

fn put_datetime(value: &DateTime<Utc>, frame: &mut Frame<'_>) -> Result<()> {
    frame.put_i64_le(datetime_to_ticks(value))
}

impl_scalar!(bool, MANIFEST_BOOL, 1, put_bool);
impl_scalar!(u8, MANIFEST_BYTE, 1, put_u8);
impl_scalar!(i8, MANIFEST_SBYTE, 1, put_i8);
impl_scalar!(i16, MANIFEST_INT16, 2, put_i16);
impl_scalar!(u16, MANIFEST_UINT16, 2, put_u16);
impl_scalar!(i32, MANIFEST_INT32, MAX_VARINT32, put_i32);
impl_scalar!(u32, MANIFEST_UINT32, MAX_VARINT32, put_u32);
impl_scalar!(i64, MANIFEST_INT64, MAX_VARINT64, put_i64);
impl_scalar!(u64, MANIFEST_UINT64, MAX_VARINT64, put_u64);
impl_scalar!(Uuid, MANIFEST_GUID, 16, put_uuid);
impl_scalar!(DateTime<Utc>, MANIFEST_DATETIME, 8, put_datetime);

// --- String ---
/// Encodes a `String` as its UTF-8 bytes behind a length prefix.
impl Encode for String {
    fn writer(_registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::text(String::as_str))
    }
}

fn static_str<'a>(value: &'a &'static str) -> &'a str {
    value
}

impl Encode for &'static str {
    fn writer(_registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::text(static_str))
    }
}

// --- Option ---
/// `Option` of a scalar becomes a nullable node; `Option` of a framed value uses the `-1`
/// length for `None`. Options of options are rejected.
impl<T: Encode> Encode for Option<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        let inner = registry.writer::<T>()?;
        match inner.kind() {
            NodeKind::Scalar => Ok(Writer::nullable(inner)),
            NodeKind::Framed => Ok(Writer::optional(inner)),
            NodeKind::Empty => Ok(Writer::empty()),
            _ => Err(BuildError::NestedOptional {
                type_name: type_name::<Self>(),
            }
            .into()),
        }
    }
}

// --- Vec<T> ---
/// The bytes of a `Vec<u8>`; empty for any other type.
fn byte_slice<V: Any>(value: &V) -> &[u8] {
    (value as &dyn Any)
        .downcast_ref::<Vec<u8>>()
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Encodes a `Vec<T>` as an array. `Vec<u8>` is copied as one byte slice.
impl<T: Encode> Encode for Vec<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        if TypeId::of::<T>() == TypeId::of::<u8>() {
            return Ok(Writer::bytes(byte_slice::<Self>));
        }
        Writer::sequence(registry)
    }
}

impl<T: Encode> Sequence for Vec<T> {
    type Item = T;
    type Iter<'a> = std::slice::Iter<'a, T>;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        self.as_slice().iter()
    }
}

// --- Array ---
impl<T: Encode, const N: usize> Encode for [T; N] {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::sequence(registry)
    }
}

impl<T: Encode, const N: usize> Sequence for [T; N] {
    type Item = T;
    type Iter<'a> = std::slice::Iter<'a, T>;

    fn len(&self) -> usize {
        N
    }

    fn iter(&self) -> Self::Iter<'_> {
        self.as_slice().iter()
    }
}

// --- VecDeque ---
impl<T: Encode> Encode for VecDeque<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::sequence(registry)
    }
}

impl<T: Encode> Sequence for VecDeque<T> {
    type Item = T;
    type Iter<'a> = std::collections::vec_deque::Iter<'a, T>;

    fn len(&self) -> usize {
        VecDeque::len(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        VecDeque::iter(self)
    }
}

// --- Sets ---
/// Sets are written in their iteration order.
impl<T: Encode> Encode for BTreeSet<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::sequence(registry)
    }
}

impl<T: Encode> Sequence for BTreeSet<T> {
    type Item = T;
    type Iter<'a> = std::collections::btree_set::Iter<'a, T>;

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        BTreeSet::iter(self)
    }
}

impl<T: Encode, S: Send + Sync + 'static> Encode for HashSet<T, S> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::sequence(registry)
    }
}

impl<T: Encode, S: Send + Sync + 'static> Sequence for HashSet<T, S> {
    type Item = T;
    type Iter<'a> = std::collections::hash_set::Iter<'a, T>;

    fn len(&self) -> usize {
        HashSet::len(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        HashSet::iter(self)
    }
}

// --- Bytes ---
fn bytes_slice(value: &Bytes) -> &[u8] {
    value
}

impl Encode for Bytes {
    fn writer(_registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::bytes(bytes_slice))
    }
}

// --- Box<T> / Arc<T> ---
/// Encodes a `Box<T>` exactly like `T`.
impl<T: Encode> Encode for Box<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::indirect(registry.writer::<T>()?, Box::as_ref))
    }
}

/// Encodes an `Arc<T>` exactly like `T`.
impl<T: Encode> Encode for Arc<T> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::indirect(registry.writer::<T>()?, Arc::as_ref))
    }
}

// --- () ---
/// The no-fields marker: serializes to zero bytes.
impl Encode for () {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::record(registry)
    }
}

impl Record for () {
    fn describe(_fields: &mut FieldsBuilder<'_, Self>) -> Result<()> {
        Ok(())
    }
}
