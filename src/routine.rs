//! Specializing generator and the process-wide routine cache.
//!
//! [`specialize`] walks a writer tree once and turns it into two closure graphs over the root
//! type: one that estimates the encoded size and one that emits the bytes. Nested records,
//! arrays and optionals are compiled into the same graph, so serializing a value never looks up
//! another routine.

use crate::buffer::{with_scratch, Frame, Header};
use crate::core::*;
use crate::writer::{Field, Node};
use crate::*;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

pub(crate) type EmitFn<T> =
    Box<dyn Fn(&T, &mut Frame<'_>, Option<Header>) -> Result<()> + Send + Sync>;
type EstimateFn<T> = Box<dyn Fn(&T) -> usize + Send + Sync>;

/// Size estimate of a compiled step.
pub(crate) enum Estimate<T> {
    /// Known upper bound; no estimation pass needed.
    Constant(usize),
    Dynamic(EstimateFn<T>),
}

impl<T: 'static> Estimate<T> {
    fn of(&self, value: &T) -> usize {
        match self {
            Estimate::Constant(n) => *n,
            Estimate::Dynamic(f) => f(value),
        }
    }

    fn plus(self, extra: usize) -> Self {
        match self {
            Estimate::Constant(n) => Estimate::Constant(n + extra),
            Estimate::Dynamic(f) => Estimate::Dynamic(Box::new(move |value: &T| f(value) + extra)),
        }
    }

    fn project<S: 'static>(self, get: fn(&S) -> &T) -> Estimate<S> {
        match self {
            Estimate::Constant(n) => Estimate::Constant(n),
            Estimate::Dynamic(f) => Estimate::Dynamic(Box::new(move |value: &S| f(get(value)))),
        }
    }

    /// Estimate for `Option<T>`: `extra` bytes on top of the value, `absent` bytes for `None`.
    fn optional(self, extra: usize, absent: usize) -> Estimate<Option<T>> {
        match self {
            Estimate::Constant(n) => Estimate::Constant((n + extra).max(absent)),
            Estimate::Dynamic(f) => Estimate::Dynamic(Box::new(move |value: &Option<T>| {
                value.as_ref().map_or(absent, |inner| f(inner) + extra)
            })),
        }
    }
}

/// A compiled node: its size estimate and its emitter.
///
/// The emitter gets `Some(header)` when it sits at the top level of a record and owns the
/// decision to write the field header, `None` inside arrays, frames and at the root.
pub(crate) struct Step<T> {
    pub(crate) estimate: Estimate<T>,
    pub(crate) emit: EmitFn<T>,
}

impl<T: 'static> Step<T> {
    pub(crate) fn project<S: 'static>(self, get: fn(&S) -> &T) -> Step<S> {
        let emit = self.emit;
        Step {
            estimate: self.estimate.project(get),
            emit: emitter(move |value: &S, frame, header| emit(get(value), frame, header)),
        }
    }
}

fn emitter<T, F>(f: F) -> EmitFn<T>
where
    F: Fn(&T, &mut Frame<'_>, Option<Header>) -> Result<()> + Send + Sync + 'static,
{
    Box::new(f)
}

fn estimator<T, F>(f: F) -> Estimate<T>
where
    F: Fn(&T) -> usize + Send + Sync + 'static,
{
    Estimate::Dynamic(Box::new(f))
}

/// Compiles `writer` into one estimator and one emitter.
pub(crate) fn specialize<T: 'static>(writer: &Writer<T>) -> Step<T> {
    match &writer.node {
        Node::Scalar(put) => {
            let put = *put;
            Step {
                estimate: Estimate::Constant(writer.size().bound().unwrap_or_default()),
                emit: emitter(move |value: &T, frame, _| put(value, frame)),
            }
        }
        Node::Text(get) => {
            let get = *get;
            Step {
                estimate: estimator(move |value: &T| get(value).len()),
                emit: emitter(move |value: &T, frame, _| frame.put_slice(get(value).as_bytes())),
            }
        }
        Node::Bytes(get) => {
            let get = *get;
            Step {
                estimate: estimator(move |value: &T| get(value).len()),
                emit: emitter(move |value: &T, frame, _| frame.put_slice(get(value))),
            }
        }
        Node::Composite(composite) => record(&composite.fields, composite.size),
        Node::Empty => Step {
            estimate: Estimate::Constant(0),
            emit: emitter(|_: &T, _, _| Ok(())),
        },
        Node::Framed(inner) => framed(specialize(inner)),
        Node::Array(slot) | Node::Nullable(slot) => slot.specialize(),
        Node::Optional(slot) | Node::Indirect(slot) => slot.specialize(),
    }
}

fn framed<T: 'static>(inner: Step<T>) -> Step<T> {
    let emit = inner.emit;
    Step {
        estimate: inner.estimate.plus(LENGTH_PREFIX),
        emit: emitter(move |value: &T, frame, _| {
            let start = frame.begin_frame()?;
            emit(value, frame, None)?;
            frame.end_frame(start)
        }),
    }
}

fn record<T: 'static>(fields: &[Field<T>], size: Size) -> Step<T> {
    let mut bounded = 0;
    let mut dynamic: Vec<EstimateFn<T>> = Vec::new();
    let mut emits = Vec::with_capacity(fields.len());
    for field in fields {
        let step = field.slot.specialize();
        bounded += FIELD_HEADER;
        match step.estimate {
            Estimate::Constant(n) => bounded += n,
            Estimate::Dynamic(f) => dynamic.push(f),
        }
        let emit = if field.writes_manifest() {
            step.emit
        } else {
            with_header(step.emit)
        };
        let header = Header {
            tag: field.tag(),
            manifest: field.manifest(),
        };
        emits.push((header, emit));
    }
    debug_assert!(dynamic.is_empty() == size.is_bounded());
    debug_assert!(size.bound().is_none_or(|n| n == bounded));

    let estimate = if dynamic.is_empty() {
        Estimate::Constant(bounded)
    } else {
        estimator(move |value: &T| bounded + dynamic.iter().map(|f| f(value)).sum::<usize>())
    };
    Step {
        estimate,
        emit: emitter(move |value: &T, frame, _| {
            for (header, emit) in &emits {
                emit(value, frame, Some(*header))?;
            }
            Ok(())
        }),
    }
}

fn with_header<T: 'static>(emit: EmitFn<T>) -> EmitFn<T> {
    emitter(move |value: &T, frame, header| {
        if let Some(header) = header {
            frame.put_header(header)?;
        }
        emit(value, frame, None)
    })
}

/// `Option` of a scalar: omitted at the top level, presence flag inside arrays.
pub(crate) fn nullable<X: 'static>(inner: Step<X>) -> Step<Option<X>> {
    let emit = inner.emit;
    Step {
        estimate: inner.estimate.optional(1, 1),
        emit: emitter(move |value: &Option<X>, frame, header| match (value, header) {
            (None, Some(_)) => Ok(()),
            (None, None) => frame.put_u8(0),
            (Some(value), Some(header)) => {
                frame.put_header(header)?;
                emit(value, frame, None)
            }
            (Some(value), None) => {
                frame.put_u8(1)?;
                emit(value, frame, None)
            }
        }),
    }
}

/// `Option` of a framed value: omitted at the top level, `-1` length inside arrays.
pub(crate) fn optional<X: 'static>(inner: Step<X>) -> Step<Option<X>> {
    let emit = inner.emit;
    Step {
        estimate: inner.estimate.optional(0, LENGTH_PREFIX),
        emit: emitter(move |value: &Option<X>, frame, header| match (value, header) {
            (None, Some(_)) => Ok(()),
            (None, None) => frame.put_i16_le(NULL_LENGTH),
            (Some(value), Some(header)) => {
                frame.put_header(header)?;
                emit(value, frame, None)
            }
            (Some(value), None) => emit(value, frame, None),
        }),
    }
}

/// Items of an array, without the length frame.
pub(crate) fn sequence<C: Sequence>(item: Step<C::Item>) -> Step<C> {
    let emit = item.emit;
    let estimate = match item.estimate {
        Estimate::Constant(n) => estimator(move |items: &C| items.len() * n),
        Estimate::Dynamic(f) => estimator(move |items: &C| items.iter().map(&f).sum()),
    };
    Step {
        estimate,
        emit: emitter(move |items: &C, frame, _| {
            for item in items.iter() {
                emit(item, frame, None)?;
            }
            Ok(())
        }),
    }
}

/// The flattened serializer of one root record type.
pub struct Routine<T> {
    estimate: Estimate<T>,
    emit: EmitFn<T>,
}

impl<T: 'static> Routine<T> {
    pub(crate) fn compile(writer: &Writer<T>) -> Self {
        let step = specialize(writer.unframed());
        Self {
            estimate: step.estimate,
            emit: step.emit,
        }
    }

    /// Upper bound on the bytes `value` encodes to.
    pub fn estimate(&self, value: &T) -> usize {
        self.estimate.of(value)
    }

    /// True when the estimate is a constant and no estimation pass runs.
    pub fn is_bounded(&self) -> bool {
        matches!(self.estimate, Estimate::Constant(_))
    }

    /// Encodes `value` into a scratch buffer and hands the written bytes to `sink`.
    ///
    /// Returns the number of bytes written. The sink is called exactly once on success and not
    /// at all on error.
    pub fn serialize<C, S>(&self, value: &T, context: &mut C, sink: &mut S) -> Result<usize>
    where
        C: ?Sized,
        S: Sink<C> + ?Sized,
    {
        let estimate = self.estimate(value);
        with_scratch(estimate, |buf| {
            let mut frame = Frame::new(buf);
            (self.emit)(value, &mut frame, None)?;
            sink.write(context, frame.written());
            Ok(frame.offset())
        })
    }
}

impl<T> fmt::Debug for Routine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("type", &type_name::<T>())
            .field("bounded", &matches!(self.estimate, Estimate::Constant(_)))
            .finish()
    }
}

type Erased = Arc<dyn Any + Send + Sync>;

thread_local! {
    static BUILDING: RefCell<Vec<TypeId>> = const { RefCell::new(Vec::new()) };
}

/// Marks a type as being built on this thread until dropped.
struct BuildGuard;

impl BuildGuard {
    fn enter<T: 'static>() -> Result<Self> {
        let key = TypeId::of::<T>();
        let entered = BUILDING.with(|building| {
            let mut building = building.borrow_mut();
            if building.contains(&key) {
                false
            } else {
                building.push(key);
                true
            }
        });
        if !entered {
            return Err(BuildError::Recursive {
                type_name: type_name::<T>(),
            }
            .into());
        }
        Ok(BuildGuard)
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        BUILDING.with(|building| {
            building.borrow_mut().pop();
        });
    }
}

/// Cache of writers and specialized routines.
///
/// Entries are built lazily on first use and never evicted. Builds run without holding a lock;
/// when two threads build the same entry concurrently, the first insert wins and every caller
/// observes that one `Arc`. Failed builds are not cached.
#[derive(Default)]
pub struct Registry {
    writers: RwLock<HashMap<TypeId, Erased>>,
    routines: RwLock<HashMap<(TypeId, TypeId), Erased>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`crate::serialize`] and [`crate::to_bytes`].
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Returns the writer of `T`, building it on first use.
    pub fn writer<T: Encode>(&self) -> Result<Arc<Writer<T>>> {
        let key = TypeId::of::<T>();
        if let Some(found) = self.writers.read().get(&key).cloned() {
            return downcast(found);
        }

        let built = {
            let _guard = BuildGuard::enter::<T>()?;
            T::writer(self).inspect_err(|err| {
                debug!(type_name = type_name::<T>(), error = %err, "writer build failed");
            })?
        };
        let built: Erased = Arc::new(built);
        let cached = insert_if_absent(&self.writers, key, built, "writer", type_name::<T>());
        downcast(cached)
    }

    /// Returns the routine serializing `T` for context type `C`, building it on first use.
    pub fn routine<C, T>(&self) -> Result<Arc<Routine<T>>>
    where
        C: ?Sized + 'static,
        T: Record,
    {
        let key = (TypeId::of::<C>(), TypeId::of::<T>());
        if let Some(found) = self.routines.read().get(&key).cloned() {
            return downcast(found);
        }

        let writer = self.writer::<T>()?;
        let built: Erased = Arc::new(Routine::compile(&writer));
        let cached = insert_if_absent(&self.routines, key, built, "routine", type_name::<T>());
        downcast(cached)
    }

    /// Serializes `value` with the cached routine for `(C, T)` and hands the bytes to `sink`.
    pub fn serialize<C, T, S>(&self, value: &T, context: &mut C, sink: &mut S) -> Result<usize>
    where
        C: ?Sized + 'static,
        T: Record,
        S: Sink<C> + ?Sized,
    {
        self.routine::<C, T>()?.serialize(value, context, sink)
    }

    /// Number of cached writers.
    pub fn writer_count(&self) -> usize {
        self.writers.read().len()
    }

    /// Number of cached routines.
    pub fn routine_count(&self) -> usize {
        self.routines.read().len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("writers", &self.writer_count())
            .field("routines", &self.routine_count())
            .finish()
    }
}

fn insert_if_absent<K>(
    map: &RwLock<HashMap<K, Erased>>,
    key: K,
    built: Erased,
    what: &str,
    type_name: &str,
) -> Erased
where
    K: std::hash::Hash + Eq,
{
    let mut inserted = false;
    let cached = map
        .write()
        .entry(key)
        .or_insert_with(|| {
            inserted = true;
            built
        })
        .clone();
    if inserted {
        debug!(type_name, what, "cached");
    } else {
        trace!(type_name, what, "discarded concurrent duplicate build");
    }
    cached
}

fn downcast<V: Any + Send + Sync>(erased: Erased) -> Result<Arc<V>> {
    erased.downcast::<V>().map_err(|_| {
        BuildError::Mismatch {
            type_name: type_name::<V>(),
        }
        .into()
    })
}
