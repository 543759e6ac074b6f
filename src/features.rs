#[cfg(feature = "indexmap")]
use indexmap::IndexSet;
#[cfg(feature = "smol_str")]
use smol_str::SmolStr;
#[cfg(feature = "ulid")]
use ulid::Ulid;

#[allow(unused_imports)]
use crate::core::*;
#[allow(unused_imports)]
use crate::*;

// --- IndexSet ---
/// Encodes an `IndexSet<T>` as an array in insertion order.
#[cfg(feature = "indexmap")]
impl<T: Encode, S: Send + Sync + 'static> Encode for IndexSet<T, S> {
    fn writer(registry: &Registry) -> Result<Writer<Self>> {
        Writer::sequence(registry)
    }
}

#[cfg(feature = "indexmap")]
impl<T: Encode, S: Send + Sync + 'static> Sequence for IndexSet<T, S> {
    type Item = T;
    type Iter<'a> = indexmap::set::Iter<'a, T>;

    fn len(&self) -> usize {
        IndexSet::len(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        IndexSet::iter(self)
    }
}

// --- SmolStr ---
/// Encodes a `SmolStr` exactly like a `String`.
#[cfg(feature = "smol_str")]
impl Encode for SmolStr {
    fn writer(_registry: &Registry) -> Result<Writer<Self>> {
        Ok(Writer::text(SmolStr::as_str))
    }
}

// --- Ulid ---
/// Encodes a `Ulid` as 16 big-endian bytes under the GUID manifest.
#[cfg(feature = "ulid")]
impl Encode for Ulid {
    fn writer(_registry: &Registry) -> Result<Writer<Self>> {
        fn put(value: &Ulid, frame: &mut Frame<'_>) -> Result<()> {
            frame.put_slice(&value.to_bytes())
        }
        Ok(Writer::scalar(MANIFEST_GUID, 16, put))
    }
}
