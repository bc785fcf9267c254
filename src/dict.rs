//! A persistent dictionary whose bindings are predicates over keys.
//!
//! A [`Dict`] is a chain of layers, newest first. Every write (`insert`,
//! `remove`, `with_predicate`) pushes one layer on top of the chain it was
//! called on and returns the new head; the chain below is shared, never
//! copied and never mutated. Lookup walks the chain from the head and stops
//! at the first layer that decides the key:
//!
//! * a binding whose guard admits the key yields its value,
//! * a removal of exactly that key yields nothing,
//! * a mapped view defers to the chain it wraps,
//! * reaching the base yields nothing.
//!
//! Precedence is positional only. A newer layer always wins over an older
//! one, no matter how specific either guard is, and shadowed layers are kept
//! around for as long as the chain is.
//!
//! Lookup, [`Dict::depth`] and drop never recurse per layer, including
//! through views stacked by repeated [`Dict::map`] calls: the chains under
//! a view are reached through type-erased handles and walked in a loop.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::config::deep_chain_warning;
use crate::error::{Error, Result};

/// A shared key test attached to a binding. It must be pure: it may be
/// invoked any number of times per lookup.
pub type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

enum Guard<K> {
    /// Admits exactly one key, by equality
    Key(K),
    Pred(Predicate<K>),
}

impl<K: PartialEq> Guard<K> {
    #[inline]
    fn admits(&self, key: &K) -> bool {
        match self {
            Guard::Key(k) => k == key,
            Guard::Pred(pred) => pred(key),
        }
    }
}

/// A value travelling up through mapped views during a lookup
enum Carried<'a> {
    /// Still inside the layer that bound it
    Stored(&'a (dyn Any + 'static)),
    Computed(Box<dyn Any>),
}

impl Carried<'_> {
    fn take<U: Clone + 'static>(self) -> U {
        let value = match self {
            Carried::Stored(value) => value.downcast_ref::<U>().cloned(),
            Carried::Computed(value) => value.downcast::<U>().ok().map(|value| *value),
        };
        value.expect("a view only receives values from the chain it wraps")
    }
}

/// One step of a lookup over a chain whose value type is erased
enum Step<'a, K> {
    Found(usize, &'a (dyn Any + 'static)),
    Removed(usize),
    Unbound,
    Deferred(usize, &'a dyn Lift<K>),
}

/// A chain seen without its value type
trait Source<K> {
    fn step(&self, key: &K) -> Step<'_, K>;
    /// Layers above the first view, and that view
    fn span(&self) -> (usize, Option<&dyn Lift<K>>);
}

/// A mapped view seen from below: the chain it wraps and its transform,
/// both over erased values
trait Lift<K>: Send + Sync {
    fn source(&self) -> &dyn Source<K>;
    fn lift(&self, value: Carried<'_>) -> Box<dyn Any>;
}

/// A mapped view seen from the chain it heads
trait View<K, V>: Lift<K> {
    fn finish(&self, value: Carried<'_>) -> V;
    fn as_lift(&self) -> &dyn Lift<K>;
    /// Hands over the wrapped chain so it can be unlinked by the caller
    fn take_inner(&mut self) -> Option<Box<dyn Detach>>;
}

/// An owned chain that can be torn down one layer at a time
trait Detach {
    /// Drops the layers this handle owns uniquely, down to the next view,
    /// and returns the chain that view wrapped
    fn detach(self: Box<Self>) -> Option<Box<dyn Detach>>;
}

struct MapView<K, U, F> {
    inner: Dict<K, U>,
    f: F,
}

impl<K, U, W, F> Lift<K> for MapView<K, U, F>
where
    K: PartialEq + Send + Sync,
    U: Clone + Send + Sync + 'static,
    W: 'static,
    F: Fn(U) -> W + Send + Sync,
{
    fn source(&self) -> &dyn Source<K> {
        &self.inner
    }

    fn lift(&self, value: Carried<'_>) -> Box<dyn Any> {
        Box::new((self.f)(value.take::<U>()))
    }
}

impl<K, U, W, F> View<K, W> for MapView<K, U, F>
where
    K: PartialEq + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    W: 'static,
    F: Fn(U) -> W + Send + Sync,
{
    fn finish(&self, value: Carried<'_>) -> W {
        (self.f)(value.take::<U>())
    }

    fn as_lift(&self) -> &dyn Lift<K> {
        self
    }

    fn take_inner(&mut self) -> Option<Box<dyn Detach>> {
        self.inner
            .head
            .take()
            .map(|head| Box::new(head) as Box<dyn Detach>)
    }
}

enum Layer<K, V> {
    Bind {
        guard: Guard<K>,
        value: V,
        parent: Dict<K, V>,
    },
    /// Left by `remove`: `key` resolves to nothing from here down
    Block { key: K, parent: Dict<K, V> },
    /// Left by `map`: terminal for the outer chain
    Mapped(Box<dyn View<K, V>>),
}

impl<K, V> Layer<K, V> {
    #[inline]
    fn parent(&self) -> Option<&Layer<K, V>> {
        match self {
            Layer::Bind { parent, .. } | Layer::Block { parent, .. } => parent.head.as_deref(),
            Layer::Mapped(_) => None,
        }
    }
}

/// Unlinks uniquely owned layers one at a time. Stops at the first shared
/// layer, or at a view, whose wrapped chain is handed back.
fn unlink<K, V>(mut next: Option<Arc<Layer<K, V>>>) -> Option<Box<dyn Detach>> {
    while let Some(layer) = next {
        let mut layer = Arc::try_unwrap(layer).ok()?;
        next = match &mut layer {
            Layer::Bind { parent, .. } | Layer::Block { parent, .. } => parent.head.take(),
            Layer::Mapped(view) => return view.take_inner(),
        };
    }
    None
}

impl<K, V> Detach for Arc<Layer<K, V>> {
    fn detach(self: Box<Self>) -> Option<Box<dyn Detach>> {
        unlink(Some(*self))
    }
}

/// The outcome of resolving a key, with the position of the layer that
/// decided it.
///
/// `depth` counts layers from the head of the chain, starting at 0. Layers of
/// a chain wrapped by [`Dict::map`] are counted as if they sat directly below
/// the layers written after the `map`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution<V> {
    /// A binding admitted the key
    Found { depth: usize, value: V },
    /// A `remove` of this key sits above every binding that would admit it
    Removed { depth: usize },
    /// No layer decided the key
    Unbound,
}

impl<V> Resolution<V> {
    /// Drops the provenance, keeping only the value
    #[inline]
    pub fn into_value(self) -> Option<V> {
        match self {
            Resolution::Found { value, .. } => Some(value),
            Resolution::Removed { .. } | Resolution::Unbound => None,
        }
    }

    /// True when a binding admitted the key
    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found { .. })
    }

    /// Transforms the value of a `Found` resolution
    pub fn map<W, F: FnOnce(V) -> W>(self, f: F) -> Resolution<W> {
        match self {
            Resolution::Found { depth, value } => Resolution::Found {
                depth,
                value: f(value),
            },
            Resolution::Removed { depth } => Resolution::Removed { depth },
            Resolution::Unbound => Resolution::Unbound,
        }
    }
}

/// Where the walk over the outer chain stopped
enum Stop<'a, K, V> {
    Found(usize, &'a V),
    Removed(usize),
    Unbound(usize),
    Deferred(usize, &'a dyn View<K, V>),
}

/// An immutable dictionary from keys to values, resolved through a chain of
/// predicates evaluated newest first.
///
/// Keys only need [`PartialEq`]. Cloning a `Dict` is cheap: it shares the
/// whole chain.
pub struct Dict<K, V> {
    head: Option<Arc<Layer<K, V>>>,
}

impl<K, V> Dict<K, V> {
    /// The dictionary with no bindings; every key resolves to nothing.
    #[inline]
    pub const fn empty() -> Self {
        Dict { head: None }
    }

    /// Same as [`Dict::empty`]
    #[inline]
    pub const fn new() -> Self {
        Self::empty()
    }

    #[inline]
    fn push(&self, layer: Layer<K, V>) -> Self {
        Dict {
            head: Some(Arc::new(layer)),
        }
    }

    fn layers(&self) -> Layers<'_, K, V> {
        Layers {
            next: self.head.as_deref(),
        }
    }

    /// Layers above the first view, and that view
    fn surface(&self) -> (usize, Option<&dyn Lift<K>>) {
        let mut count = 0;
        for layer in self.layers() {
            if let Layer::Mapped(view) = layer {
                return (count, Some(view.as_lift()));
            }
            count += 1;
        }
        (count, None)
    }

    /// Returns a new dictionary in which `key` resolves to `value`. Any
    /// earlier binding for `key` is shadowed, not deleted.
    pub fn insert(&self, key: K, value: V) -> Self {
        self.push(Layer::Bind {
            guard: Guard::Key(key),
            value,
            parent: self.clone(),
        })
    }

    /// Returns a new dictionary in which `key` resolves to nothing. Writes
    /// made before this call can no longer be reached through `key`; writes
    /// made on the result can.
    pub fn remove(&self, key: K) -> Self {
        self.push(Layer::Block {
            key,
            parent: self.clone(),
        })
    }

    /// Returns a new dictionary in which every key admitted by `pred`
    /// resolves to `value`, ahead of everything already in `self`.
    pub fn with_predicate<P>(&self, pred: P, value: V) -> Self
    where
        P: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.with_shared_predicate(Arc::new(pred), value)
    }

    /// Like [`Dict::with_predicate`], for a predicate that is already shared
    pub fn with_shared_predicate(&self, pred: Predicate<K>, value: V) -> Self {
        self.push(Layer::Bind {
            guard: Guard::Pred(pred),
            value,
            parent: self.clone(),
        })
    }

    /// Builds a dictionary by inserting `pairs` in order, so that the last
    /// occurrence of a key wins.
    pub fn from_list<I: IntoIterator<Item = (K, V)>>(pairs: I) -> Self {
        pairs
            .into_iter()
            .fold(Self::empty(), |dict, (key, value)| dict.insert(key, value))
    }

    /// Number of writes composed into this dictionary, shadowed ones
    /// included. `map` is not a write. Linear in the length of the chain.
    pub fn depth(&self) -> usize {
        let (mut total, mut below) = self.surface();
        while let Some(view) = below {
            let (count, next) = view.source().span();
            total += count;
            below = next;
        }
        total
    }

    /// True when no write has ever been composed into this dictionary
    #[inline]
    pub fn is_empty(&self) -> bool {
        // `map` over an empty chain returns the empty chain, so a view is
        // never the only thing in a chain
        self.head.is_none()
    }
}

impl<K: PartialEq, V> Dict<K, V> {
    fn walk(&self, key: &K) -> Stop<'_, K, V> {
        let mut depth = 0;
        let mut cursor = self.head.as_deref();
        let stop = loop {
            let Some(layer) = cursor else {
                break Stop::Unbound(depth);
            };
            match layer {
                Layer::Bind { guard, value, .. } if guard.admits(key) => {
                    break Stop::Found(depth, value);
                }
                Layer::Block { key: blocked, .. } if blocked == key => {
                    break Stop::Removed(depth);
                }
                Layer::Mapped(view) => break Stop::Deferred(depth, &**view),
                _ => {}
            }
            cursor = layer.parent();
            depth += 1;
        };

        let walked = match stop {
            Stop::Found(d, _) | Stop::Removed(d) | Stop::Unbound(d) | Stop::Deferred(d, _) => d,
        };
        let threshold = deep_chain_warning();
        if exceeds(walked, threshold) {
            warn!(walked, threshold, "lookup walked a deep chain");
        }
        stop
    }

    /// Follows `view` down through any further views until some layer
    /// decides `key`, then applies the pending transforms innermost first.
    fn resolve_deferred(view: &dyn View<K, V>, key: &K) -> Resolution<V> {
        let mut lifts: Vec<&dyn Lift<K>> = Vec::new();
        let mut source = view.source();
        let mut offset = 0;
        loop {
            match source.step(key) {
                Step::Found(depth, value) => {
                    let carried = lifts
                        .iter()
                        .rev()
                        .fold(Carried::Stored(value), |carried, lift| {
                            Carried::Computed(lift.lift(carried))
                        });
                    return Resolution::Found {
                        depth: offset + depth,
                        value: view.finish(carried),
                    };
                }
                Step::Removed(depth) => return Resolution::Removed { depth: offset + depth },
                Step::Unbound => return Resolution::Unbound,
                Step::Deferred(depth, lift) => {
                    offset += depth;
                    lifts.push(lift);
                    source = lift.source();
                }
            }
        }
    }

    /// Resolves `key` and reports which layer decided it
    pub fn resolve(&self, key: &K) -> Resolution<V>
    where
        V: Clone,
    {
        let resolution = match self.walk(key) {
            Stop::Found(depth, value) => Resolution::Found {
                depth,
                value: value.clone(),
            },
            Stop::Removed(depth) => Resolution::Removed { depth },
            Stop::Unbound(_) => Resolution::Unbound,
            Stop::Deferred(depth, view) => match Self::resolve_deferred(view, key) {
                Resolution::Found { depth: below, value } => Resolution::Found {
                    depth: depth + below,
                    value,
                },
                Resolution::Removed { depth: below } => Resolution::Removed {
                    depth: depth + below,
                },
                Resolution::Unbound => Resolution::Unbound,
            },
        };
        let (outcome, depth) = describe(&resolution);
        trace!(outcome, ?depth, "resolved key");
        resolution
    }

    /// The value the newest layer admitting `key` carries, if any
    #[inline]
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.resolve(key).into_value()
    }

    /// True when `key` resolves to a value. Neither clones nor transforms
    /// the value.
    pub fn contains_key(&self, key: &K) -> bool {
        let mut source = match self.walk(key) {
            Stop::Found(..) => return true,
            Stop::Removed(_) | Stop::Unbound(_) => return false,
            Stop::Deferred(_, view) => view.source(),
        };
        loop {
            match source.step(key) {
                Step::Found(..) => return true,
                Step::Removed(_) | Step::Unbound => return false,
                Step::Deferred(_, lift) => source = lift.source(),
            }
        }
    }

    /// Like [`Dict::get`], but treats a missing value as an error that says
    /// why it is missing.
    pub fn lookup(&self, key: &K) -> Result<V>
    where
        K: fmt::Debug,
        V: Clone,
    {
        match self.resolve(key) {
            Resolution::Found { value, .. } => Ok(value),
            Resolution::Removed { depth } => Err(Error::Removed {
                key: format!("{key:?}"),
                depth,
            }),
            Resolution::Unbound => Err(Error::Unbound {
                key: format!("{key:?}"),
            }),
        }
    }

    /// Returns a dictionary that resolves every key to `f` applied to what
    /// `self` resolves it to. `f` runs at lookup time, once per successful
    /// lookup.
    pub fn map<W, F>(&self, f: F) -> Dict<K, W>
    where
        K: Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        W: 'static,
        F: Fn(V) -> W + Send + Sync + 'static,
    {
        if self.head.is_none() {
            return Dict::empty();
        }
        Dict {
            head: Some(Arc::new(Layer::Mapped(Box::new(MapView {
                inner: self.clone(),
                f,
            })))),
        }
    }
}

impl<K: PartialEq, U: 'static> Source<K> for Dict<K, U> {
    fn step(&self, key: &K) -> Step<'_, K> {
        match self.walk(key) {
            Stop::Found(depth, value) => Step::Found(depth, value),
            Stop::Removed(depth) => Step::Removed(depth),
            Stop::Unbound(_) => Step::Unbound,
            Stop::Deferred(depth, view) => Step::Deferred(depth, view.as_lift()),
        }
    }

    fn span(&self) -> (usize, Option<&dyn Lift<K>>) {
        self.surface()
    }
}

#[inline]
fn exceeds(walked: usize, threshold: usize) -> bool {
    threshold != 0 && walked > threshold
}

fn describe<V>(resolution: &Resolution<V>) -> (&'static str, Option<usize>) {
    match resolution {
        Resolution::Found { depth, .. } => ("found", Some(*depth)),
        Resolution::Removed { depth } => ("removed", Some(*depth)),
        Resolution::Unbound => ("unbound", None),
    }
}

struct Layers<'a, K, V> {
    next: Option<&'a Layer<K, V>>,
}

impl<'a, K, V> Iterator for Layers<'a, K, V> {
    type Item = &'a Layer<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let layer = self.next?;
        self.next = layer.parent();
        Some(layer)
    }
}

impl<K, V> Clone for Dict<K, V> {
    #[inline]
    fn clone(&self) -> Self {
        Dict {
            head: self.head.clone(),
        }
    }
}

impl<K, V> Default for Dict<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

// Tears the chain down in a loop, so that neither a long chain nor a deep
// stack of views recurses once per layer.
impl<K, V> Drop for Dict<K, V> {
    fn drop(&mut self) {
        let mut rest = unlink(self.head.take());
        while let Some(chain) = rest {
            rest = chain.detach();
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Dict<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_list(iter)
    }
}

struct LayerDebug<'a, K, V>(&'a Layer<K, V>);

impl<K: fmt::Debug, V> fmt::Debug for LayerDebug<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Layer::Bind {
                guard: Guard::Key(key),
                ..
            } => write!(f, "bind {key:?}"),
            Layer::Bind {
                guard: Guard::Pred(_),
                ..
            } => write!(f, "pred"),
            Layer::Block { key, .. } => write!(f, "remove {key:?}"),
            Layer::Mapped(_) => write!(f, "mapped"),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Dict<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dict")?;
        f.debug_list()
            .entries(self.layers().map(LayerDebug))
            .finish()
    }
}
