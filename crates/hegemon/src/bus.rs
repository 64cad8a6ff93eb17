//! The engine-wide message bus.
//!
//! Systems communicate through typed broadcast messages rather than direct
//! references. Any thread may publish; handlers run synchronously on the
//! publishing thread, so they are expected to be short and must not block.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Marker for anything that can travel over the [`MessageBus`].
pub trait BusMessage: Any + Send + Sync {}
impl<T: Any + Send + Sync> BusMessage for T {}

type Handler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// Thread-safe publish/subscribe bus keyed by message type.
///
/// Handlers registered for a type `T` are invoked in subscription order every
/// time a `T` is published. There is no unsubscription; subscriptions live as
/// long as the bus, which is owned for the lifetime of the engine.
#[derive(Default)]
pub struct MessageBus {
    handlers: RwLock<AHashMap<TypeId, Vec<Handler>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every future message of type `T`.
    pub fn subscribe<T, F>(&self, handler: F)
    where
        T: BusMessage,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let erased: Handler = Arc::new(move |message| {
            if let Some(message) = message.downcast_ref::<T>() {
                handler(message);
            }
        });

        self.handlers
            .write()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(erased);
    }

    /// Delivers `message` to every handler subscribed to its type.
    pub fn publish<T: BusMessage>(&self, message: T) {
        // Handlers are cloned out so a handler that subscribes mid-dispatch
        // doesn't deadlock against the registry lock.
        let handlers: Vec<Handler> = {
            let map = self.handlers.read();
            match map.get(&TypeId::of::<T>()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            handler(&message);
        }
    }

    /// Number of handlers currently subscribed to `T`.
    pub fn subscriber_count<T: BusMessage>(&self) -> usize {
        self.handlers
            .read()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }
}
