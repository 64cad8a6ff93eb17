//! A minimal generational component store.
//!
//! The full game keeps its domain state (provinces, characters, armies) in
//! here; the core uses it for the time engine's scheduled events and
//! in-transit messages, which live as ordinary entities. Entities are
//! generational handles, so a stale handle held after `despawn` simply stops
//! resolving instead of aliasing a recycled slot.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::any::{Any, TypeId};

/// Amount of entity slots to grow by whenever the store runs out of space.
const WORLD_GROW_AMOUNT: u32 = 64;

/// Generational entity handle. Copyable, cheap, and safe to hold across
/// frames; resolving it checks the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    index: u32,
    generation: u64,
}

/// Anything storable as a component.
pub trait Component: Any + Send + Sync {}
impl<T: Any + Send + Sync> Component for T {}

trait Column: Any + Send + Sync {
    fn clear(&mut self, index: usize);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Component storage for one type, indexed by entity slot.
struct ComponentColumn<T> {
    cells: Vec<Option<T>>,
}

impl<T: Component> ComponentColumn<T> {
    fn set(&mut self, index: usize, value: T) {
        if index >= self.cells.len() {
            self.cells.resize_with(index + 1, || None);
        }
        self.cells[index] = Some(value);
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.cells.get(index).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.cells.get_mut(index).and_then(Option::as_mut)
    }
}

impl<T: Component> Column for ComponentColumn<T> {
    fn clear(&mut self, index: usize) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = None;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct WorldInner {
    /// Slot generations; `None` marks a free slot.
    generations: Vec<Option<u64>>,
    free_indices: Vec<u32>,
    next_generation: u64,
    columns: AHashMap<TypeId, Box<dyn Column>>,
}

impl WorldInner {
    fn is_alive(&self, entity: Entity) -> bool {
        self.generations
            .get(entity.index as usize)
            .copied()
            .flatten()
            == Some(entity.generation)
    }

    fn column<T: Component>(&self) -> Option<&ComponentColumn<T>> {
        self.columns
            .get(&TypeId::of::<T>())
            .map(|column| column.as_any().downcast_ref().expect("column type mapping"))
    }

    fn column_mut<T: Component>(&mut self) -> &mut ComponentColumn<T> {
        self.columns
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(ComponentColumn::<T> { cells: Vec::new() }))
            .as_any_mut()
            .downcast_mut()
            .expect("column type mapping")
    }
}

/// Shared component store. All operations take `&self`; the interior lock is
/// held only for the duration of a single call (or closure, for the `with`
/// accessors), so systems on any thread can use it.
#[derive(Default)]
pub struct World {
    inner: RwLock<WorldInner>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh entity slot.
    pub fn spawn(&self) -> Entity {
        let mut inner = self.inner.write();

        if inner.free_indices.is_empty() {
            let top = inner.generations.len() as u32;
            let new_top = top
                .checked_add(WORLD_GROW_AMOUNT)
                .expect("entity index overflow??");
            inner.generations.resize((new_top) as usize, None);
            inner.free_indices.extend((top..new_top).rev());
        }

        let index = inner.free_indices.pop().unwrap();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.generations[index as usize] = Some(generation);

        Entity { index, generation }
    }

    /// Destroys an entity and clears all of its components. Returns false for
    /// stale handles.
    pub fn despawn(&self, entity: Entity) -> bool {
        let mut inner = self.inner.write();
        if !inner.is_alive(entity) {
            return false;
        }

        inner.generations[entity.index as usize] = None;
        inner.free_indices.push(entity.index);
        for column in inner.columns.values_mut() {
            column.clear(entity.index as usize);
        }
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.inner.read().is_alive(entity)
    }

    /// Attaches a component, overwriting any existing one of the same type.
    /// Stale handles are ignored.
    pub fn insert<T: Component>(&self, entity: Entity, value: T) {
        let mut inner = self.inner.write();
        if inner.is_alive(entity) {
            inner.column_mut::<T>().set(entity.index as usize, value);
        }
    }

    /// Detaches a component. Returns whether one was present.
    pub fn remove<T: Component>(&self, entity: Entity) -> bool {
        let mut inner = self.inner.write();
        if !inner.is_alive(entity) {
            return false;
        }
        let index = entity.index as usize;
        let column = inner.column_mut::<T>();
        let present = column.get(index).is_some();
        Column::clear(column, index);
        present
    }

    /// Clones a component out of the store.
    pub fn get<T: Component + Clone>(&self, entity: Entity) -> Option<T> {
        self.with::<T, T>(entity, Clone::clone)
    }

    /// Runs `f` over an immutable borrow of the entity's `T` component.
    pub fn with<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.read();
        if !inner.is_alive(entity) {
            return None;
        }
        inner
            .column::<T>()
            .and_then(|column| column.get(entity.index as usize))
            .map(f)
    }

    /// Runs `f` over a mutable borrow of the entity's `T` component.
    pub fn with_mut<T: Component, R>(
        &self,
        entity: Entity,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        if !inner.is_alive(entity) {
            return None;
        }
        inner
            .column_mut::<T>()
            .get_mut(entity.index as usize)
            .map(f)
    }

    /// All live entities currently carrying a `T` component, in slot order.
    pub fn entities_with<T: Component>(&self) -> Vec<Entity> {
        let inner = self.inner.read();
        let Some(column) = inner.column::<T>() else {
            return Vec::new();
        };

        column
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_some())
            .filter_map(|(index, _)| {
                inner.generations[index].map(|generation| Entity {
                    index: index as u32,
                    generation,
                })
            })
            .collect()
    }

    /// Number of live entities carrying a `T` component.
    pub fn count<T: Component>(&self) -> usize {
        let inner = self.inner.read();
        inner
            .column::<T>()
            .map_or(0, |column| column.cells.iter().flatten().count())
    }
}

#[cfg(test)]
mod tests {
    use super::World;

    #[derive(Clone, Debug, PartialEq)]
    struct Label(&'static str);

    #[derive(Clone, Debug, PartialEq)]
    struct Hitpoints(u32);

    #[test]
    fn spawn_insert_get_roundtrip() {
        let world = World::new();
        let entity = world.spawn();

        world.insert(entity, Label("york"));
        world.insert(entity, Hitpoints(10));

        assert_eq!(world.get::<Label>(entity), Some(Label("york")));
        assert_eq!(world.with_mut::<Hitpoints, _>(entity, |hp| {
            hp.0 += 5;
            hp.0
        }), Some(15));
    }

    #[test]
    fn stale_handles_stop_resolving_after_despawn() {
        let world = World::new();
        let entity = world.spawn();
        world.insert(entity, Label("stale"));

        assert!(world.despawn(entity));
        assert!(!world.despawn(entity));
        assert!(world.get::<Label>(entity).is_none());

        // The recycled slot must not resurrect the old handle.
        let recycled = world.spawn();
        world.insert(recycled, Label("fresh"));
        assert!(world.get::<Label>(entity).is_none());
        assert_eq!(world.get::<Label>(recycled), Some(Label("fresh")));
    }

    #[test]
    fn entities_with_reports_only_live_carriers() {
        let world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let c = world.spawn();

        world.insert(a, Hitpoints(1));
        world.insert(b, Label("no hitpoints"));
        world.insert(c, Hitpoints(3));
        world.despawn(c);

        assert_eq!(world.entities_with::<Hitpoints>(), vec![a]);
        assert_eq!(world.count::<Hitpoints>(), 1);
    }
}
