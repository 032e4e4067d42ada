//! Trigger state machine. A trigger binds one or two conditions to one or two actions. Triggers
//! are pooled in a fixed capacity arena and addressed through generational handles, so a handle
//! to a trigger that already went off is detected instead of reaching a recycled slot.

pub mod action;
pub mod event;

use self::action::ActionTemplate;
use self::event::{EventState, EventTemplate, TriggerEvent};
use crate::event::{Cell, Target};
use flux::Tick;
use slog::{debug, o, trace, Logger};
use std::fmt;

pub type House = u8;
pub type ObjectId = Target;
pub type TriggerTypeId = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TriggerError {
    PoolExhausted,
    /// The handle refers to a trigger that no longer exists.
    Stale,
    AttachUnderflow,
    UnknownType(TriggerTypeId),
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TriggerError::PoolExhausted => write!(f, "trigger pool exhausted"),
            TriggerError::Stale => write!(f, "stale trigger handle"),
            TriggerError::AttachUnderflow => write!(f, "trigger attach count underflow"),
            TriggerError::UnknownType(id) => write!(f, "unknown trigger type {}", id),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Persistence {
    /// Fires once and is deleted.
    Volatile,
    /// Fires once every attachment sprung it, then is deleted.
    SemiPersistent,
    /// Re-arms after firing.
    Persistent,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventControl {
    Only,
    And,
    Or,
    /// Either event fires its own action.
    Linked,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActionControl {
    Only,
    And,
}

/// Static description of a trigger.
#[derive(Debug, Clone)]
pub struct TriggerType {
    pub name: String,
    pub house: House,
    pub persistence: Persistence,
    pub event_control: EventControl,
    pub action_control: ActionControl,
    pub event1: EventTemplate,
    pub event2: EventTemplate,
    pub action1: ActionTemplate,
    pub action2: ActionTemplate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Attachment {
    Object(ObjectId),
    Cell(Cell),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TriggerId {
    index: u32,
    generation: u32,
}

/// The game state triggers observe and act upon.
pub trait TriggerWorld {
    /// House owning the object, if it still exists.
    fn owner(&self, object: ObjectId) -> Option<House>;

    /// Evaluates a condition that depends on game state rather than the reported event.
    fn condition(&self, template: &EventTemplate, house: House) -> bool;

    /// Carries out an action. Returns whether anything was done.
    fn execute(
        &mut self,
        action: &ActionTemplate,
        house: House,
        object: Option<ObjectId>,
        trigger: TriggerId,
        cell: Option<Cell>,
    ) -> bool;

    /// The trigger no longer watches the attachment.
    fn detached(&mut self, trigger: TriggerId, attachment: Attachment);
}

#[derive(Debug)]
pub struct Trigger {
    type_id: TriggerTypeId,
    cell: Option<Cell>,
    events: [EventState; 2],
    attach_count: u32,
    attachments: Vec<Attachment>,
}

impl Trigger {
    #[inline]
    pub fn type_id(&self) -> TriggerTypeId {
        self.type_id
    }

    #[inline]
    pub fn cell(&self) -> Option<Cell> {
        self.cell
    }

    #[inline]
    pub fn attach_count(&self) -> u32 {
        self.attach_count
    }

    #[inline]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[inline]
    pub fn event_state(&self, slot: usize) -> &EventState {
        &self.events[slot]
    }

    fn remove_attachment(&mut self, attachment: Attachment) -> bool {
        match self.attachments.iter().position(|&existing| existing == attachment) {
            Some(index) => {
                self.attachments.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

struct Slot {
    generation: u32,
    trigger: Option<Trigger>,
}

/// Fixed capacity arena of live triggers.
pub struct TriggerPool {
    types: Vec<TriggerType>,
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    log: Logger,
}

impl TriggerPool {
    pub fn new(types: Vec<TriggerType>, capacity: usize, log: &Logger) -> TriggerPool {
        TriggerPool {
            types,
            capacity,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            log: log.new(o!("component" => "triggers")),
        }
    }

    #[inline]
    pub fn trigger_type(&self, type_id: TriggerTypeId) -> Option<&TriggerType> {
        self.types.get(type_id)
    }

    /// Number of live triggers.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.trigger.is_some()).count()
    }

    #[inline]
    pub fn get(&self, id: TriggerId) -> Result<&Trigger, TriggerError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.trigger.as_ref())
            .ok_or(TriggerError::Stale)
    }

    #[inline]
    fn get_mut(&mut self, id: TriggerId) -> Result<&mut Trigger, TriggerError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.trigger.as_mut())
            .ok_or(TriggerError::Stale)
    }

    /// Returns the live trigger of the given type, creating one when there is none.
    pub fn find_or_make(&mut self, type_id: TriggerTypeId) -> Result<TriggerId, TriggerError> {
        let kind = self.types.get(type_id).ok_or(TriggerError::UnknownType(type_id))?;

        let existing = self.slots.iter().enumerate().find_map(|(index, slot)| match &slot.trigger {
            Some(trigger) if trigger.type_id == type_id => Some(TriggerId {
                index: index as u32,
                generation: slot.generation,
            }),
            _ => None,
        });

        if let Some(id) = existing {
            return Ok(id);
        }

        let mut trigger = Trigger {
            type_id,
            cell: None,
            events: [EventState::default(); 2],
            attach_count: 0,
            attachments: Vec::new(),
        };
        kind.event1.reset(&mut trigger.events[0]);
        kind.event2.reset(&mut trigger.events[1]);

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    trigger: None,
                });
                self.slots.len() - 1
            }
            None => return Err(TriggerError::PoolExhausted),
        };

        debug!(self.log, "Trigger created"; "name" => &kind.name, "slot" => index);

        let slot = &mut self.slots[index];
        slot.trigger = Some(trigger);

        Ok(TriggerId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// Binds the trigger to a cell. Forced springs go off there.
    #[inline]
    pub fn set_cell(&mut self, id: TriggerId, cell: Cell) -> Result<(), TriggerError> {
        self.get_mut(id)?.cell = Some(cell);
        Ok(())
    }

    #[inline]
    pub fn attach(&mut self, id: TriggerId, attachment: Attachment) -> Result<(), TriggerError> {
        let trigger = self.get_mut(id)?;
        trigger.attachments.push(attachment);
        trigger.attach_count += 1;
        Ok(())
    }

    pub fn detach(&mut self, id: TriggerId, attachment: Attachment) -> Result<(), TriggerError> {
        let trigger = self.get_mut(id)?;

        if trigger.remove_attachment(attachment) {
            trigger.attach_count = trigger
                .attach_count
                .checked_sub(1)
                .ok_or(TriggerError::AttachUnderflow)?;
        }

        Ok(())
    }

    /// Runs down the timers of every live trigger.
    pub fn tick(&mut self, ticks: Tick) {
        for trigger in self.slots.iter_mut().filter_map(|slot| slot.trigger.as_mut()) {
            for state in trigger.events.iter_mut() {
                state.advance(ticks);
            }
        }
    }

    /// Drops every trigger, invalidating all handles.
    pub fn clear(&mut self) {
        self.free.clear();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.trigger.take().is_some() {
                slot.generation += 1;
            }
            self.free.push(index);
        }
    }

    /// Reports an event to the trigger. Returns whether the trigger fired.
    pub fn spring<W: TriggerWorld>(
        &mut self,
        id: TriggerId,
        occurred: TriggerEvent,
        object: Option<ObjectId>,
        cell: Option<Cell>,
        forced: bool,
        world: &mut W,
    ) -> Result<bool, TriggerError> {
        let types = &self.types;
        let log = &self.log;

        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(TriggerError::Stale)?;
        let trigger = slot.trigger.as_mut().ok_or(TriggerError::Stale)?;
        let kind = types.get(trigger.type_id).ok_or(TriggerError::Stale)?;

        let e1 = kind
            .event1
            .evaluate(&mut trigger.events[0], occurred, kind.house, object, forced, &*world);
        let mut e2 = false;

        let (execute, cell) = if forced {
            (true, trigger.cell)
        } else {
            let execute = match kind.event_control {
                EventControl::Only => e1,
                EventControl::And => {
                    e2 = kind
                        .event2
                        .evaluate(&mut trigger.events[1], occurred, kind.house, object, forced, &*world);
                    e1 && e2
                }
                EventControl::Or | EventControl::Linked => {
                    e2 = kind
                        .event2
                        .evaluate(&mut trigger.events[1], occurred, kind.house, object, forced, &*world);
                    e1 || e2
                }
            };

            (execute, cell)
        };

        if !execute {
            return Ok(false);
        }

        if kind.persistence == Persistence::SemiPersistent {
            if let Some(object) = object {
                if trigger.remove_attachment(Attachment::Object(object)) {
                    world.detached(id, Attachment::Object(object));
                }
            }

            if let Some(cell) = cell {
                if trigger.remove_attachment(Attachment::Cell(cell)) {
                    world.detached(id, Attachment::Cell(cell));
                }
            }

            // A count already at zero fires, the last spring may have performed no action
            trigger.attach_count = trigger.attach_count.saturating_sub(1);

            if trigger.attach_count > 0 {
                trace!(log, "Trigger waiting"; "name" => &kind.name, "remaining" => trigger.attach_count);
                return Ok(false);
            }
        }

        let mut performed = false;

        if kind.event_control == EventControl::Linked {
            if e1 || forced {
                performed |= world.execute(&kind.action1, kind.house, object, id, cell);
            }
            if e2 && !forced {
                performed |= world.execute(&kind.action2, kind.house, object, id, cell);
            }
        } else {
            performed |= world.execute(&kind.action1, kind.house, object, id, cell);

            if kind.action_control == ActionControl::And {
                performed |= world.execute(&kind.action2, kind.house, object, id, cell);
            }
        }

        if !performed {
            return Ok(false);
        }

        debug!(log, "Trigger fired"; "name" => &kind.name, "forced" => forced);

        match kind.persistence {
            Persistence::Persistent => {
                kind.event1.reset(&mut trigger.events[0]);
                kind.event2.reset(&mut trigger.events[1]);
            }
            Persistence::Volatile | Persistence::SemiPersistent => {
                for attachment in trigger.attachments.drain(..) {
                    world.detached(id, attachment);
                }

                slot.trigger = None;
                slot.generation += 1;
                self.free.push(id.index as usize);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::action::TriggerAction;
    use super::*;
    use flux::logging;
    use hashbrown::{HashMap, HashSet};

    #[derive(Default)]
    pub(crate) struct World {
        pub owners: HashMap<ObjectId, House>,
        pub conditions: HashSet<TriggerEvent>,
        pub executed: Vec<(TriggerAction, Option<Cell>)>,
        pub detached: Vec<Attachment>,
        pub refuse: bool,
    }

    impl TriggerWorld for World {
        fn owner(&self, object: ObjectId) -> Option<House> {
            self.owners.get(&object).copied()
        }

        fn condition(&self, template: &EventTemplate, _house: House) -> bool {
            self.conditions.contains(&template.event)
        }

        fn execute(
            &mut self,
            action: &ActionTemplate,
            _house: House,
            _object: Option<ObjectId>,
            _trigger: TriggerId,
            cell: Option<Cell>,
        ) -> bool {
            self.executed.push((action.action, cell));
            !self.refuse
        }

        fn detached(&mut self, _trigger: TriggerId, attachment: Attachment) {
            self.detached.push(attachment);
        }
    }

    fn trigger_type(persistence: Persistence, event_control: EventControl) -> TriggerType {
        TriggerType {
            name: "trig".to_owned(),
            house: 1,
            persistence,
            event_control,
            action_control: ActionControl::Only,
            event1: EventTemplate::new(TriggerEvent::Attacked, 1, 0),
            event2: EventTemplate::new(TriggerEvent::Destroyed, 1, 0),
            action1: ActionTemplate::new(TriggerAction::Win, 0),
            action2: ActionTemplate::new(TriggerAction::Lose, 0),
        }
    }

    fn pool(types: Vec<TriggerType>) -> TriggerPool {
        TriggerPool::new(types, 4, &logging::discard())
    }

    #[test]
    fn test_volatile_unreachable_after_firing() {
        let mut world = World::default();
        let mut pool = pool(vec![trigger_type(Persistence::Volatile, EventControl::Only)]);

        let id = pool.find_or_make(0).unwrap();
        pool.attach(id, Attachment::Object(7)).unwrap();
        pool.attach(id, Attachment::Cell(300)).unwrap();

        assert!(!pool.spring(id, TriggerEvent::Destroyed, Some(7), None, false, &mut world).unwrap());
        assert!(pool.spring(id, TriggerEvent::Attacked, Some(7), None, false, &mut world).unwrap());

        assert_eq!(world.executed, vec![(TriggerAction::Win, None)]);
        assert_eq!(world.detached.len(), 2);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.get(id).unwrap_err(), TriggerError::Stale);
        assert_eq!(
            pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap_err(),
            TriggerError::Stale
        );

        // The slot is recycled under a new handle
        let next = pool.find_or_make(0).unwrap();
        assert_ne!(next, id);
        assert!(pool.get(next).is_ok());
    }

    #[test]
    fn test_semipersistent_fires_on_last_attachment() {
        let mut world = World::default();
        let mut pool = pool(vec![trigger_type(Persistence::SemiPersistent, EventControl::Only)]);

        let id = pool.find_or_make(0).unwrap();
        for object in 1..=3 {
            pool.attach(id, Attachment::Object(object)).unwrap();
        }

        assert!(!pool.spring(id, TriggerEvent::Attacked, Some(1), None, false, &mut world).unwrap());
        assert!(!pool.spring(id, TriggerEvent::Attacked, Some(2), None, false, &mut world).unwrap());
        assert!(world.executed.is_empty());
        assert_eq!(pool.get(id).unwrap().attach_count(), 1);

        assert!(pool.spring(id, TriggerEvent::Attacked, Some(3), None, false, &mut world).unwrap());
        assert_eq!(world.executed.len(), 1);
        assert_eq!(pool.get(id).unwrap_err(), TriggerError::Stale);
        assert_eq!(
            world.detached,
            vec![Attachment::Object(1), Attachment::Object(2), Attachment::Object(3)]
        );
    }

    #[test]
    fn test_semipersistent_unattached_fires() {
        let mut world = World::default();
        let mut pool = pool(vec![trigger_type(Persistence::SemiPersistent, EventControl::Only)]);

        let id = pool.find_or_make(0).unwrap();

        assert!(pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap());
        assert_eq!(world.executed, vec![(TriggerAction::Win, None)]);
        assert_eq!(pool.get(id).unwrap_err(), TriggerError::Stale);
    }

    #[test]
    fn test_semipersistent_retries_after_refused_action() {
        let mut world = World {
            refuse: true,
            ..World::default()
        };
        let mut pool = pool(vec![trigger_type(Persistence::SemiPersistent, EventControl::Only)]);

        let id = pool.find_or_make(0).unwrap();
        pool.attach(id, Attachment::Object(1)).unwrap();

        // The last attachment springs but no action takes effect
        assert!(!pool.spring(id, TriggerEvent::Attacked, Some(1), None, false, &mut world).unwrap());
        assert_eq!(pool.get(id).unwrap().attach_count(), 0);

        world.refuse = false;
        assert!(pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap());
        assert_eq!(world.executed.len(), 2);
        assert_eq!(pool.get(id).unwrap_err(), TriggerError::Stale);
    }

    #[test]
    fn test_detach_underflow() {
        let mut pool = pool(vec![trigger_type(Persistence::SemiPersistent, EventControl::Only)]);

        let id = pool.find_or_make(0).unwrap();
        pool.attach(id, Attachment::Object(1)).unwrap();
        pool.get_mut(id).unwrap().attach_count = 0;

        assert_eq!(
            pool.detach(id, Attachment::Object(1)).unwrap_err(),
            TriggerError::AttachUnderflow
        );
    }

    #[test]
    fn test_persistent_refires() {
        let mut world = World::default();
        let mut kind = trigger_type(Persistence::Persistent, EventControl::Only);
        kind.event1 = EventTemplate::new(TriggerEvent::Time, 1, 1);
        let mut pool = pool(vec![kind]);

        let id = pool.find_or_make(0).unwrap();

        for round in 1..=2 {
            assert!(!pool.spring(id, TriggerEvent::Any, None, None, false, &mut world).unwrap());
            pool.tick(event::TIME_UNIT);
            assert!(pool.spring(id, TriggerEvent::Any, None, None, false, &mut world).unwrap());
            assert_eq!(world.executed.len(), round);

            // Timer re-armed
            assert_eq!(pool.get(id).unwrap().event_state(0).timer, event::TIME_UNIT);
        }
    }

    #[test]
    fn test_linked_fires_matching_action() {
        let mut world = World::default();
        let mut pool = pool(vec![trigger_type(Persistence::Persistent, EventControl::Linked)]);
        let id = pool.find_or_make(0).unwrap();

        assert!(pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap());
        assert_eq!(world.executed, vec![(TriggerAction::Win, None)]);

        world.executed.clear();
        assert!(pool.spring(id, TriggerEvent::Destroyed, None, None, false, &mut world).unwrap());
        assert_eq!(world.executed, vec![(TriggerAction::Lose, None)]);
    }

    #[test]
    fn test_and_requires_both() {
        let mut world = World::default();
        let mut kind = trigger_type(Persistence::Volatile, EventControl::And);
        kind.event2 = EventTemplate::new(TriggerEvent::GlobalSet, 1, 3);
        kind.action_control = ActionControl::And;
        let mut pool = pool(vec![kind]);
        let id = pool.find_or_make(0).unwrap();

        assert!(!pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap());

        world.conditions.insert(TriggerEvent::GlobalSet);
        assert!(pool.spring(id, TriggerEvent::Attacked, None, None, false, &mut world).unwrap());
        assert_eq!(
            world.executed,
            vec![(TriggerAction::Win, None), (TriggerAction::Lose, None)]
        );
    }

    #[test]
    fn test_forced_uses_bound_cell() {
        let mut world = World::default();
        let mut pool = pool(vec![trigger_type(Persistence::Persistent, EventControl::Linked)]);
        let id = pool.find_or_make(0).unwrap();
        pool.set_cell(id, 512).unwrap();

        assert!(pool.spring(id, TriggerEvent::None, None, Some(9), true, &mut world).unwrap());

        // Forced linked triggers only run the first action
        assert_eq!(world.executed, vec![(TriggerAction::Win, Some(512))]);

        // A forced spring trips only the first event slot
        world.refuse = true;
        assert!(!pool.spring(id, TriggerEvent::None, None, None, true, &mut world).unwrap());
        let trigger = pool.get(id).unwrap();
        assert!(trigger.event_state(0).tripped);
        assert!(!trigger.event_state(1).tripped);
    }

    #[test]
    fn test_find_or_make_reuses_instance() {
        let mut pool = pool(vec![
            trigger_type(Persistence::Volatile, EventControl::Only),
            trigger_type(Persistence::Persistent, EventControl::Only),
        ]);

        let first = pool.find_or_make(0).unwrap();
        assert_eq!(pool.find_or_make(0).unwrap(), first);
        assert_ne!(pool.find_or_make(1).unwrap(), first);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.find_or_make(5).unwrap_err(), TriggerError::UnknownType(5));
    }

    #[test]
    fn test_pool_exhausted() {
        let types = (0..5)
            .map(|_| trigger_type(Persistence::Volatile, EventControl::Only))
            .collect();
        let mut pool = pool(types);

        for type_id in 0..4 {
            pool.find_or_make(type_id).unwrap();
        }

        assert_eq!(pool.find_or_make(4).unwrap_err(), TriggerError::PoolExhausted);
    }

    #[test]
    fn test_detach() {
        let mut pool = pool(vec![trigger_type(Persistence::SemiPersistent, EventControl::Only)]);
        let id = pool.find_or_make(0).unwrap();

        pool.attach(id, Attachment::Cell(4)).unwrap();
        pool.detach(id, Attachment::Cell(4)).unwrap();
        pool.detach(id, Attachment::Cell(4)).unwrap();

        assert_eq!(pool.get(id).unwrap().attach_count(), 0);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut pool = pool(vec![trigger_type(Persistence::Persistent, EventControl::Only)]);
        let id = pool.find_or_make(0).unwrap();

        pool.clear();

        assert_eq!(pool.len(), 0);
        assert_eq!(pool.get(id).unwrap_err(), TriggerError::Stale);
        assert!(pool.find_or_make(0).is_ok());
    }
}
