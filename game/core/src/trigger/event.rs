use crate::trigger::{House, ObjectId, TriggerWorld};
use flux::time::TICKS_PER_SECOND;
use flux::Tick;

/// Timer values of `Time` events are given in tenths of a minute.
pub const TIME_UNIT: Tick = TICKS_PER_SECOND * 6;

/// Condition a trigger waits for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TriggerEvent {
    None,
    PlayerEntered,
    Spied,
    Thieved,
    Discovered,
    HouseDiscovered,
    Attacked,
    Destroyed,
    Any,
    UnitsDestroyed,
    BuildingsDestroyed,
    AllDestroyed,
    Credits,
    Time,
    MissionTimerExpired,
    BuildingsLost,
    UnitsLost,
    NoFactories,
    CivilianEvacuated,
    BuildBuilding,
    BuildUnit,
    BuildInfantry,
    BuildAircraft,
    LeavesMap,
    EntersZone,
    CrossHorizontal,
    CrossVertical,
    GlobalSet,
    GlobalClear,
    FakesDestroyed,
    LowPower,
    AllBridgesDestroyed,
    BuildingExists,
}

impl TriggerEvent {
    /// Events that only hold when the very same event is being reported.
    #[inline]
    pub fn is_occurrence(self) -> bool {
        match self {
            TriggerEvent::Attacked
            | TriggerEvent::Destroyed
            | TriggerEvent::Discovered
            | TriggerEvent::Spied
            | TriggerEvent::CrossHorizontal
            | TriggerEvent::CrossVertical
            | TriggerEvent::EntersZone
            | TriggerEvent::PlayerEntered => true,
            _ => false,
        }
    }

    /// Occurrences that additionally require the object to belong to the template's house.
    #[inline]
    fn requires_owner(self) -> bool {
        match self {
            TriggerEvent::PlayerEntered
            | TriggerEvent::CrossHorizontal
            | TriggerEvent::CrossVertical
            | TriggerEvent::EntersZone => true,
            _ => false,
        }
    }

    /// Conditions that stay tripped once observed.
    #[inline]
    fn latches(self) -> bool {
        match self {
            TriggerEvent::AllBridgesDestroyed
            | TriggerEvent::BuildBuilding
            | TriggerEvent::BuildUnit
            | TriggerEvent::BuildInfantry
            | TriggerEvent::BuildAircraft
            | TriggerEvent::LeavesMap => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EventTemplate {
    pub event: TriggerEvent,
    /// House the event refers to, where it matters.
    pub house: House,
    /// Event specific parameter: credits, counts, global flag index, timer length...
    pub value: i32,
}

impl EventTemplate {
    #[inline]
    pub fn new(event: TriggerEvent, house: House, value: i32) -> EventTemplate {
        EventTemplate { event, house, value }
    }

    #[inline]
    pub fn none() -> EventTemplate {
        EventTemplate::new(TriggerEvent::None, 0, 0)
    }

    /// Clears the tripped flag and re-arms the timer.
    pub fn reset(&self, state: &mut EventState) {
        state.tripped = false;

        if self.event == TriggerEvent::Time {
            state.timer = self.value.max(0) as Tick * TIME_UNIT;
        }
    }

    /// Checks whether the event holds. `occurred` is the event being reported, `house` the house
    /// owning the trigger.
    pub fn evaluate<W: TriggerWorld>(
        &self,
        state: &mut EventState,
        occurred: TriggerEvent,
        house: House,
        object: Option<ObjectId>,
        forced: bool,
        world: &W,
    ) -> bool {
        if forced {
            state.tripped = true;
        }

        if state.tripped {
            return true;
        }

        match self.event {
            TriggerEvent::None => return false,
            TriggerEvent::Time => return state.timer == 0,
            TriggerEvent::GlobalSet | TriggerEvent::GlobalClear | TriggerEvent::MissionTimerExpired => {
                return world.condition(self, house)
            }
            _ => (),
        }

        if self.event.is_occurrence() && occurred != self.event && occurred != TriggerEvent::Any {
            return false;
        }

        if self.event.requires_owner() {
            let owned = object.and_then(|object| world.owner(object)) == Some(self.house);
            state.tripped = owned;
            return owned;
        }

        if self.event.is_occurrence() {
            return true;
        }

        if !world.condition(self, house) {
            return false;
        }

        if self.event.latches() {
            state.tripped = true;
        }

        true
    }
}

/// Per trigger state of one event slot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct EventState {
    pub tripped: bool,
    /// Remaining ticks of a `Time` event.
    pub timer: Tick,
}

impl EventState {
    #[inline]
    pub fn advance(&mut self, ticks: Tick) {
        self.timer = self.timer.saturating_sub(ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::tests::World;

    #[test]
    fn test_occurrence_must_match() {
        let world = World::default();
        let template = EventTemplate::new(TriggerEvent::Attacked, 1, 0);
        let mut state = EventState::default();

        assert!(!template.evaluate(&mut state, TriggerEvent::Destroyed, 1, None, false, &world));
        assert!(template.evaluate(&mut state, TriggerEvent::Attacked, 1, None, false, &world));
        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));

        // Plain occurrences do not latch
        assert!(!state.tripped);
    }

    #[test]
    fn test_owner_required() {
        let mut world = World::default();
        world.owners.insert(10, 2);
        world.owners.insert(11, 3);

        let template = EventTemplate::new(TriggerEvent::PlayerEntered, 3, 0);
        let mut state = EventState::default();

        assert!(!template.evaluate(&mut state, TriggerEvent::PlayerEntered, 1, Some(10), false, &world));
        assert!(!template.evaluate(&mut state, TriggerEvent::PlayerEntered, 1, None, false, &world));
        assert!(template.evaluate(&mut state, TriggerEvent::PlayerEntered, 1, Some(11), false, &world));
        assert!(state.tripped);

        // Stays tripped until reset
        assert!(template.evaluate(&mut state, TriggerEvent::Destroyed, 1, None, false, &world));
        template.reset(&mut state);
        assert!(!state.tripped);
    }

    #[test]
    fn test_world_condition() {
        let mut world = World::default();
        let template = EventTemplate::new(TriggerEvent::Credits, 1, 5000);
        let mut state = EventState::default();

        assert!(!template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));

        world.conditions.insert(TriggerEvent::Credits);
        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));
        assert!(!state.tripped);
    }

    #[test]
    fn test_latching_condition() {
        let mut world = World::default();
        world.conditions.insert(TriggerEvent::BuildUnit);

        let template = EventTemplate::new(TriggerEvent::BuildUnit, 1, 4);
        let mut state = EventState::default();

        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));

        world.conditions.clear();
        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));
    }

    #[test]
    fn test_timer() {
        let world = World::default();
        let template = EventTemplate::new(TriggerEvent::Time, 1, 2);
        let mut state = EventState::default();
        template.reset(&mut state);

        assert_eq!(state.timer, 2 * TIME_UNIT);
        assert!(!template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));

        state.advance(2 * TIME_UNIT - 1);
        assert!(!template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));

        state.advance(5);
        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));
    }

    #[test]
    fn test_forced() {
        let world = World::default();
        let template = EventTemplate::none();
        let mut state = EventState::default();

        assert!(!template.evaluate(&mut state, TriggerEvent::Any, 1, None, false, &world));
        assert!(template.evaluate(&mut state, TriggerEvent::Any, 1, None, true, &world));
        assert!(state.tripped);
    }
}
