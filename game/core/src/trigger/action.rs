/// What a trigger does when it fires. Carried out by the world.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TriggerAction {
    None,
    Win,
    Lose,
    BeginProduction,
    CreateTeam,
    DestroyTeam,
    AllToHunt,
    Reinforcements,
    DropZoneFlare,
    FireSale,
    PlayMovie,
    TextTrigger,
    DestroyTrigger,
    Autocreate,
    AllowWin,
    RevealAll,
    RevealSome,
    RevealZone,
    PlaySound,
    PlayMusic,
    PlaySpeech,
    ForceTrigger,
    StartTimer,
    StopTimer,
    AddTimer,
    SubTimer,
    SetTimer,
    SetGlobal,
    ClearGlobal,
    BaseBuilding,
    CreepShadow,
    DestroyObject,
    OneSpecial,
    FullSpecial,
    PreferredTarget,
    LaunchNukes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ActionTemplate {
    pub action: TriggerAction,
    /// Action specific parameter: team, sound, global flag index...
    pub value: i32,
}

impl ActionTemplate {
    #[inline]
    pub fn new(action: TriggerAction, value: i32) -> ActionTemplate {
        ActionTemplate { action, value }
    }

    #[inline]
    pub fn none() -> ActionTemplate {
        ActionTemplate::new(TriggerAction::None, 0)
    }
}
