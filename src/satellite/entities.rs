//! Discovered-entity bookkeeping
//!
//! Satellites announce their controllable entities during discovery. The
//! bridge cares about three capabilities: the media player (playback and
//! volume), the mute switch, and any numeric control the firmware exposes.
//! Keys are opaque `fixed32` values that are only stable for the lifetime of
//! one connection, so the table is rebuilt from scratch on every reconnect.

/// One discovered entity, addressable by its connection-scoped key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHandle {
    pub key: u32,
    pub object_id: String,
    pub name: String,
}

/// Capability-to-handle mapping built during entity discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTable {
    media_player: Option<EntityHandle>,
    mute_switch: Option<EntityHandle>,
    volume_number: Option<EntityHandle>,
    complete: bool,
}

impl EntityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a media-player announcement. The first one wins; satellites
    /// expose at most one in practice.
    pub fn record_media_player(&mut self, handle: EntityHandle) {
        if self.media_player.is_none() {
            self.media_player = Some(handle);
        }
    }

    /// Record a switch announcement. A switch whose id or name mentions
    /// "mute" claims the slot over whatever was recorded before it, so
    /// firmwares that also expose unrelated switches still bind correctly.
    pub fn record_switch(&mut self, handle: EntityHandle) {
        let claims = looks_like_mute(&handle);
        match &self.mute_switch {
            None => self.mute_switch = Some(handle),
            Some(current) if claims && !looks_like_mute(current) => {
                self.mute_switch = Some(handle);
            }
            Some(_) => {}
        }
    }

    /// Record a numeric-control announcement. The first one wins.
    pub fn record_number(&mut self, handle: EntityHandle) {
        if self.volume_number.is_none() {
            self.volume_number = Some(handle);
        }
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Whether the entities-done signal has arrived.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub const fn media_player(&self) -> Option<&EntityHandle> {
        self.media_player.as_ref()
    }

    #[must_use]
    pub const fn mute_switch(&self) -> Option<&EntityHandle> {
        self.mute_switch.as_ref()
    }

    #[must_use]
    pub const fn volume_number(&self) -> Option<&EntityHandle> {
        self.volume_number.as_ref()
    }

    /// Drop all handles. Called when the connection they were scoped to goes
    /// away.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn looks_like_mute(handle: &EntityHandle) -> bool {
    handle.object_id.to_ascii_lowercase().contains("mute")
        || handle.name.to_ascii_lowercase().contains("mute")
}

/// Deduplicates volume/mute state updates.
///
/// Satellites re-send identical state frames liberally (on subscribe, on
/// ping, after commands). Only a change beyond `tolerance` (volume) or any
/// flip (mute) is worth re-emitting upstream.
#[derive(Debug)]
pub struct LevelTracker {
    tolerance: f32,
    volume: Option<f32>,
    muted: Option<bool>,
}

impl LevelTracker {
    #[must_use]
    pub const fn new(tolerance: f32) -> Self {
        Self {
            tolerance,
            volume: None,
            muted: None,
        }
    }

    /// Feed an observed volume. Returns the value when it is news.
    pub fn observe_volume(&mut self, volume: f32) -> Option<f32> {
        let changed = match self.volume {
            None => true,
            Some(previous) => (volume - previous).abs() > self.tolerance,
        };
        if changed {
            self.volume = Some(volume);
            Some(volume)
        } else {
            None
        }
    }

    /// Feed an observed mute state. Returns the value when it flipped.
    pub fn observe_mute(&mut self, muted: bool) -> Option<bool> {
        if self.muted == Some(muted) {
            None
        } else {
            self.muted = Some(muted);
            Some(muted)
        }
    }

    pub fn reset(&mut self) {
        self.volume = None;
        self.muted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(key: u32, object_id: &str, name: &str) -> EntityHandle {
        EntityHandle {
            key,
            object_id: object_id.to_string(),
            name: name.to_string(),
        }
    }

    // -- table binding --------------------------------------------------------

    #[test]
    fn first_media_player_wins() {
        let mut table = EntityTable::new();
        table.record_media_player(handle(1, "speaker", "Speaker"));
        table.record_media_player(handle(2, "aux", "Aux"));
        assert_eq!(table.media_player().map(|h| h.key), Some(1));
    }

    #[test]
    fn mute_named_switch_displaces_generic_switch() {
        let mut table = EntityTable::new();
        table.record_switch(handle(10, "use_wake_word", "Use Wake Word"));
        assert_eq!(table.mute_switch().map(|h| h.key), Some(10));

        table.record_switch(handle(11, "mute", "Mute"));
        assert_eq!(table.mute_switch().map(|h| h.key), Some(11));

        // A later generic switch does not displace the bound mute switch
        table.record_switch(handle(12, "led", "LED"));
        assert_eq!(table.mute_switch().map(|h| h.key), Some(11));
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut table = EntityTable::new();
        table.record_media_player(handle(1, "speaker", "Speaker"));
        table.record_number(handle(2, "volume", "Volume"));
        table.mark_complete();

        table.clear();
        assert!(table.media_player().is_none());
        assert!(table.volume_number().is_none());
        assert!(!table.is_complete());
    }

    // -- level tracking -------------------------------------------------------

    #[test]
    fn first_observation_is_always_news() {
        let mut levels = LevelTracker::new(0.005);
        assert_eq!(levels.observe_volume(0.5), Some(0.5));
        assert_eq!(levels.observe_mute(false), Some(false));
    }

    #[test]
    fn volume_within_tolerance_is_suppressed() {
        let mut levels = LevelTracker::new(0.005);
        levels.observe_volume(0.5);
        assert_eq!(levels.observe_volume(0.503), None);
        assert_eq!(levels.observe_volume(0.51), Some(0.51));
    }

    #[test]
    fn suppressed_updates_do_not_drift_the_baseline() {
        let mut levels = LevelTracker::new(0.005);
        levels.observe_volume(0.5);
        // Many tiny steps in one direction; each is within tolerance of the
        // last emitted value, so none fires until the sum crosses it.
        assert_eq!(levels.observe_volume(0.504), None);
        assert_eq!(levels.observe_volume(0.5055), Some(0.5055));
    }

    #[test]
    fn mute_only_fires_on_flip() {
        let mut levels = LevelTracker::new(0.005);
        levels.observe_mute(true);
        assert_eq!(levels.observe_mute(true), None);
        assert_eq!(levels.observe_mute(false), Some(false));
    }

    #[test]
    fn reset_forgets_previous_values() {
        let mut levels = LevelTracker::new(0.005);
        levels.observe_volume(0.5);
        levels.reset();
        assert_eq!(levels.observe_volume(0.5), Some(0.5));
    }
}
