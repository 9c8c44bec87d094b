//! Participant roster
//!
//! Pure container for the channel's membership as reported by the server.
//! Updated by the session state machine, read through snapshots. The
//! local user never appears here; every mutation filters them out.

use chorus_common::protocol::Participant;

/// Partial update to a participant's flags
///
/// Flag-change messages carry one flag at a time; fields left `None`
/// keep their current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagPatch {
    pub muted: Option<bool>,
    pub deafened: Option<bool>,
    pub video_enabled: Option<bool>,
    pub screen_sharing: Option<bool>,
}

impl FlagPatch {
    pub fn muted(value: bool) -> Self {
        Self {
            muted: Some(value),
            ..Self::default()
        }
    }

    pub fn deafened(value: bool) -> Self {
        Self {
            deafened: Some(value),
            ..Self::default()
        }
    }

    pub fn video_enabled(value: bool) -> Self {
        Self {
            video_enabled: Some(value),
            ..Self::default()
        }
    }

    pub fn screen_sharing(value: bool) -> Self {
        Self {
            screen_sharing: Some(value),
            ..Self::default()
        }
    }
}

/// The channel membership as the server reports it
#[derive(Debug, Clone)]
pub struct ParticipantRoster {
    entries: Vec<Participant>,
    local_id: String,
}

impl ParticipantRoster {
    /// Create an empty roster that will never contain `local_id`
    pub fn new(local_id: String) -> Self {
        Self {
            entries: Vec::new(),
            local_id,
        }
    }

    /// Replace the whole roster with a server snapshot
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.entries = participants
            .into_iter()
            .filter(|p| p.id != self.local_id)
            .collect();
    }

    /// Add a participant (idempotent upsert)
    pub fn add(&mut self, participant: Participant) {
        if participant.id == self.local_id {
            return;
        }
        if let Some(existing) = self.entries.iter_mut().find(|p| p.id == participant.id) {
            *existing = participant;
        } else {
            self.entries.push(participant);
        }
    }

    /// Remove a participant (no-op when absent)
    pub fn remove(&mut self, id: &str) {
        self.entries.retain(|p| p.id != id);
    }

    /// Apply a flag change to a participant (no-op when absent)
    pub fn update_flags(&mut self, id: &str, patch: FlagPatch) {
        if let Some(p) = self.entries.iter_mut().find(|p| p.id == id) {
            if let Some(muted) = patch.muted {
                p.is_muted = muted;
            }
            if let Some(deafened) = patch.deafened {
                p.is_deafened = deafened;
            }
            if let Some(video) = patch.video_enabled {
                p.is_video_enabled = video;
            }
            if let Some(sharing) = patch.screen_sharing {
                p.is_screen_sharing = sharing;
            }
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
