//! Presence directory
//!
//! Last-known presence per story, rebuilt wholesale from every presence sync.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use storyweave_core::{ParticipantId, PresenceRecord, StoryId};
use tracing::debug;

use crate::transport::PresenceState;

/// Records of one story keyed by participant
pub type StoryPresence = HashMap<ParticipantId, PresenceRecord>;

/// Owned copy of the whole directory. Mutating it never touches the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    stories: HashMap<StoryId, StoryPresence>,
}

impl PresenceSnapshot {
    /// Records of one story, if any are known
    #[must_use]
    pub fn story(&self, story_id: &StoryId) -> Option<&StoryPresence> {
        self.stories.get(story_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stories.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of decoding a raw presence sync
#[derive(Debug, Default)]
pub struct DecodedPresence {
    pub records: StoryPresence,
    /// Presence keys whose metas could not be decoded
    pub rejected: Vec<String>,
}

/// Decode a transport presence state into records.
///
/// A key can carry several metas (one per connection); the last decodable
/// meta wins. Metas without a `user_id` inherit the presence key.
#[must_use]
pub fn decode_presence_state(state: &PresenceState) -> DecodedPresence {
    let mut decoded = DecodedPresence::default();

    for (key, metas) in state {
        let mut latest = None;
        for meta in metas {
            let mut meta = meta.clone();
            if let Some(obj) = meta.as_object_mut() {
                obj.entry("user_id")
                    .or_insert_with(|| serde_json::Value::String(key.clone()));
            }
            if let Ok(record) = serde_json::from_value::<PresenceRecord>(meta) {
                latest = Some(record);
            }
        }

        match latest {
            Some(record) => {
                decoded.records.insert(record.user_id.clone(), record);
            }
            None => decoded.rejected.push(key.clone()),
        }
    }

    decoded
}

/// Per-registry presence map. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct PresenceDirectory {
    stories: Arc<RwLock<HashMap<StoryId, StoryPresence>>>,
}

impl PresenceDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about a story with a fresh sync
    pub fn replace_story(&self, story_id: &StoryId, records: StoryPresence) {
        let count = records.len();
        self.stories.write().insert(story_id.clone(), records);
        debug!(story_id = %story_id, participants = count, "Presence directory replaced");
    }

    /// Forget a story (on disconnect)
    pub fn remove_story(&self, story_id: &StoryId) {
        self.stories.write().remove(story_id);
    }

    pub fn clear(&self) {
        self.stories.write().clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            stories: self.stories.read().clone(),
        }
    }

    /// Records of one story, sorted by participant ID
    #[must_use]
    pub fn story_records(&self, story_id: &StoryId) -> Vec<PresenceRecord> {
        let mut records: Vec<_> = self
            .stories
            .read()
            .get(story_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    /// Latest record for a participant across all stories (by `last_seen`)
    #[must_use]
    pub fn get(&self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        self.stories
            .read()
            .values()
            .filter_map(|records| records.get(participant_id))
            .max_by_key(|record| record.last_seen.unwrap_or(i64::MIN))
            .cloned()
    }

    #[must_use]
    pub fn is_typing(
        &self,
        story_id: &StoryId,
        participant_id: &ParticipantId,
        chapter: Option<&str>,
    ) -> bool {
        self.stories
            .read()
            .get(story_id)
            .and_then(|records| records.get(participant_id))
            .is_some_and(|record| record.is_typing_in(chapter))
    }

    /// Participants typing in a story (optionally in one chapter), sorted
    #[must_use]
    pub fn typing_users(&self, story_id: &StoryId, chapter: Option<&str>) -> Vec<ParticipantId> {
        let mut users: Vec<_> = self
            .stories
            .read()
            .get(story_id)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.is_typing_in(chapter))
                    .map(|record| record.user_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }
}
