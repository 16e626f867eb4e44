use serde::{Deserialize, Serialize};

use super::id::ParticipantId;

/// Coarse availability of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Idle,
}

/// One participant's live status within one story channel.
///
/// This is also the meta payload tracked on the transport, so the serde
/// shape doubles as the wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default)]
    pub is_typing: bool,
    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_section: Option<String>,
}

impl PresenceRecord {
    #[must_use]
    pub fn new(user_id: ParticipantId) -> Self {
        Self {
            user_id,
            display_name: None,
            status: PresenceStatus::Online,
            is_typing: false,
            last_seen: None,
            current_chapter: None,
            current_section: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_typing(mut self, chapter: Option<&str>) -> Self {
        self.is_typing = true;
        self.current_chapter = chapter.map(str::to_string);
        self
    }

    /// Typing, and (when a chapter filter is given) typing in that chapter
    #[must_use]
    pub fn is_typing_in(&self, chapter: Option<&str>) -> bool {
        if !self.is_typing {
            return false;
        }
        match chapter {
            Some(chapter) => self.current_chapter.as_deref() == Some(chapter),
            None => true,
        }
    }

    /// Overlay the fields set in `update`, leaving the rest untouched
    pub fn apply(&mut self, update: &PresenceUpdate) {
        if let Some(name) = &update.display_name {
            self.display_name = Some(name.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(is_typing) = update.is_typing {
            self.is_typing = is_typing;
        }
        if let Some(chapter) = &update.current_chapter {
            self.current_chapter = Some(chapter.clone());
        }
        if let Some(section) = &update.current_section {
            self.current_section = Some(section.clone());
        }
    }
}

/// Partial presence sent by the UI; unset fields keep their previous value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub status: Option<PresenceStatus>,
    pub is_typing: Option<bool>,
    pub current_chapter: Option<String>,
    pub current_section: Option<String>,
}

impl PresenceUpdate {
    #[must_use]
    pub fn status(status: PresenceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn typing(is_typing: bool, chapter: Option<&str>, section: Option<&str>) -> Self {
        Self {
            is_typing: Some(is_typing),
            current_chapter: chapter.map(str::to_string),
            current_section: section.map(str::to_string),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_filter() {
        let record = PresenceRecord::new(ParticipantId::from("user1")).with_typing(Some("c1"));

        assert!(record.is_typing_in(None));
        assert!(record.is_typing_in(Some("c1")));
        assert!(!record.is_typing_in(Some("c2")));

        let idle = PresenceRecord::new(ParticipantId::from("user2"));
        assert!(!idle.is_typing_in(None));
    }

    #[test]
    fn test_apply_partial_update() {
        let mut record = PresenceRecord::new(ParticipantId::from("user1")).with_display_name("Ada");
        record.current_chapter = Some("c1".to_string());

        record.apply(&PresenceUpdate::status(PresenceStatus::Away));
        assert_eq!(record.status, PresenceStatus::Away);
        assert_eq!(record.display_name.as_deref(), Some("Ada"));
        assert_eq!(record.current_chapter.as_deref(), Some("c1"));

        record.apply(&PresenceUpdate::typing(true, Some("c2"), Some("s9")));
        assert!(record.is_typing);
        assert_eq!(record.current_chapter.as_deref(), Some("c2"));
        assert_eq!(record.current_section.as_deref(), Some("s9"));
    }

    #[test]
    fn test_minimal_meta_deserializes_with_defaults() {
        let record: PresenceRecord =
            serde_json::from_value(serde_json::json!({ "user_id": "user1" })).unwrap();

        assert_eq!(record.status, PresenceStatus::Online);
        assert!(!record.is_typing);
        assert!(record.last_seen.is_none());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&PresenceStatus::Away).unwrap();
        assert_eq!(json, "\"away\"");
    }
}
