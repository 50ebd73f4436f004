//! Room membership for the broker

use std::collections::HashSet;
use std::time::Instant;

/// Minimum accepted length of a client-supplied room id.
pub const MIN_ROOM_ID_LEN: usize = 4;

pub fn valid_room_id(room_id: &str) -> bool {
    room_id.chars().count() >= MIN_ROOM_ID_LEN
}

/// A named set of sessions sharing one call
#[derive(Debug)]
pub struct Room {
    pub room_id: String,
    members: HashSet<String>,
    pub created_at: Instant,
}

impl Room {
    pub fn new(room_id: String) -> Self {
        Self {
            room_id,
            members: HashSet::new(),
            created_at: Instant::now(),
        }
    }

    /// Returns false when the session was already a member.
    pub fn add_member(&mut self, session_id: String) -> bool {
        self.members.insert(session_id)
    }

    pub fn remove_member(&mut self, session_id: &str) -> bool {
        self.members.remove(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.members.contains(session_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(!valid_room_id(""));
        assert!(!valid_room_id("abc"));
        assert!(valid_room_id("abcd"));
        assert!(valid_room_id("r1xxxxxxxxx"));
    }

    #[test]
    fn test_membership_is_a_set() {
        let mut room = Room::new("room-1".into());
        assert!(room.is_empty());

        assert!(room.add_member("A1".into()));
        assert!(!room.add_member("A1".into()));
        assert!(room.add_member("B1".into()));
        assert_eq!(room.member_count(), 2);

        assert!(room.remove_member("A1"));
        assert!(!room.remove_member("A1"));
        assert!(room.contains("B1"));
        assert!(!room.contains("A1"));

        room.remove_member("B1");
        assert!(room.is_empty());
    }
}
