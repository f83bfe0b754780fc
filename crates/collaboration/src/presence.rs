/// Membership and presence tracking for collaborative editing
/// Shows who is in a workspace, where their cursor is and what they have selected
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::transform::{self, Edit};
use crate::{DocumentId, UserId};

/// Role a user holds inside a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Member,
    Viewer,
}

/// User information supplied when joining
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            role: Role::Member,
            email: None,
            avatar_url: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Color assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: UserId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Cursor location inside a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub document_id: DocumentId,

    /// Character offset
    pub offset: usize,
}

/// Selected character range `[start, end)` in the cursor's document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A user's membership and presence state in one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user: User,
    pub color: UserColor,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

impl Member {
    pub fn new(user: User) -> Self {
        let now = chrono::Utc::now();
        Self {
            color: UserColor::from_user_id(user.id),
            user,
            cursor: None,
            selection: None,
            joined_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> UserId {
        self.user.id
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now();
    }

    /// No activity for longer than `timeout`
    pub fn is_idle(&self, timeout: chrono::Duration) -> bool {
        chrono::Utc::now() - self.last_activity > timeout
    }

    /// Keep the cursor and selection anchored to the same text after `edits`
    pub fn follow_edits(&mut self, document_id: &DocumentId, edits: &[Edit]) {
        let Some(cursor) = self.cursor.as_mut() else {
            return;
        };
        if &cursor.document_id != document_id {
            return;
        }

        cursor.offset = transform::map_position(cursor.offset, edits);
        if let Some(selection) = self.selection.as_mut() {
            *selection = Selection::new(
                transform::map_position(selection.start, edits),
                transform::map_position(selection.end, edits),
            );
        }
    }
}

/// Presence manager tracks all members of a workspace
#[derive(Debug, Clone, Default)]
pub struct PresenceManager {
    members: HashMap<UserId, Member>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Add or replace a member, returning the previous entry on rejoin
    pub fn insert(&mut self, member: Member) -> Option<Member> {
        self.members.insert(member.id(), member)
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<Member> {
        self.members.remove(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn get_mut(&mut self, user_id: &UserId) -> Option<&mut Member> {
        self.members.get_mut(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members sorted by join time
    pub fn members(&self) -> Vec<&Member> {
        let mut members: Vec<_> = self.members.values().collect();
        members.sort_by_key(|m| (m.joined_at, m.id()));
        members
    }

    /// Overwrite cursor and selection (last write wins)
    pub fn update_cursor(
        &mut self,
        user_id: &UserId,
        cursor: CursorPosition,
        selection: Option<Selection>,
    ) -> Option<&Member> {
        let member = self.members.get_mut(user_id)?;
        member.cursor = Some(cursor);
        member.selection = selection;
        member.touch();
        Some(member)
    }

    /// Shift every cursor on `document_id` through applied edits
    pub fn follow_edits(&mut self, document_id: &DocumentId, edits: &[Edit]) {
        for member in self.members.values_mut() {
            member.follow_edits(document_id, edits);
        }
    }

    pub fn idle_members(&self, timeout: chrono::Duration) -> Vec<UserId> {
        self.members
            .values()
            .filter(|m| m.is_idle(timeout))
            .map(|m| m.id())
            .collect()
    }
}
