//! `SQLite` schema definitions for panappticon.
//!
//! Each of the three event tables is created and prepared on its own, so a
//! failure on one leaves the others usable.

use crate::capture::CaptureKind;

/// SQL statement to create the keystrokes table.
pub const CREATE_KEYSTROKES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keystrokes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    keystroke TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    application TEXT NOT NULL
)
";

/// SQL statement to create the media history table.
pub const CREATE_MEDIA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS media_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    artist TEXT NOT NULL DEFAULT '',
    album TEXT NOT NULL DEFAULT '',
    source_app TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
)
";

/// SQL statement to create the screenshots table.
pub const CREATE_SCREENSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS screenshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    display_index INTEGER NOT NULL DEFAULT 0,
    active_app TEXT NOT NULL DEFAULT '',
    active_bundle TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
)
";

const INSERT_KEYSTROKE: &str =
    "INSERT INTO keystrokes (keystroke, timestamp, application) VALUES (?1, ?2, ?3)";

const INSERT_MEDIA: &str = "INSERT INTO media_history (title, artist, album, source_app, timestamp) \
     VALUES (?1, ?2, ?3, ?4, ?5)";

const INSERT_SCREENSHOT: &str = "INSERT INTO screenshots \
     (filename, display_index, active_app, active_bundle, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)";

/// One of the append-only event tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `keystrokes`
    Keystrokes,
    /// `media_history`
    Media,
    /// `screenshots`
    Screenshots,
}

impl Table {
    /// All tables, in creation order.
    pub const ALL: [Self; 3] = [Self::Keystrokes, Self::Media, Self::Screenshots];

    /// SQL table name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Keystrokes => "keystrokes",
            Self::Media => "media_history",
            Self::Screenshots => "screenshots",
        }
    }

    /// Position in [`Table::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Keystrokes => 0,
            Self::Media => 1,
            Self::Screenshots => 2,
        }
    }

    /// Create-if-absent statement.
    #[must_use]
    pub const fn create_sql(self) -> &'static str {
        match self {
            Self::Keystrokes => CREATE_KEYSTROKES_TABLE,
            Self::Media => CREATE_MEDIA_TABLE,
            Self::Screenshots => CREATE_SCREENSHOTS_TABLE,
        }
    }

    /// Parameterised insert statement, kept in the statement cache.
    #[must_use]
    pub const fn insert_sql(self) -> &'static str {
        match self {
            Self::Keystrokes => INSERT_KEYSTROKE,
            Self::Media => INSERT_MEDIA,
            Self::Screenshots => INSERT_SCREENSHOT,
        }
    }
}

impl From<CaptureKind> for Table {
    fn from(kind: CaptureKind) -> Self {
        match kind {
            CaptureKind::Keystrokes => Self::Keystrokes,
            CaptureKind::Media => Self::Media,
            CaptureKind::Screenshots => Self::Screenshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_for_capture_kind() {
        assert_eq!(Table::from(CaptureKind::Media).name(), "media_history");
        assert_eq!(Table::from(CaptureKind::Screenshots), Table::Screenshots);
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, table) in Table::ALL.iter().enumerate() {
            assert_eq!(table.index(), i);
        }
    }

    #[test]
    fn test_create_statements_name_their_table() {
        for table in Table::ALL {
            assert!(table.create_sql().contains(table.name()));
            assert!(table.create_sql().contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
            assert!(table.insert_sql().starts_with(&format!("INSERT INTO {}", table.name())));
        }
    }

    #[test]
    fn test_media_table_uses_single_timestamp() {
        assert!(CREATE_MEDIA_TABLE.contains("timestamp TEXT NOT NULL"));
        assert!(!CREATE_MEDIA_TABLE.contains("started_at"));
        assert!(!CREATE_MEDIA_TABLE.contains("ended_at"));
    }
}
