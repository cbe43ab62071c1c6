//! Keyboard shortcuts: parsing, display and matching.
//!
//! Shortcuts are written as `ctrl+opt+p` in the configuration file and shown
//! as `⌃⌥P`. Key identities are macOS virtual key codes so that matching is
//! independent of the active keyboard layout.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Serialize, Serializer};

/// A set of held modifier keys.
///
/// Only [`Modifiers::RELEVANT`] take part in shortcut matching; the remaining
/// bits mirror OS flags that an event may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifiers(u8);

impl Modifiers {
    /// No modifiers.
    pub const NONE: Self = Self(0);
    /// Control.
    pub const CTRL: Self = Self(1);
    /// Option (Alt).
    pub const OPT: Self = Self(1 << 1);
    /// Shift.
    pub const SHIFT: Self = Self(1 << 2);
    /// Command.
    pub const CMD: Self = Self(1 << 3);
    /// Caps Lock is engaged.
    pub const CAPS_LOCK: Self = Self(1 << 4);
    /// The Fn key is held.
    pub const FUNCTION: Self = Self(1 << 5);
    /// The key is on the numeric pad.
    pub const NUMERIC_PAD: Self = Self(1 << 6);
    /// The modifiers that shortcuts are built from.
    pub const RELEVANT: Self = Self(0b1111);

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every modifier in `other` is held.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether nothing is held.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The held modifiers with OS-only bits removed.
    #[must_use]
    pub const fn relevant(self) -> Self {
        Self(self.0 & Self::RELEVANT.0)
    }
}

impl BitOr for Modifiers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Modifiers {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Modifiers {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Display order and glyph for each shortcut modifier.
const MODIFIER_GLYPHS: [(Modifiers, char); 4] = [
    (Modifiers::CTRL, '⌃'),
    (Modifiers::OPT, '⌥'),
    (Modifiers::SHIFT, '⇧'),
    (Modifiers::CMD, '⌘'),
];

/// Configuration-file spelling of each modifier, in display order.
const MODIFIER_NAMES: [(Modifiers, &str); 4] = [
    (Modifiers::CTRL, "ctrl"),
    (Modifiers::OPT, "opt"),
    (Modifiers::SHIFT, "shift"),
    (Modifiers::CMD, "cmd"),
];

fn modifier_alias(token: &str) -> Option<Modifiers> {
    match token {
        "ctrl" | "control" | "c" => Some(Modifiers::CTRL),
        "opt" | "option" | "alt" | "meta" | "m" => Some(Modifiers::OPT),
        "shift" | "s" => Some(Modifiers::SHIFT),
        "cmd" | "command" | "super" => Some(Modifiers::CMD),
        _ => None,
    }
}

/// A physical key, identified by its macOS virtual key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub u16);

/// Keys that may appear in a shortcut: (code, canonical name, display glyph).
const KEYS: &[(u16, &str, &str)] = &[
    (0, "a", "A"),
    (11, "b", "B"),
    (8, "c", "C"),
    (2, "d", "D"),
    (14, "e", "E"),
    (3, "f", "F"),
    (5, "g", "G"),
    (4, "h", "H"),
    (34, "i", "I"),
    (38, "j", "J"),
    (40, "k", "K"),
    (37, "l", "L"),
    (46, "m", "M"),
    (45, "n", "N"),
    (31, "o", "O"),
    (35, "p", "P"),
    (12, "q", "Q"),
    (15, "r", "R"),
    (1, "s", "S"),
    (17, "t", "T"),
    (32, "u", "U"),
    (9, "v", "V"),
    (13, "w", "W"),
    (7, "x", "X"),
    (16, "y", "Y"),
    (6, "z", "Z"),
    (29, "0", "0"),
    (18, "1", "1"),
    (19, "2", "2"),
    (20, "3", "3"),
    (21, "4", "4"),
    (23, "5", "5"),
    (22, "6", "6"),
    (26, "7", "7"),
    (28, "8", "8"),
    (25, "9", "9"),
    (49, "space", "Space"),
    (36, "return", "↩"),
    (48, "tab", "⇥"),
    (53, "escape", "⎋"),
    (51, "delete", "⌫"),
    (123, "left", "←"),
    (124, "right", "→"),
    (126, "up", "↑"),
    (125, "down", "↓"),
    (122, "f1", "F1"),
    (120, "f2", "F2"),
    (99, "f3", "F3"),
    (118, "f4", "F4"),
    (96, "f5", "F5"),
    (97, "f6", "F6"),
    (98, "f7", "F7"),
    (100, "f8", "F8"),
    (101, "f9", "F9"),
    (109, "f10", "F10"),
    (103, "f11", "F11"),
    (111, "f12", "F12"),
];

impl Key {
    /// Look a key up by its configuration-file name (lowercase).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let canonical = match name {
            "enter" => "return",
            "esc" => "escape",
            "backspace" => "delete",
            other => other,
        };
        KEYS.iter()
            .find(|(_, n, _)| *n == canonical)
            .map(|(code, _, _)| Self(*code))
    }

    /// Look a key up by its display glyph, ignoring ASCII case.
    #[must_use]
    pub fn from_glyph(glyph: &str) -> Option<Self> {
        KEYS.iter()
            .find(|(_, _, g)| g.eq_ignore_ascii_case(glyph))
            .map(|(code, _, _)| Self(*code))
    }

    /// Canonical configuration-file name, if this key can be used in shortcuts.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        KEYS.iter()
            .find(|(code, _, _)| *code == self.0)
            .map(|(_, name, _)| *name)
    }

    /// Display glyph, if this key can be used in shortcuts.
    #[must_use]
    pub fn glyph(self) -> Option<&'static str> {
        KEYS.iter()
            .find(|(code, _, _)| *code == self.0)
            .map(|(_, _, glyph)| *glyph)
    }
}

/// A single key press as delivered by the OS key observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Virtual key code.
    pub code: u16,
    /// Modifiers held at the time of the press, including OS-only bits.
    pub modifiers: Modifiers,
    /// Text the press produced under the current layout, if any.
    pub text: Option<String>,
}

impl KeyEvent {
    /// Create a key event.
    #[must_use]
    pub fn new(code: u16, modifiers: Modifiers, text: Option<&str>) -> Self {
        Self {
            code,
            modifiers,
            text: text.map(str::to_string),
        }
    }
}

/// A key plus at least one modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyboardShortcut {
    /// The non-modifier key.
    pub key: Key,
    /// Required modifiers, a subset of [`Modifiers::RELEVANT`].
    pub modifiers: Modifiers,
}

impl KeyboardShortcut {
    /// The built-in toggle shortcut, `ctrl+opt+p`.
    pub const DEFAULT_TOGGLE: Self = Self {
        key: Key(35),
        modifiers: Modifiers(Modifiers::CTRL.0 | Modifiers::OPT.0),
    };

    /// Parse a shortcut.
    ///
    /// Accepts the configuration syntax (`ctrl+opt+p`, case-insensitive, see
    /// the alias list in the config template) and the glyph form produced
    /// by [`KeyboardShortcut::format`]. Returns `None` without at least one
    /// modifier, with more than one key token, or with an unknown key.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.starts_with(|c: char| MODIFIER_GLYPHS.iter().any(|(_, g)| *g == c)) {
            return Self::parse_glyphs(text);
        }

        let lowered = text.to_lowercase();
        let mut modifiers = Modifiers::NONE;
        let mut key_token: Option<&str> = None;
        for token in lowered.split('+').map(str::trim) {
            if let Some(modifier) = modifier_alias(token) {
                modifiers |= modifier;
            } else if key_token.replace(token).is_some() {
                return None;
            }
        }

        let key = Key::from_name(key_token?)?;
        Self::build(key, modifiers)
    }

    fn parse_glyphs(text: &str) -> Option<Self> {
        let mut modifiers = Modifiers::NONE;
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            let Some((modifier, _)) = MODIFIER_GLYPHS.iter().find(|(_, g)| *g == c) else {
                break;
            };
            modifiers |= *modifier;
            rest = &rest[c.len_utf8()..];
        }
        let key = Key::from_glyph(rest)?;
        Self::build(key, modifiers)
    }

    fn build(key: Key, modifiers: Modifiers) -> Option<Self> {
        if modifiers.is_empty() {
            return None;
        }
        Some(Self { key, modifiers })
    }

    /// Glyph rendering, modifiers in the order ⌃ ⌥ ⇧ ⌘ followed by the key.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out: String = MODIFIER_GLYPHS
            .iter()
            .filter(|(m, _)| self.modifiers.contains(*m))
            .map(|(_, g)| *g)
            .collect();
        if let Some(glyph) = self.key.glyph() {
            out.push_str(glyph);
        }
        out
    }

    /// Configuration-file rendering, e.g. `ctrl+opt+p`.
    #[must_use]
    pub fn to_config_string(&self) -> String {
        let mut parts: Vec<&str> = MODIFIER_NAMES
            .iter()
            .filter(|(m, _)| self.modifiers.contains(*m))
            .map(|(_, n)| *n)
            .collect();
        parts.push(self.key.name().unwrap_or("?"));
        parts.join("+")
    }

    /// Whether `event` triggers this shortcut.
    ///
    /// The key must be equal and the event's relevant modifiers must equal
    /// the shortcut's modifiers exactly; an extra held modifier is a miss.
    #[must_use]
    pub fn matches(&self, event: &KeyEvent) -> bool {
        event.code == self.key.0 && event.modifiers.relevant() == self.modifiers
    }
}

impl Default for KeyboardShortcut {
    fn default() -> Self {
        Self::DEFAULT_TOGGLE
    }
}

impl fmt::Display for KeyboardShortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl Serialize for KeyboardShortcut {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_config_string())
    }
}
