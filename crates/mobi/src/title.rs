//! Volume metadata and title derivation.
//!
//! A document's title is composed from the manga name, the normalized issue
//! number, an optional `(VV/NN)` volume marker and whatever is left of the
//! issue name once the redundant parts (volume and chapter markers, the manga
//! name, the number) are stripped from its front.

use regex::Regex;
use std::fmt::{self, Write};
use std::str::FromStr;
use std::sync::LazyLock;

static VOLUME_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^vol\.?\s*\d+").unwrap());
static CHAPTER_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^ch\.?\s*\d+(?:\.\d+)?").unwrap());
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)(?:\.(\d+))?(.*)$").unwrap());

/// Page progression of a manga.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    LeftToRight,
    RightToLeft,
}
impl Direction {
    /// Value of the spine's `page-progression-direction`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeftToRight => "ltr",
            Self::RightToLeft => "rtl",
        }
    }

    /// Kindle `primary-writing-mode`.
    pub fn writing_mode(&self) -> &'static str {
        match self {
            Self::LeftToRight => "horizontal-lr",
            Self::RightToLeft => "horizontal-rl",
        }
    }
}
impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ltr" | "left-to-right" => Ok(Self::LeftToRight),
            "rtl" | "right-to-left" => Ok(Self::RightToLeft),
            other => Err(format!("unknown reading direction: {other}")),
        }
    }
}

/// What the builder needs to know about an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueMeta {
    pub manga: String,
    pub name: String,
    pub number: Option<String>,
    pub language: String,
    pub author: String,
    pub publisher: String,
    pub direction: Direction,
    /// Stable identifier of the issue, usually its URL.
    pub identifier: String,
}

/// Metadata of a single output volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub title: String,
    pub language: String,
    pub author: String,
    pub publisher: String,
    pub direction: Direction,
    pub identifier: String,
}
impl VolumeInfo {
    /// Volume metadata for `issue`. Pass `Some((volume, total))` when the
    /// issue was split across several documents.
    pub fn new(issue: &IssueMeta, volume: Option<(usize, usize)>) -> Self {
        let identifier = match volume {
            Some((volume, _)) => format!("{}#{volume}", issue.identifier),
            None => issue.identifier.clone(),
        };
        Self {
            title: title(&issue.manga, &issue.name, issue.number.as_deref(), volume),
            language: issue.language.clone(),
            author: issue.author.clone(),
            publisher: issue.publisher.clone(),
            direction: issue.direction,
            identifier,
        }
    }

    /// File name the document is delivered under.
    pub fn file_name(&self) -> String {
        display_name(&self.title)
    }
}

/// Full document title.
///
/// ```
/// use kmanga_mobi::title;
/// assert_eq!(title("Manga", "Manga 1: The Beginning", Some("1"), None), "Manga 001: The Beginning");
/// assert_eq!(title("Manga", "Manga 1 Ch.1", Some("1"), Some((1, 1))), "Manga 001 (01/01)");
/// ```
pub fn title(manga: &str, issue: &str, number: Option<&str>, volume: Option<(usize, usize)>) -> String {
    let mut title = manga.trim().to_string();
    if let Some(number) = number.map(str::trim).filter(|n| !n.is_empty()) {
        title.push(' ');
        title.push_str(&format_number(number));
    }
    if let Some((volume, total)) = volume {
        // Infallible: writing to a String.
        let _ = write!(title, " ({volume:02}/{total:02})");
    }
    let subtitle = subtitle(issue, manga, number);
    if !subtitle.is_empty() {
        title.push_str(": ");
        title.push_str(&subtitle);
    }
    title
}

/// Zero-pads the integer part of an issue number to three digits, keeping
/// any fractional part and trailing suffix. Numbers that don't start with a
/// digit pass through unchanged.
pub fn format_number(number: &str) -> String {
    let Some(captures) = NUMBER.captures(number) else {
        return number.to_string();
    };
    let Ok(integer) = captures[1].parse::<u64>() else {
        return number.to_string();
    };
    let suffix = &captures[3];
    match captures.get(2) {
        Some(fraction) => format!("{integer:03}.{}{suffix}", fraction.as_str()),
        None => format!("{integer:03}{suffix}"),
    }
}

/// What remains of an issue name after repeatedly stripping leading volume
/// and chapter markers, the manga name, the issue number and `:`/`-`
/// separators.
pub fn subtitle(issue: &str, manga: &str, number: Option<&str>) -> String {
    let mut rest = issue.trim().to_string();
    loop {
        let before = rest.clone();
        rest = strip_marker(&VOLUME_MARKER, &rest);
        rest = strip_marker(&CHAPTER_MARKER, &rest);
        rest = strip_word(&rest, manga.trim());
        if let Some(number) = number {
            rest = strip_word(&rest, number.trim());
        }
        rest = rest.trim_start_matches([':', '-']).trim().to_string();
        if rest == before {
            return rest;
        }
    }
}

fn strip_marker(marker: &Regex, s: &str) -> String {
    match marker.find(s) {
        Some(m) => s[m.end()..].trim().to_string(),
        None => s.to_string(),
    }
}

/// Case-insensitively strips `word` from the front of `s`, but only when it
/// isn't immediately followed by another alphanumeric character.
fn strip_word(s: &str, word: &str) -> String {
    if word.is_empty() || !s.is_char_boundary(word.len().min(s.len())) || s.len() < word.len() {
        return s.to_string();
    }
    let (head, tail) = s.split_at(word.len());
    let boundary = tail.chars().next().is_none_or(|c| !c.is_alphanumeric());
    match boundary && head.to_lowercase() == word.to_lowercase() {
        true => tail.trim().to_string(),
        false => s.to_string(),
    }
}

/// File-system friendly name for a title: whitespace becomes `_` and path
/// separators become `-`.
pub fn display_name(title: &str) -> String {
    let name: String = title
        .chars()
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '/' | '\\' => '-',
            c => c,
        })
        .collect();
    format!("{name}.mobi")
}
