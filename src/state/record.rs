//! State records: the chronological metadata extracted from one document.
//!
//! A [`StateRecord`] can only be built through [`RecordDraft::finish`],
//! which enforces validity: a complete, real calendar date, a non-blank
//! title and at least one non-empty summary fragment. Anything else is
//! dropped before it can reach the publisher.

use crate::xml::{Document, Item, NodeRef};
use std::cmp::Ordering;
use std::fmt;

/// A validated calendar date. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    year: u16,
    month: u8,
    day: u8,
}

impl Date {
    /// A date if `year`/`month`/`day` name a real day in years 1 to 9999.
    pub fn new(year: u32, month: u32, day: u32) -> Option<Self> {
        if !(1..=9999).contains(&year) || !(1..=12).contains(&month) {
            return None;
        }
        if day < 1 || day > days_in_month(year, month) {
            return None;
        }
        Some(Self {
            year: year as u16,
            month: month as u8,
            day: day as u8,
        })
    }

    /// Parse three decimal strings (surrounding whitespace allowed).
    pub fn parse(year: &str, month: &str, day: &str) -> Option<Self> {
        let num = |s: &str| s.trim().parse::<u32>().ok();
        Self::new(num(year)?, num(month)?, num(day)?)
    }

    pub fn year(&self) -> u32 {
        u32::from(self.year)
    }

    pub fn month(&self) -> u32 {
        u32::from(self.month)
    }

    pub fn day(&self) -> u32 {
        u32::from(self.day)
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

fn is_leap(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// One piece of summary content, copied out of its source document.
///
/// Elements are copied with their subtree; text and attribute results
/// become a text node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(Document);

impl Fragment {
    pub fn from_item(doc: &Document, item: &Item) -> Self {
        match item {
            Item::Node(NodeRef::Node(id)) => Self(doc.extract(*id)),
            Item::Node(node @ NodeRef::Attribute(..)) => Self::text(&doc.ref_string_value(*node)),
            Item::Text(text) => Self::text(text),
        }
    }

    pub fn text(text: &str) -> Self {
        let mut doc = Document::new();
        doc.append_text(Document::ROOT, text);
        Self(doc)
    }

    /// The fragment's nodes hang off this document's document node.
    pub fn document(&self) -> &Document {
        &self.0
    }

    /// No element content and no non-whitespace text.
    pub fn is_empty(&self) -> bool {
        let has_element = self
            .0
            .descendants(Document::ROOT)
            .into_iter()
            .any(|id| self.0.element(id).is_some());
        !has_element && self.0.string_value(Document::ROOT).trim().is_empty()
    }
}

/// Lowercase tags, unique, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag after trimming and lowercasing it. Returns false for blank
    /// or already-present tags.
    pub fn insert(&mut self, raw: &str) -> bool {
        let tag = raw.trim().to_lowercase();
        if tag.is_empty() || self.0.contains(&tag) {
            return false;
        }
        self.0.push(tag);
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for Tags {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for tag in iter {
            tags.insert(tag);
        }
        tags
    }
}

/// A valid state record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    date: Date,
    title: String,
    summary: Vec<Fragment>,
    tags: Tags,
    bookmark: Option<String>,
}

impl StateRecord {
    pub fn date(&self) -> Date {
        self.date
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn summary(&self) -> &[Fragment] {
        &self.summary
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn bookmark(&self) -> Option<&str> {
        self.bookmark.as_deref()
    }

    /// Chronological comparison by date only.
    pub fn chronological(&self, other: &Self) -> Ordering {
        self.date.cmp(&other.date)
    }
}

/// Raw field values for one candidate record.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub title: Option<String>,
    pub summary: Vec<Fragment>,
    pub tags: Tags,
    pub bookmark: Option<String>,
}

impl RecordDraft {
    /// Validate and build the record, or `None` if any required field is
    /// missing or unusable.
    pub fn finish(self) -> Option<StateRecord> {
        let date = Date::parse(
            self.year.as_deref()?,
            self.month.as_deref()?,
            self.day.as_deref()?,
        )?;
        let title = self.title?.trim().to_string();
        if title.is_empty() {
            return None;
        }
        if self.summary.iter().all(Fragment::is_empty) {
            return None;
        }
        Some(StateRecord {
            date,
            title,
            summary: self.summary,
            tags: self.tags,
            bookmark: self.bookmark.filter(|b| !b.is_empty()),
        })
    }
}

/// A record together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The scanner's configured source label.
    pub source: String,
    /// Source path relative to the scanner root, `/`-separated.
    pub relpath: String,
    pub record: StateRecord,
}
