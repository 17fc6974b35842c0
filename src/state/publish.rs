//! Paginated state listings.
//!
//! A publish run turns every [`Entry`] gathered during a build into three
//! kinds of file inside the state directory:
//!
//! | File | Content |
//! |---|---|
//! | `<recent>.xml`, `<recent>_1.xml`, ... | every entry, newest first |
//! | `<tag>.xml`, `<tag>_1.xml`, ... | entries carrying `<tag>`, newest first |
//! | `<tags>.xml` | one `tag` element per tag: name, first page, entry count |
//!
//! Pages link to their neighbours through `prev` and `next` attributes on the
//! root element; per-tag pages also carry the tag in a `tag` attribute:
//!
//! ```xml
//! <state xmlns="urn:xmlforge:state" next="recent_1.xml">
//!   <entry source="content" relpath="blog/pi.xml" bookmark="pi">
//!     <modified year="2020" month="3" day="14"/>
//!     <title>Pi day</title>
//!     <tag name="math"/>
//!     <summary>...copied verbatim...</summary>
//!   </entry>
//! </state>
//! ```
//!
//! Tags that would collide with the stream, the index or another tag's page
//! file names (`x_1` next to `x`), or that are not usable as file names at all, are left out of the per-tag pages and the
//! index (entries still list them).
//!
//! Files are only written when their content changes, ignoring line-ending
//! differences, so unchanged listings keep their modification times.

use super::record::Entry;
use crate::config::{StateOutputConfig, is_file_safe};
use crate::xml::{Document, NodeId, QName};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Namespace of every element in a state page.
pub const STATE_NS: &str = "urn:xmlforge:state";

/// Smallest page size the publisher accepts.
pub const MIN_PAGINATION: usize = 2;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Files touched by one publish run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub written: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

impl PublishReport {
    pub fn total(&self) -> usize {
        self.written.len() + self.unchanged.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePublisher {
    dir: PathBuf,
    pagination: usize,
    recent: String,
    tags: String,
}

impl StatePublisher {
    pub fn new(config: &StateOutputConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            pagination: config.pagination.max(MIN_PAGINATION),
            recent: config.recent.clone(),
            tags: config.tags.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pagination(&self) -> usize {
        self.pagination
    }

    /// Sort, group and write every listing for `entries`.
    pub fn publish(&self, entries: &[Entry]) -> Result<PublishReport, PublishError> {
        let mut sorted: Vec<&Entry> = entries.iter().collect();
        sorted.sort_by(|a, b| b.record.chronological(&a.record));

        let all_tags: BTreeSet<&str> = sorted
            .iter()
            .copied()
            .flat_map(|entry| entry.record.tags().iter())
            .collect();
        let mut by_tag: BTreeMap<&str, Vec<&Entry>> = BTreeMap::new();
        let mut excluded = BTreeSet::new();
        for &entry in &sorted {
            for tag in entry.record.tags().iter() {
                if self.is_reserved(tag, &all_tags) {
                    if excluded.insert(tag) {
                        tracing::warn!(tag, relpath = %entry.relpath, "tag excluded from state pages");
                    }
                    continue;
                }
                by_tag.entry(tag).or_default().push(entry);
            }
        }

        let mut report = PublishReport::default();
        self.write_series(&self.recent, None, &sorted, &mut report)?;
        for (tag, tagged) in &by_tag {
            self.write_series(tag, Some(tag), tagged, &mut report)?;
        }
        let index = self.tag_index(&by_tag);
        self.write_if_changed(&format!("{}.xml", self.tags), &index, &mut report)?;

        tracing::info!(
            dir = %self.dir.display(),
            entries = entries.len(),
            tags = by_tag.len(),
            written = report.written.len(),
            unchanged = report.unchanged.len(),
            "published state"
        );
        Ok(report)
    }

    /// A tag is reserved when its pages could share a file name with the
    /// stream, the index or another tag's pages. `x_1` loses to `x`.
    fn is_reserved(&self, tag: &str, all_tags: &BTreeSet<&str>) -> bool {
        tag == self.recent
            || tag == self.tags
            || !is_file_safe(tag)
            || is_later_page(tag, &self.recent)
            || is_later_page(&self.recent, tag)
            || is_later_page(&self.tags, tag)
            || all_tags.iter().any(|&other| is_later_page(tag, other))
    }

    fn write_series(
        &self,
        base: &str,
        tag: Option<&str>,
        entries: &[&Entry],
        report: &mut PublishReport,
    ) -> Result<(), PublishError> {
        let pages: Vec<&[&Entry]> = entries.chunks(self.pagination).collect();
        for (k, page) in pages.iter().enumerate() {
            let mut doc = Document::new();
            let root = doc.append_element(Document::ROOT, state_name("state"));
            if k > 0 {
                doc.set_attribute(root, QName::local("prev"), page_name(base, k - 1));
            }
            if k + 1 < pages.len() {
                doc.set_attribute(root, QName::local("next"), page_name(base, k + 1));
            }
            if let Some(tag) = tag {
                doc.set_attribute(root, QName::local("tag"), tag);
            }
            for entry in page.iter() {
                append_entry(&mut doc, root, entry);
            }
            self.write_if_changed(&page_name(base, k), &doc.to_xml_document(true), report)?;
        }
        Ok(())
    }

    fn tag_index(&self, by_tag: &BTreeMap<&str, Vec<&Entry>>) -> String {
        let mut doc = Document::new();
        let root = doc.append_element(Document::ROOT, state_name("tags"));
        for (tag, entries) in by_tag {
            let el = doc.append_element(root, state_name("tag"));
            doc.set_attribute(el, QName::local("name"), *tag);
            doc.set_attribute(el, QName::local("file"), page_name(tag, 0));
            doc.set_attribute(el, QName::local("count"), entries.len().to_string());
        }
        doc.to_xml_document(true)
    }

    fn write_if_changed(
        &self,
        name: &str,
        content: &str,
        report: &mut PublishReport,
    ) -> Result<(), PublishError> {
        let path = self.dir.join(name);
        if let Ok(existing) = fs::read(&path)
            && normalize_newlines(&String::from_utf8_lossy(&existing)) == normalize_newlines(content)
        {
            tracing::debug!(path = %path.display(), "state page unchanged");
            report.unchanged.push(path);
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|source| PublishError::Io {
            path: self.dir.clone(),
            source,
        })?;
        if let Err(source) = fs::write(&path, content) {
            return Err(PublishError::Io { path, source });
        }
        report.written.push(path);
        Ok(())
    }
}

/// File name of page `k` of the series `base`.
pub fn page_name(base: &str, k: usize) -> String {
    if k == 0 {
        format!("{base}.xml")
    } else {
        format!("{base}_{k}.xml")
    }
}

/// Whether `name` has the shape of a page after the first in `base`'s series.
fn is_later_page(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
}

fn state_name(local: &str) -> QName {
    QName::with_ns(STATE_NS, None, local)
}

fn append_entry(doc: &mut Document, parent: NodeId, entry: &Entry) {
    let record = &entry.record;
    let el = doc.append_element(parent, state_name("entry"));
    doc.set_attribute(el, QName::local("source"), entry.source.as_str());
    doc.set_attribute(el, QName::local("relpath"), entry.relpath.as_str());
    if let Some(bookmark) = record.bookmark() {
        doc.set_attribute(el, QName::local("bookmark"), bookmark);
    }

    let date = record.date();
    let modified = doc.append_element(el, state_name("modified"));
    doc.set_attribute(modified, QName::local("year"), date.year().to_string());
    doc.set_attribute(modified, QName::local("month"), date.month().to_string());
    doc.set_attribute(modified, QName::local("day"), date.day().to_string());

    let title = doc.append_element(el, state_name("title"));
    doc.append_text(title, record.title());

    for tag in record.tags().iter() {
        let t = doc.append_element(el, state_name("tag"));
        doc.set_attribute(t, QName::local("name"), tag);
    }

    for fragment in record.summary() {
        let summary = doc.append_element(el, state_name("summary"));
        doc.import(summary, fragment.document(), Document::ROOT);
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
