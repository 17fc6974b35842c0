//! Pulls [`StateRecord`]s out of parsed source documents.

use super::record::{Fragment, RecordDraft, StateRecord};
use crate::config::ExtractConfig;
use crate::xml::{CompiledPath, Document, Namespaces, NodeRef, PathError, Variables};

/// Compiled field expressions for one document type.
#[derive(Debug, Clone)]
pub struct StateExtractor {
    entry: Option<CompiledPath>,
    year: CompiledPath,
    month: CompiledPath,
    day: CompiledPath,
    title: CompiledPath,
    summary: CompiledPath,
    tag: Option<CompiledPath>,
    bookmark: Option<CompiledPath>,
}

impl StateExtractor {
    pub fn compile(config: &ExtractConfig, namespaces: &Namespaces) -> Result<Self, PathError> {
        let compile = |expr: &str| CompiledPath::compile(expr, namespaces);
        let optional = |expr: &Option<String>| expr.as_deref().map(compile).transpose();
        Ok(Self {
            entry: optional(&config.entry)?,
            year: compile(&config.year)?,
            month: compile(&config.month)?,
            day: compile(&config.day)?,
            title: compile(&config.title)?,
            summary: compile(&config.summary)?,
            tag: optional(&config.tag)?,
            bookmark: optional(&config.bookmark)?,
        })
    }

    /// Every valid record in `doc`, in candidate order. Invalid candidates
    /// are dropped; only expression errors fail.
    pub fn execute(&self, doc: &Document) -> Result<Vec<StateRecord>, PathError> {
        let vars = Variables::new();
        let root = NodeRef::Node(Document::ROOT);
        let candidates = match &self.entry {
            Some(entry) => entry.evaluate(doc, root, &vars)?.into_nodes()?,
            None => vec![root],
        };

        let mut records = Vec::new();
        for candidate in candidates {
            match self.candidate(doc, candidate, &vars)?.finish() {
                Some(record) => records.push(record),
                None => tracing::debug!(
                    document = ?doc.uri(),
                    "dropped incomplete state candidate"
                ),
            }
        }
        Ok(records)
    }

    fn candidate(
        &self,
        doc: &Document,
        context: NodeRef,
        vars: &Variables,
    ) -> Result<RecordDraft, PathError> {
        let first = |path: &CompiledPath| -> Result<Option<String>, PathError> {
            Ok(path
                .select(doc, context, vars)?
                .first()
                .map(|item| doc.item_string(item)))
        };

        let mut draft = RecordDraft {
            year: first(&self.year)?,
            month: first(&self.month)?,
            day: first(&self.day)?,
            title: first(&self.title)?,
            ..RecordDraft::default()
        };
        draft.summary = self
            .summary
            .select(doc, context, vars)?
            .iter()
            .map(|item| Fragment::from_item(doc, item))
            .collect();
        if let Some(tag) = &self.tag {
            for item in tag.select(doc, context, vars)? {
                draft.tags.insert(&doc.item_string(&item));
            }
        }
        if let Some(bookmark) = &self.bookmark {
            draft.bookmark = first(bookmark)?;
        }
        Ok(draft)
    }
}
