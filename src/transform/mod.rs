//! Transform programs.
//!
//! A [`TransformEngine`] compiles a program file into a [`Program`], which
//! turns a parsed source document plus string parameters into a result
//! document. Programs are stateless given their parameters, so one compiled
//! program is shared by every file a rule processes (see [`cache`]).
//!
//! The production engine is [`StylesheetEngine`](stylesheet::StylesheetEngine),
//! a built-in XSLT subset. Tests use the recording mock in
//! [`tests::MockEngine`].

pub mod cache;
pub mod stylesheet;

use crate::params::Params;
use crate::xml::{Document, DocumentError, PathError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cache::{CacheStats, TransformCache};
pub use stylesheet::StylesheetEngine;

/// Stack size for threads that run transforms. Stylesheet template nesting
/// is capped well inside it.
pub const STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("{}: {source}", program.display())]
    Path {
        program: PathBuf,
        #[source]
        source: PathError,
    },
    #[error("{}: {message}", program.display())]
    Invalid { program: PathBuf, message: String },
    #[error("{}: {message}", program.display())]
    Runtime { program: PathBuf, message: String },
}

/// A compiled transform program.
pub trait Program: Send + Sync {
    /// Transform `source`. `Ok(None)` means the program has nothing to say
    /// about this document (no rule matches its root), which callers treat
    /// as "ignored" rather than an error.
    fn run(&self, source: &Document, params: &Params) -> Result<Option<Document>, TransformError>;
}

/// Compiles program files.
pub trait TransformEngine: Send + Sync {
    fn compile(&self, path: &Path) -> Result<Box<dyn Program>, TransformError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::xml::QName;
    use std::sync::{Arc, Mutex};

    /// Mock engine that records compile and run calls.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    #[derive(Default)]
    pub struct MockEngine {
        pub operations: Arc<Mutex<Vec<RecordedOp>>>,
        /// Root element names the compiled programs refuse (run returns None).
        pub ignore_roots: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Compile(String),
        Run {
            program: String,
            root: String,
            params: Params,
        },
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ignoring(roots: &[&str]) -> Self {
            Self {
                ignore_roots: roots.iter().map(|r| r.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        pub fn compile_count(&self) -> usize {
            self.get_operations()
                .iter()
                .filter(|op| matches!(op, RecordedOp::Compile(_)))
                .count()
        }

        pub fn runs(&self) -> Vec<(String, Params)> {
            self.get_operations()
                .into_iter()
                .filter_map(|op| match op {
                    RecordedOp::Run { root, params, .. } => Some((root, params)),
                    _ => None,
                })
                .collect()
        }
    }

    struct MockProgram {
        name: String,
        ignore_roots: Vec<String>,
        operations: Arc<Mutex<Vec<RecordedOp>>>,
    }

    impl TransformEngine for MockEngine {
        fn compile(&self, path: &Path) -> Result<Box<dyn Program>, TransformError> {
            let name = path.to_string_lossy().to_string();
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Compile(name.clone()));
            Ok(Box::new(MockProgram {
                name,
                ignore_roots: self.ignore_roots.clone(),
                operations: Arc::clone(&self.operations),
            }))
        }
    }

    /// Produces `<out root="..." relpath="...">string value</out>`.
    impl Program for MockProgram {
        fn run(&self, source: &Document, params: &Params) -> Result<Option<Document>, TransformError> {
            let root = source.root_name().unwrap_or_default().to_string();
            self.operations.lock().unwrap().push(RecordedOp::Run {
                program: self.name.clone(),
                root: root.clone(),
                params: params.clone(),
            });
            if self.ignore_roots.contains(&root) {
                return Ok(None);
            }
            let mut out = Document::new();
            let el = out.append_element(Document::ROOT, QName::local("out"));
            out.set_attribute(el, QName::local("root"), root);
            if let Some(rel) = params.get("sourcerpath") {
                out.set_attribute(el, QName::local("relpath"), rel);
            }
            out.append_text(el, &source.string_value(Document::ROOT));
            Ok(Some(out))
        }
    }

    #[test]
    fn mock_records_compile_and_run() {
        let engine = MockEngine::new();
        let program = engine.compile(Path::new("/xsl/page.xsl")).unwrap();
        let doc = Document::parse_str("<page>hi</page>").unwrap();
        let out = program.run(&doc, &Params::default()).unwrap().unwrap();

        assert_eq!(out.to_xml(false), r#"<out root="page">hi</out>"#);
        let ops = engine.get_operations();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], RecordedOp::Compile(p) if p == "/xsl/page.xsl"));
        assert!(matches!(&ops[1], RecordedOp::Run { root, .. } if root == "page"));
    }

    #[test]
    fn mock_ignores_configured_roots() {
        let engine = MockEngine::ignoring(&["draft"]);
        let program = engine.compile(Path::new("p.xsl")).unwrap();
        let doc = Document::parse_str("<draft/>").unwrap();
        assert!(program.run(&doc, &Params::default()).unwrap().is_none());
    }
}
