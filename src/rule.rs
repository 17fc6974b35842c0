//! Rules: building one output file from one source document.
//!
//! A [`Rule`] is built once from its `[rules.<name>]` table and shared by
//! every file and worker that uses it. [`Rule::execute`] handles one file:
//!
//! 1. parse the source (with XInclude) once
//! 2. extract state records with the extractor bound to the document's
//!    root element, whether or not the output is up to date
//! 3. skip the build if the target exists and the source is older than it;
//!    otherwise remove the stale target
//! 4. run the transform program bound to the root element with the merged
//!    parameters (see [`crate::params`])
//! 5. post-process, encode and write the result
//!
//! A document no transform applies to is reported as ignored, not an error.

use crate::config::RuleConfig;
use crate::params::{ParamLayers, Params, ReservedParams, slashed};
use crate::postprocess::{PostProcess, UnknownPlaceholder};
use crate::state::{StateExtractor, StateRecord};
use crate::transform::{TransformCache, TransformError};
use crate::xml::{Document, DocumentError, Namespaces, PathError};
use encoding_rs::Encoding;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("{}: state extraction failed: {source}", path.display())]
    State {
        path: PathBuf,
        #[source]
        source: PathError,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    UnknownPlaceholder {
        path: PathBuf,
        #[source]
        source: UnknownPlaceholder,
    },
    #[error("rule `{rule}`: unknown encoding `{label}`")]
    Encoding { rule: String, label: String },
    #[error("rule `{rule}`: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// The transform ran and the target was written.
    Rebuilt,
    /// The target was newer than the source.
    Unchanged,
    /// No transform applies to the document.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    /// Target path relative to the target root.
    pub target: PathBuf,
    pub records: Vec<StateRecord>,
}

/// Everything [`Rule::execute`] needs to know about one file.
#[derive(Debug, Clone, Copy)]
pub struct BuildJob<'a> {
    pub source_root: &'a Path,
    pub target_root: &'a Path,
    /// Source path relative to `source_root`.
    pub relpath: &'a Path,
    /// The match suffix that selected this rule; replaced by the rule's
    /// extension.
    pub suffix: &'a str,
    pub profile: &'a str,
    pub scanner_params: &'a Params,
    pub caller_params: &'a Params,
}

#[derive(Debug)]
struct Transform {
    root: Option<String>,
    program: PathBuf,
    state: Option<StateExtractor>,
}

#[derive(Debug)]
pub struct Rule {
    name: String,
    extension: String,
    encoding: &'static Encoding,
    params: Params,
    transforms: Vec<Transform>,
    post: PostProcess,
}

impl Rule {
    pub fn from_config(
        name: &str,
        config: &RuleConfig,
        namespaces: &Namespaces,
    ) -> Result<Self, BuildError> {
        let encoding = lookup_encoding(name, &config.encoding)?;
        let template_encoding = lookup_encoding(name, &config.template_encoding)?;
        let header = template(&config.header, &config.header_file, template_encoding)?;
        let footer = template(&config.footer, &config.footer_file, template_encoding)?;
        let post = post_process(config, &header, &footer).map_err(|source| BuildError::Pattern {
            rule: name.to_string(),
            source,
        })?;

        let mut transforms = Vec::with_capacity(config.transforms.len());
        for t in &config.transforms {
            let state = match &t.state {
                Some(extract) => Some(StateExtractor::compile(extract, namespaces).map_err(|source| {
                    BuildError::State {
                        path: t.program.clone(),
                        source,
                    }
                })?),
                None => None,
            };
            transforms.push(Transform {
                root: t.root.clone(),
                program: t.program.clone(),
                state,
            });
        }

        Ok(Self {
            name: name.to_string(),
            extension: config.extension.clone(),
            encoding,
            params: config.params.clone(),
            transforms,
            post,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every transform program this rule may run.
    pub fn programs(&self) -> impl Iterator<Item = &Path> {
        self.transforms.iter().map(|t| t.program.as_path())
    }

    /// Target path for `relpath`: `suffix` replaced by the rule's extension.
    pub fn target_relpath(&self, relpath: &Path, suffix: &str) -> PathBuf {
        let rel = slashed(relpath);
        let stem = rel.strip_suffix(suffix).unwrap_or(&rel);
        PathBuf::from(format!("{}{}", stem, self.extension))
    }

    fn transform_for(&self, doc: &Document) -> Option<&Transform> {
        let root = doc.root_name()?;
        self.transforms
            .iter()
            .find(|t| t.root.as_deref().is_none_or(|r| r == root))
    }

    /// Build one file. State records are returned even when the build is
    /// skipped.
    pub fn execute(
        &self,
        job: &BuildJob<'_>,
        cache: &TransformCache,
    ) -> Result<BuildOutcome, BuildError> {
        let sourcefile = job.source_root.join(job.relpath);
        let target = self.target_relpath(job.relpath, job.suffix);
        let targetfile = job.target_root.join(&target);

        let doc = Document::parse_file(&sourcefile)?;
        let transform = self.transform_for(&doc);
        let records = match transform.and_then(|t| t.state.as_ref()) {
            Some(extractor) => extractor.execute(&doc).map_err(|source| BuildError::State {
                path: sourcefile.clone(),
                source,
            })?,
            None => Vec::new(),
        };
        let outcome = |status| BuildOutcome {
            status,
            target: target.clone(),
            records: records.clone(),
        };

        if targetfile.is_file() {
            if modified(&sourcefile)? < modified(&targetfile)? {
                tracing::debug!(rule = %self.name, relpath = %job.relpath.display(), "up to date");
                return Ok(outcome(BuildStatus::Unchanged));
            }
            fs::remove_file(&targetfile).map_err(|source| BuildError::Io {
                path: targetfile.clone(),
                source,
            })?;
        }

        let Some(transform) = transform else {
            tracing::debug!(rule = %self.name, relpath = %job.relpath.display(), "no transform for root");
            return Ok(outcome(BuildStatus::Ignored));
        };

        let reserved = ReservedParams::compute(
            job.source_root,
            job.target_root,
            job.relpath,
            &target,
            job.profile,
        );
        let params = ParamLayers {
            rule: &self.params,
            scanner: job.scanner_params,
            caller: job.caller_params,
            reserved: &reserved,
        }
        .merge();

        let program = cache.get(&transform.program)?;
        let Some(result) = program.run(&doc, &params)? else {
            tracing::debug!(rule = %self.name, relpath = %job.relpath.display(), "transform produced nothing");
            return Ok(outcome(BuildStatus::Ignored));
        };

        let text = self
            .post
            .apply(&result.to_xml(true), &params)
            .map_err(|source| BuildError::UnknownPlaceholder {
                path: sourcefile.clone(),
                source,
            })?;
        let (bytes, _, _) = self.encoding.encode(&text);

        if let Some(dir) = targetfile.parent() {
            fs::create_dir_all(dir).map_err(|source| BuildError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(&targetfile, &bytes).map_err(|source| BuildError::Io {
            path: targetfile.clone(),
            source,
        })?;
        tracing::debug!(rule = %self.name, relpath = %job.relpath.display(), "rebuilt");
        Ok(outcome(BuildStatus::Rebuilt))
    }
}

fn lookup_encoding(rule: &str, label: &str) -> Result<&'static Encoding, BuildError> {
    Encoding::for_label(label.as_bytes()).ok_or_else(|| BuildError::Encoding {
        rule: rule.to_string(),
        label: label.to_string(),
    })
}

/// Inline text, or the decoded contents of a template file.
fn template(
    inline: &Option<String>,
    file: &Option<PathBuf>,
    encoding: &'static Encoding,
) -> Result<String, BuildError> {
    if let Some(text) = inline {
        return Ok(text.clone());
    }
    let Some(path) = file else {
        return Ok(String::new());
    };
    let bytes = fs::read(path).map_err(|source| BuildError::Io {
        path: path.clone(),
        source,
    })?;
    let (text, _, _) = encoding.decode(&bytes);
    Ok(text.replace("\r\n", "\n"))
}

fn post_process(
    config: &RuleConfig,
    header: &str,
    footer: &str,
) -> Result<PostProcess, regex::Error> {
    PostProcess::new(
        config.strip,
        &config.empty_tags,
        &config.preserve_tags,
        &config.replacements,
        header,
        footer,
    )
}

fn modified(path: &Path) -> Result<std::time::SystemTime, BuildError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractConfig, TransformConfig};
    use crate::transform::tests::{MockEngine, RecordedOp};
    use filetime::{FileTime, set_file_mtime};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        cache: TransformCache,
        ops: Arc<Mutex<Vec<RecordedOp>>>,
    }

    impl Fixture {
        fn new(engine: MockEngine) -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("src")).unwrap();
            let ops = Arc::clone(&engine.operations);
            Self {
                tmp,
                cache: TransformCache::new(Box::new(engine)),
                ops,
            }
        }

        fn src(&self) -> PathBuf {
            self.tmp.path().join("src")
        }

        fn out(&self) -> PathBuf {
            self.tmp.path().join("out")
        }

        fn write_source(&self, rel: &str, xml: &str) {
            let path = self.src().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, xml).unwrap();
        }

        fn run(&self, rule: &Rule, rel: &str) -> Result<BuildOutcome, BuildError> {
            self.run_with(rule, rel, &Params::new())
        }

        fn run_with(
            &self,
            rule: &Rule,
            rel: &str,
            caller: &Params,
        ) -> Result<BuildOutcome, BuildError> {
            let src = self.src();
            let out = self.out();
            let scanner = Params::new();
            let job = BuildJob {
                source_root: &src,
                target_root: &out,
                relpath: Path::new(rel),
                suffix: ".xml",
                profile: "web",
                scanner_params: &scanner,
                caller_params: caller,
            };
            rule.execute(&job, &self.cache)
        }

        fn runs(&self) -> Vec<(String, String, Params)> {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .filter_map(|op| match op {
                    RecordedOp::Run {
                        program,
                        root,
                        params,
                    } => Some((program.clone(), root.clone(), params.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    fn transform(root: Option<&str>, program: &str) -> TransformConfig {
        TransformConfig {
            root: root.map(str::to_string),
            program: PathBuf::from(program),
            state: None,
        }
    }

    fn rule(config: RuleConfig) -> Rule {
        Rule::from_config("page", &config, &Namespaces::new()).unwrap()
    }

    fn any_root_rule() -> Rule {
        rule(RuleConfig {
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        })
    }

    fn post_state() -> ExtractConfig {
        ExtractConfig {
            entry: None,
            year: "/post/@y".into(),
            month: "/post/@m".into(),
            day: "/post/@d".into(),
            title: "/post/title".into(),
            summary: "/post/title".into(),
            tag: None,
            bookmark: None,
        }
    }

    const POST: &str = r#"<post y="2020" m="1" d="2"><title>Hi</title></post>"#;

    fn set_mtime(path: &Path, secs: i64) {
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    // =========================================================================
    // Target naming
    // =========================================================================

    #[test]
    fn target_replaces_matched_suffix() {
        let r = any_root_rule();
        assert_eq!(
            r.target_relpath(Path::new("blog/post.xml"), ".xml"),
            PathBuf::from("blog/post.html")
        );
        assert_eq!(
            r.target_relpath(Path::new("notes.page.xml"), ".page.xml"),
            PathBuf::from("notes.html")
        );
        assert_eq!(
            r.target_relpath(Path::new("readme"), ""),
            PathBuf::from("readme.html")
        );
    }

    // =========================================================================
    // Staleness
    // =========================================================================

    #[test]
    fn builds_missing_target() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("a/page.xml", "<page>hello</page>");

        let outcome = fx.run(&any_root_rule(), "a/page.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Rebuilt);
        assert_eq!(outcome.target, PathBuf::from("a/page.html"));
        let written = fs::read_to_string(fx.out().join("a/page.html")).unwrap();
        assert_eq!(written, r#"<out root="page" relpath="a/page.xml">hello</out>"#);
    }

    #[test]
    fn skips_when_source_older_than_target() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>new</page>");
        fs::create_dir_all(fx.out()).unwrap();
        fs::write(fx.out().join("page.html"), "old output").unwrap();
        set_mtime(&fx.src().join("page.xml"), 1_000);
        set_mtime(&fx.out().join("page.html"), 2_000);

        let outcome = fx.run(&any_root_rule(), "page.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Unchanged);
        assert_eq!(
            fs::read_to_string(fx.out().join("page.html")).unwrap(),
            "old output"
        );
        assert!(fx.runs().is_empty());
    }

    #[test]
    fn rebuilds_when_times_are_equal() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>new</page>");
        fs::create_dir_all(fx.out()).unwrap();
        fs::write(fx.out().join("page.html"), "old output").unwrap();
        set_mtime(&fx.src().join("page.xml"), 2_000);
        set_mtime(&fx.out().join("page.html"), 2_000);

        let outcome = fx.run(&any_root_rule(), "page.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Rebuilt);
        assert!(
            fs::read_to_string(fx.out().join("page.html"))
                .unwrap()
                .contains("new")
        );
    }

    #[test]
    fn rebuilds_when_source_newer() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>new</page>");
        fs::create_dir_all(fx.out()).unwrap();
        fs::write(fx.out().join("page.html"), "old output").unwrap();
        set_mtime(&fx.src().join("page.xml"), 3_000);
        set_mtime(&fx.out().join("page.html"), 2_000);

        assert_eq!(
            fx.run(&any_root_rule(), "page.xml").unwrap().status,
            BuildStatus::Rebuilt
        );
    }

    #[test]
    fn state_is_extracted_even_when_unchanged() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("post.xml", POST);
        fs::create_dir_all(fx.out()).unwrap();
        fs::write(fx.out().join("post.html"), "old").unwrap();
        set_mtime(&fx.src().join("post.xml"), 1_000);
        set_mtime(&fx.out().join("post.html"), 2_000);
        let r = rule(RuleConfig {
            transforms: vec![TransformConfig {
                state: Some(post_state()),
                ..transform(Some("post"), "post.xsl")
            }],
            ..RuleConfig::default()
        });

        let outcome = fx.run(&r, "post.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Unchanged);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].title(), "Hi");
    }

    // =========================================================================
    // Transform selection
    // =========================================================================

    #[test]
    fn first_matching_root_wins() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("post.xml", POST);
        fx.write_source("page.xml", "<page/>");
        let r = rule(RuleConfig {
            transforms: vec![
                transform(Some("post"), "post.xsl"),
                transform(None, "page.xsl"),
            ],
            ..RuleConfig::default()
        });

        fx.run(&r, "post.xml").unwrap();
        fx.run(&r, "page.xml").unwrap();

        let programs: Vec<_> = fx.runs().into_iter().map(|(p, root, _)| (p, root)).collect();
        assert_eq!(
            programs,
            vec![
                ("post.xsl".to_string(), "post".to_string()),
                ("page.xsl".to_string(), "page".to_string())
            ]
        );
    }

    #[test]
    fn unmatched_root_is_ignored() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("other.xml", "<other/>");
        let r = rule(RuleConfig {
            transforms: vec![transform(Some("post"), "post.xsl")],
            ..RuleConfig::default()
        });

        let outcome = fx.run(&r, "other.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Ignored);
        assert!(!fx.out().join("other.html").exists());
        assert!(fx.ops.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_transform_result_is_ignored_and_stale_target_removed() {
        let fx = Fixture::new(MockEngine::ignoring(&["draft"]));
        fx.write_source("d.xml", "<draft/>");
        fs::create_dir_all(fx.out()).unwrap();
        fs::write(fx.out().join("d.html"), "stale").unwrap();
        set_mtime(&fx.src().join("d.xml"), 3_000);
        set_mtime(&fx.out().join("d.html"), 2_000);

        let outcome = fx.run(&any_root_rule(), "d.xml").unwrap();

        assert_eq!(outcome.status, BuildStatus::Ignored);
        assert!(!fx.out().join("d.html").exists());
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    #[test]
    fn parameters_merge_in_precedence_order() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("a/b/page.xml", "<page/>");
        let r = rule(RuleConfig {
            params: [("lang", "en"), ("theme", "dark")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        });
        let caller = Params::from_assignments(&["theme=light", "profile=evil"]);

        fx.run_with(&r, "a/b/page.xml", &caller).unwrap();

        let (_, _, params) = fx.runs().remove(0);
        assert_eq!(params.get("lang"), Some("en"));
        assert_eq!(params.get("theme"), Some("light"));
        assert_eq!(params.get("profile"), Some("web"));
        assert_eq!(params.get("relativeroot"), Some("../../"));
        assert_eq!(params.get("targetrpath"), Some("a/b/page.html"));
    }

    // =========================================================================
    // Output
    // =========================================================================

    #[test]
    fn header_expands_parameters() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>x</page>");
        let r = rule(RuleConfig {
            header: Some("<!-- @sourcerpath@ -->".into()),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        });

        fx.run(&r, "page.xml").unwrap();

        let written = fs::read_to_string(fx.out().join("page.html")).unwrap();
        assert!(written.starts_with("<!-- page.xml -->\n<out"));
    }

    #[test]
    fn header_file_is_read_and_decoded() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>x</page>");
        let header = fx.tmp.path().join("header.txt");
        fs::write(&header, b"<!-- caf\xe9 -->\r\n").unwrap();
        let r = rule(RuleConfig {
            header_file: Some(header),
            template_encoding: "latin1".into(),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        });

        fx.run(&r, "page.xml").unwrap();

        let written = fs::read_to_string(fx.out().join("page.html")).unwrap();
        assert!(written.starts_with("<!-- café -->\n<out"));
    }

    #[test]
    fn unknown_header_placeholder_fails() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page/>");
        let r = rule(RuleConfig {
            header: Some("@missing@".into()),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        });

        let err = fx.run(&r, "page.xml").unwrap_err();
        assert!(matches!(err, BuildError::UnknownPlaceholder { .. }));
    }

    #[test]
    fn unmappable_characters_become_references() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("page.xml", "<page>é→</page>");
        let r = rule(RuleConfig {
            encoding: "windows-1252".into(),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        });

        fx.run(&r, "page.xml").unwrap();

        let bytes = fs::read(fx.out().join("page.html")).unwrap();
        let tail = br#"">"#.len() + 1 + "&#8594;".len() + "</out>".len();
        let body = &bytes[bytes.len() - tail..];
        assert_eq!(body, b"\">\xe9&#8594;</out>");
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn malformed_source_is_an_error() {
        let fx = Fixture::new(MockEngine::new());
        fx.write_source("bad.xml", "<page><unclosed></page>");
        assert!(matches!(
            fx.run(&any_root_rule(), "bad.xml"),
            Err(BuildError::Document(_))
        ));
    }

    #[test]
    fn missing_header_file_fails_construction() {
        let config = RuleConfig {
            header_file: Some(PathBuf::from("/definitely/not/here.txt")),
            transforms: vec![transform(None, "page.xsl")],
            ..RuleConfig::default()
        };
        assert!(matches!(
            Rule::from_config("page", &config, &Namespaces::new()),
            Err(BuildError::Io { .. })
        ));
    }
}
