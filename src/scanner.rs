//! Scanners: walking a source tree and dispatching files.
//!
//! A [`Scanner`] walks its source directory in sorted order and, for every
//! regular file that passes the include/exclude filters, runs each match
//! entry whose suffix ends the file's relative path:
//!
//! - [`MatchAction::Transform`] builds the file with the bound [`Rule`]
//! - [`MatchAction::Link`] symlinks the source file into the target tree
//!
//! Files are dispatched to the rayon pool; results are gathered back in
//! walk order, so the state entries (and therefore the order of entries that
//! share a date) do not depend on scheduling. The first error aborts the
//! scan.
//!
//! Progress is reported as [`BuildEvent`]s through an optional channel, in
//! completion order.

use crate::config::{ActionConfig, ScannerConfig, StateOutputConfig};
use crate::params::{Params, slashed};
use crate::rule::{BuildError, BuildJob, BuildStatus, Rule};
use crate::state::{Entry, PublishReport};
use crate::transform::TransformCache;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("{}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("scanner `{scanner}`: bad pattern: {source}")]
    Pattern {
        scanner: String,
        #[source]
        source: regex::Error,
    },
    #[error("scanner `{scanner}`: unknown rule `{rule}`")]
    UnknownRule { scanner: String, rule: String },
}

/// What to do with a matched file.
#[derive(Debug, Clone)]
pub enum MatchAction {
    Transform(Arc<Rule>),
    Link,
}

#[derive(Debug, Clone)]
pub struct MatchEntry {
    /// Literal suffix of the `/`-separated relative path; empty matches all.
    pub suffix: String,
    pub action: MatchAction,
}

impl MatchEntry {
    pub fn matches(&self, relpath: &str) -> bool {
        self.suffix.is_empty() || relpath.ends_with(&self.suffix)
    }
}

/// Outcome of one action on one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub scanner: String,
    pub relpath: String,
    /// Target path relative to the target root.
    pub target: String,
    pub status: FileStatus,
}

/// A rule outcome, or a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Rebuilt,
    Unchanged,
    Ignored,
    Linked,
}

impl From<BuildStatus> for FileStatus {
    fn from(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Rebuilt => FileStatus::Rebuilt,
            BuildStatus::Unchanged => FileStatus::Unchanged,
            BuildStatus::Ignored => FileStatus::Ignored,
        }
    }
}

/// Progress events for the CLI.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    ScannerStarted {
        name: String,
        source: PathBuf,
        target: PathBuf,
    },
    File(FileResult),
    StatePublished {
        dir: PathBuf,
        report: PublishReport,
    },
}

/// Everything one scanner run produced, in walk order.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub files: Vec<FileResult>,
    pub entries: Vec<Entry>,
}

#[derive(Debug)]
pub struct Scanner {
    name: String,
    label: String,
    source: PathBuf,
    target: PathBuf,
    profiles: Vec<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    matches: Vec<MatchEntry>,
    params: Params,
    state: Option<StateOutputConfig>,
}

impl Scanner {
    /// Build a scanner, resolving rule names against `rules`.
    pub fn from_config(
        name: &str,
        config: &ScannerConfig,
        rules: &BTreeMap<String, Arc<Rule>>,
    ) -> Result<Self, ScanError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, ScanError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| ScanError::Pattern {
                        scanner: name.to_string(),
                        source,
                    })
                })
                .collect()
        };

        let mut matches = Vec::new();
        for m in &config.matches {
            if let Some(rule) = &m.rule {
                let rule = rules.get(rule).ok_or_else(|| ScanError::UnknownRule {
                    scanner: name.to_string(),
                    rule: rule.clone(),
                })?;
                matches.push(MatchEntry {
                    suffix: m.suffix.clone(),
                    action: MatchAction::Transform(Arc::clone(rule)),
                });
            }
            if m.action == Some(ActionConfig::Link) {
                matches.push(MatchEntry {
                    suffix: m.suffix.clone(),
                    action: MatchAction::Link,
                });
            }
        }

        let label = if config.label.is_empty() {
            slashed(&config.source)
        } else {
            config.label.clone()
        };

        Ok(Self {
            name: name.to_string(),
            label,
            source: config.source.clone(),
            target: config.target.clone(),
            profiles: config.profiles.clone(),
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            matches,
            params: config.params.clone(),
            state: config.state.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> Option<&StateOutputConfig> {
        self.state.as_ref()
    }

    /// True if this scanner runs under `profile`.
    pub fn applies_to(&self, profile: &str) -> bool {
        self.profiles.is_empty() || self.profiles.iter().any(|p| p == profile)
    }

    /// Include and exclude filters on a `/`-separated relative path.
    pub fn selects(&self, relpath: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(relpath)) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(relpath))
    }

    /// Files to process, in walk order, with the match entries each one hits.
    fn collect_work(&self) -> Result<Vec<(PathBuf, Vec<&MatchEntry>)>, ScanError> {
        let mut work = Vec::new();
        let walker = WalkDir::new(&self.source)
            .follow_links(true)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|source| ScanError::Walk {
                path: self.source.clone(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relpath) = entry.path().strip_prefix(&self.source) else {
                continue;
            };
            let compare = slashed(relpath);
            if !self.selects(&compare) {
                continue;
            }
            let hits: Vec<&MatchEntry> = self.matches.iter().filter(|m| m.matches(&compare)).collect();
            if !hits.is_empty() {
                work.push((relpath.to_path_buf(), hits));
            }
        }
        Ok(work)
    }

    /// Walk, dispatch and collect. Returns `None` when the scanner does not
    /// apply to `profile`.
    pub fn execute(
        &self,
        profile: &str,
        caller_params: &Params,
        cache: &TransformCache,
        events: Option<&Sender<BuildEvent>>,
    ) -> Result<Option<ScanReport>, ScanError> {
        if !self.applies_to(profile) {
            tracing::info!(scanner = %self.name, profile, "skipped for profile");
            return Ok(None);
        }
        tracing::info!(scanner = %self.name, source = %self.source.display(), "scanning");
        if let Some(tx) = events {
            tx.send(BuildEvent::ScannerStarted {
                name: self.name.clone(),
                source: self.source.clone(),
                target: self.target.clone(),
            })
            .ok();
        }

        let work = self.collect_work()?;
        let per_file: Vec<ScanReport> = work
            .par_iter()
            .map(|(relpath, hits)| {
                let mut out = ScanReport::default();
                for hit in hits {
                    let result = match &hit.action {
                        MatchAction::Transform(rule) => {
                            let job = BuildJob {
                                source_root: &self.source,
                                target_root: &self.target,
                                relpath,
                                suffix: &hit.suffix,
                                profile,
                                scanner_params: &self.params,
                                caller_params,
                            };
                            let outcome = rule.execute(&job, cache)?;
                            out.entries.extend(outcome.records.into_iter().map(|record| Entry {
                                source: self.label.clone(),
                                relpath: slashed(relpath),
                                record,
                            }));
                            self.file_result(relpath, &outcome.target, outcome.status.into())
                        }
                        MatchAction::Link => {
                            let status = self.link(relpath)?;
                            self.file_result(relpath, relpath, status)
                        }
                    };
                    if let Some(tx) = events {
                        tx.send(BuildEvent::File(result.clone())).ok();
                    }
                    out.files.push(result);
                }
                Ok::<_, ScanError>(out)
            })
            .collect::<Result<_, ScanError>>()?;

        let mut report = ScanReport::default();
        for part in per_file {
            report.files.extend(part.files);
            report.entries.extend(part.entries);
        }
        tracing::info!(
            scanner = %self.name,
            files = report.files.len(),
            entries = report.entries.len(),
            "scan complete"
        );
        Ok(Some(report))
    }

    fn file_result(&self, relpath: &Path, target: &Path, status: FileStatus) -> FileResult {
        FileResult {
            scanner: self.name.clone(),
            relpath: slashed(relpath),
            target: slashed(target),
            status,
        }
    }

    /// Replace `target/relpath` with a relative symlink to the source file.
    /// Returns `Ignored` when the two paths are the same file.
    fn link(&self, relpath: &Path) -> Result<FileStatus, ScanError> {
        let sourcefile = self.source.join(relpath);
        let targetfile = self.target.join(relpath);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ScanError::Io { path, source }
        };

        let targetdir = targetfile.parent().unwrap_or(&self.target);
        fs::create_dir_all(targetdir).map_err(io(targetdir))?;

        let real_source = fs::canonicalize(&sourcefile).map_err(io(&sourcefile))?;
        let real_dir = fs::canonicalize(targetdir).map_err(io(targetdir))?;
        let real_target = match targetfile.file_name() {
            Some(name) => real_dir.join(name),
            None => real_dir.clone(),
        };
        if real_target == real_source {
            tracing::warn!(path = %sourcefile.display(), "not linking a file onto itself");
            return Ok(FileStatus::Ignored);
        }

        if fs::symlink_metadata(&targetfile).is_ok() {
            fs::remove_file(&targetfile).map_err(io(&targetfile))?;
        }
        let link = relative_path(&real_dir, &real_source);
        symlink(&link, &targetfile).map_err(io(&targetfile))?;
        tracing::debug!(target = %targetfile.display(), link = %link.display(), "linked");
        Ok(FileStatus::Linked)
    }
}

/// Path from directory `from` to `to`; both absolute.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}
