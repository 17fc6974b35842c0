//! Orchestrator: turns a [`SiteConfig`] into rules and scanners, runs the
//! scanners that apply to a profile, and publishes state once every scanner
//! has finished.
//!
//! A [`Site`] owns the [`TransformCache`]; every rule and every worker thread
//! borrows it, so each program is compiled at most once per process.
//!
//! Scanners that publish to the same state directory have their entries
//! merged, in scanner order, before publishing. Configuration validation
//! guarantees they agree on page names and page size.

use crate::config::{ConfigError, ScannerConfig, SiteConfig, StateOutputConfig, check_shared_state};
use crate::params::{Params, slashed};
use crate::rule::{BuildError, Rule};
use crate::scanner::{BuildEvent, FileResult, FileStatus, ScanError, Scanner};
use crate::state::{Entry, PublishError, StatePublisher};
use crate::transform::{CacheStats, StylesheetEngine, TransformCache, TransformEngine, TransformError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Command-line overrides for one build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub profile: String,
    /// Restrict the run to these scanners; empty runs all of them.
    pub scanners: Vec<String>,
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub state: StateOverrides,
    pub params: Params,
}

#[derive(Debug, Clone, Default)]
pub struct StateOverrides {
    pub dir: Option<PathBuf>,
    pub pagination: Option<usize>,
    pub recent: Option<String>,
    pub tags: Option<String>,
}

impl StateOverrides {
    fn is_empty(&self) -> bool {
        self.dir.is_none() && self.pagination.is_none() && self.recent.is_none() && self.tags.is_none()
    }

    /// Apply to a scanner's state output. `dir` enables publishing for a
    /// scanner that had none, starting from `template`'s page settings.
    fn apply(&self, state: &mut Option<StateOutputConfig>, template: &StateOutputConfig) {
        if state.is_none() && self.dir.is_some() {
            *state = Some(template.clone());
        }
        let Some(state) = state else {
            return;
        };
        if let Some(dir) = &self.dir {
            state.dir = dir.clone();
        }
        if let Some(pagination) = self.pagination {
            state.pagination = pagination;
        }
        if let Some(recent) = &self.recent {
            state.recent = recent.clone();
        }
        if let Some(tags) = &self.tags {
            state.tags = tags.clone();
        }
    }
}

/// One published state output.
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub dir: PathBuf,
    pub entries: usize,
    pub written: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

/// Machine-readable result of a build, written by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub profile: String,
    /// Scanners that ran; profile-filtered ones are left out.
    pub scanners: Vec<String>,
    pub files: Vec<FileResult>,
    pub state: Vec<StateSummary>,
    pub cache: CacheStats,
}

impl BuildReport {
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }
}

pub struct Site {
    config: SiteConfig,
    rules: BTreeMap<String, Arc<Rule>>,
    cache: TransformCache,
}

impl Site {
    /// Bind a configuration to the built-in stylesheet engine.
    pub fn new(config: SiteConfig) -> Result<Self, SiteError> {
        let engine = StylesheetEngine::new(config.namespaces.clone());
        Self::with_engine(config, Box::new(engine))
    }

    pub fn with_engine(
        config: SiteConfig,
        engine: Box<dyn TransformEngine>,
    ) -> Result<Self, SiteError> {
        let mut rules = BTreeMap::new();
        for (name, rule) in &config.rules {
            let rule = Rule::from_config(name, rule, &config.namespaces)?;
            rules.insert(name.clone(), Arc::new(rule));
        }
        Ok(Self {
            config,
            rules,
            cache: TransformCache::new(engine),
        })
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Compile every transform program the rules reference. Returns the
    /// number of distinct programs.
    pub fn check(&self) -> Result<usize, SiteError> {
        for rule in self.rules.values() {
            for program in rule.programs() {
                self.cache.get(program)?;
            }
        }
        Ok(self.cache.len())
    }

    /// Run the selected scanners for `options.profile`, then publish state.
    pub fn build(
        &self,
        options: &BuildOptions,
        events: Option<&Sender<BuildEvent>>,
    ) -> Result<BuildReport, SiteError> {
        let scanners = self
            .select(options)?
            .iter()
            .map(|(name, config)| Scanner::from_config(name, config, &self.rules))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ran = Vec::new();
        let mut files = Vec::new();
        let mut outputs: Vec<(StateOutputConfig, Vec<Entry>)> = Vec::new();
        for scanner in &scanners {
            let Some(report) = scanner.execute(&options.profile, &options.params, &self.cache, events)?
            else {
                continue;
            };
            ran.push(scanner.name().to_string());
            files.extend(report.files);
            if let Some(state) = scanner.state() {
                match outputs.iter_mut().find(|(s, _)| s.dir == state.dir) {
                    Some((_, entries)) => entries.extend(report.entries),
                    None => outputs.push((state.clone(), report.entries)),
                }
            }
        }

        let mut state = Vec::new();
        for (output, entries) in &outputs {
            let publisher = StatePublisher::new(output);
            let report = publisher.publish(entries)?;
            if let Some(tx) = events {
                tx.send(BuildEvent::StatePublished {
                    dir: publisher.dir().to_path_buf(),
                    report: report.clone(),
                })
                .ok();
            }
            state.push(StateSummary {
                dir: publisher.dir().to_path_buf(),
                entries: entries.len(),
                written: report.written,
                unchanged: report.unchanged,
            });
        }

        Ok(BuildReport {
            profile: options.profile.clone(),
            scanners: ran,
            files,
            state,
            cache: self.cache.stats(),
        })
    }

    /// Scanner configurations for this build with overrides applied.
    fn select(&self, options: &BuildOptions) -> Result<Vec<(String, ScannerConfig)>, ConfigError> {
        for name in &options.scanners {
            if !self.config.scanners.contains_key(name) {
                return Err(ConfigError::Validation(format!("unknown scanner `{name}`")));
            }
        }
        let mut selected: Vec<(String, ScannerConfig)> = self
            .config
            .scanners
            .iter()
            .filter(|(name, _)| options.scanners.is_empty() || options.scanners.contains(name))
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        if options.source.is_some() || options.target.is_some() {
            let [(_, config)] = selected.as_mut_slice() else {
                return Err(ConfigError::Validation(format!(
                    "--source/--target need exactly one scanner, {} selected",
                    selected.len()
                )));
            };
            if let Some(source) = &options.source {
                config.source = source.clone();
                config.label = slashed(source);
            }
            if let Some(target) = &options.target {
                config.target = target.clone();
            }
        }

        if !options.state.is_empty() {
            let template = selected
                .iter()
                .find_map(|(_, config)| config.state.clone())
                .unwrap_or_default();
            for (name, config) in &mut selected {
                options.state.apply(&mut config.state, &template);
                if let Some(state) = &config.state {
                    state.validate(&format!("scanners.{name}.state"))?;
                }
            }
            check_shared_state(
                selected
                    .iter()
                    .filter_map(|(name, config)| Some((name.as_str(), config.state.as_ref()?))),
            )?;
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::test_helpers::*;
    use crate::transform::tests::MockEngine;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[rules.post]
extension = ".html"
[[rules.post.transforms]]
program = "post.xsl"
[rules.post.transforms.state]
year = "/post/date/@year"
month = "/post/date/@month"
day = "/post/date/@day"
title = "/post/title"
summary = "/post/summary"
tag = "/post/tag"

[scanners.blog]
source = "blog"
target = "out/blog"
[[scanners.blog.matches]]
rule = "post"
[scanners.blog.state]
dir = "state"
pagination = 2

[scanners.news]
source = "news"
target = "out/news"
profiles = ["web"]
[[scanners.news.matches]]
rule = "post"
[scanners.news.state]
dir = "state"
pagination = 2
"#;

    fn post(day: u32, title: &str, tags: &[&str]) -> String {
        let tags: String = tags.iter().map(|t| format!("<tag>{t}</tag>")).collect();
        format!(
            r#"<post><date year="2020" month="1" day="{day}"/><title>{title}</title><summary>s</summary>{tags}</post>"#
        )
    }

    fn site(tmp: &Path) -> Site {
        let mut config = parse_config(CONFIG).unwrap();
        config.resolve_paths(tmp);
        Site::with_engine(config, Box::new(MockEngine::new())).unwrap()
    }

    fn options(profile: &str) -> BuildOptions {
        BuildOptions {
            profile: profile.to_string(),
            ..BuildOptions::default()
        }
    }

    // =========================================================================
    // Scanner selection
    // =========================================================================

    #[test]
    fn profile_selects_scanners() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &[]));
        write_file(tmp.path(), "news/b.xml", &post(2, "B", &[]));

        let report = site(tmp.path()).build(&options("print"), None).unwrap();
        assert_eq!(report.scanners, vec!["blog"]);

        let report = site(tmp.path()).build(&options("web"), None).unwrap();
        assert_eq!(report.scanners, vec!["blog", "news"]);
    }

    #[test]
    fn unknown_scanner_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        let mut opts = options("web");
        opts.scanners = vec!["nope".into()];
        assert!(matches!(
            site(tmp.path()).build(&opts, None),
            Err(SiteError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn source_override_needs_one_scanner() {
        let tmp = TempDir::new().unwrap();
        let mut opts = options("web");
        opts.source = Some(tmp.path().join("elsewhere"));
        assert!(site(tmp.path()).build(&opts, None).is_err());

        write_file(tmp.path(), "elsewhere/x.xml", &post(3, "X", &[]));
        opts.scanners = vec!["blog".into()];
        let report = site(tmp.path()).build(&opts, None).unwrap();
        assert_eq!(report.files.len(), 1);
        assert!(tmp.path().join("out/blog/x.html").exists());
    }

    // =========================================================================
    // State
    // =========================================================================

    #[test]
    fn shared_state_output_merges_scanners() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &["x"]));
        write_file(tmp.path(), "news/b.xml", &post(2, "B", &["x"]));

        let report = site(tmp.path()).build(&options("web"), None).unwrap();
        assert_eq!(report.state.len(), 1);
        assert_eq!(report.state[0].entries, 2);

        let recent = fs::read_to_string(tmp.path().join("state/recent.xml")).unwrap();
        let b = recent.find("<title>B</title>").unwrap();
        let a = recent.find("<title>A</title>").unwrap();
        assert!(b < a);
        assert!(recent.contains(r#"source="news""#));
        assert!(recent.contains(r#"source="blog""#));
    }

    #[test]
    fn state_dir_override_enables_publishing() {
        let tmp = TempDir::new().unwrap();
        let mut config = parse_config(CONFIG).unwrap();
        config.scanners.get_mut("blog").unwrap().state = None;
        config.resolve_paths(tmp.path());
        let site = Site::with_engine(config, Box::new(MockEngine::new())).unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &[]));

        let mut opts = options("print");
        opts.state.dir = Some(tmp.path().join("alt"));
        opts.state.recent = Some("latest".into());
        let report = site.build(&opts, None).unwrap();

        assert_eq!(report.state[0].dir, tmp.path().join("alt"));
        assert!(tmp.path().join("alt/latest.xml").exists());
        assert!(tmp.path().join("alt/tags.xml").exists());
    }

    #[test]
    fn state_dir_override_merges_scanners_into_one_output() {
        let tmp = TempDir::new().unwrap();
        let mut config = parse_config(CONFIG).unwrap();
        config.scanners.get_mut("news").unwrap().state.as_mut().unwrap().dir = "other".into();
        config.resolve_paths(tmp.path());
        let site = Site::with_engine(config, Box::new(MockEngine::new())).unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &["x"]));
        write_file(tmp.path(), "news/b.xml", &post(2, "B", &["x"]));

        let mut opts = options("web");
        opts.state.dir = Some(tmp.path().join("joint"));
        let report = site.build(&opts, None).unwrap();

        assert_eq!(report.state.len(), 1);
        assert_eq!(report.state[0].entries, 2);
        assert_eq!(state_titles(&tmp.path().join("joint/x.xml")), ["B", "A"]);
        assert!(site.build(&opts, None).unwrap().state[0].written.is_empty());
    }

    #[test]
    fn state_dir_override_rejects_mismatched_pages() {
        let tmp = TempDir::new().unwrap();
        let mut config = parse_config(CONFIG).unwrap();
        let news = config.scanners.get_mut("news").unwrap().state.as_mut().unwrap();
        news.dir = "other".into();
        news.pagination = 3;
        config.resolve_paths(tmp.path());
        let site = Site::with_engine(config, Box::new(MockEngine::new())).unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &[]));
        write_file(tmp.path(), "news/b.xml", &post(2, "B", &[]));

        let mut opts = options("web");
        opts.state.dir = Some(tmp.path().join("joint"));
        assert!(matches!(
            site.build(&opts, None),
            Err(SiteError::Config(ConfigError::Validation(_)))
        ));

        opts.state.pagination = Some(4);
        assert!(site.build(&opts, None).is_ok());
    }

    #[test]
    fn invalid_state_override_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut opts = options("web");
        opts.state.recent = Some("tags".into());
        assert!(matches!(
            site(tmp.path()).build(&opts, None),
            Err(SiteError::Config(_))
        ));
    }

    #[test]
    fn second_build_rewrites_nothing() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &["x"]));
        set_mtime(&tmp.path().join("blog/a.xml"), 1_000_000);
        let site = site(tmp.path());

        let first = site.build(&options("print"), None).unwrap();
        assert!(!first.state[0].written.is_empty());
        let second = site.build(&options("print"), None).unwrap();
        assert!(second.state[0].written.is_empty());
        assert_eq!(second.count(FileStatus::Unchanged), 1);
    }

    // =========================================================================
    // Parameters and cache
    // =========================================================================

    #[test]
    fn caller_params_reach_the_program() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "blog/a.xml", &post(1, "A", &[]));
        let engine = MockEngine::new();
        let ops = Arc::clone(&engine.operations);
        let mut config = parse_config(CONFIG).unwrap();
        config.resolve_paths(tmp.path());
        let site = Site::with_engine(config, Box::new(engine)).unwrap();

        let mut opts = options("print");
        opts.params.insert("lang", "en");
        site.build(&opts, None).unwrap();

        let ops = ops.lock().unwrap();
        let params = ops
            .iter()
            .find_map(|op| match op {
                crate::transform::tests::RecordedOp::Run { params, .. } => Some(params.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(params.get("lang"), Some("en"));
        assert_eq!(params.get("profile"), Some("print"));
    }

    #[test]
    fn check_compiles_each_program_once() {
        let tmp = TempDir::new().unwrap();
        let site = site(tmp.path());
        assert_eq!(site.check().unwrap(), 1);
        assert_eq!(site.check().unwrap(), 1);
    }

    // =========================================================================
    // Fixture site
    // =========================================================================

    #[test]
    fn fixture_programs_compile() {
        let tmp = setup_fixtures();
        let site = Site::new(fixture_config(tmp.path())).unwrap();
        assert_eq!(site.check().unwrap(), 3);
    }

    #[test]
    fn fixture_rebuild_only_touches_newer_sources() {
        let tmp = setup_fixtures();
        let site = Site::new(fixture_config(tmp.path())).unwrap();
        age_tree(&tmp.path().join("content"), 1_000_000);

        let first = site.build(&options("default"), None).unwrap();
        assert_eq!(first.count(FileStatus::Rebuilt), 4);

        set_mtime(&tmp.path().join("site/index.html"), 500_000);
        let second = site.build(&options("default"), None).unwrap();
        assert_eq!(second.count(FileStatus::Rebuilt), 1);
        assert_eq!(second.count(FileStatus::Unchanged), 3);
        assert_eq!(second.cache.compiled, 3);
        assert_eq!(
            state_titles(&tmp.path().join("state/recent.xml")),
            ["Second heat", "Lathe"]
        );
    }
}
