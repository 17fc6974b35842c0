//! Site configuration module.
//!
//! Handles loading and validating `xmlforge.toml`. One file describes the
//! whole site: the namespace prefixes used by path expressions, the named
//! rules that turn source documents into output files, and the named
//! scanners that walk directories and dispatch files to rules.
//!
//! ## Configuration Options
//!
//! ```toml
//! [namespaces]
//! x = "http://www.w3.org/1999/xhtml"   # prefix → URI for every path expression
//!
//! [rules.page]
//! extension = ".html"      # output extension replacing the matched suffix
//! encoding = "utf-8"       # any WHATWG label
//! strip = false            # strip leading whitespace from every line
//! empty_tags = []          # tags allowed to stay self-closing
//! preserve_tags = ["pre"]  # tags whose content `strip` leaves alone
//! header = "<!DOCTYPE html>"
//! params = { lang = "en" }
//!
//! [[rules.page.replacements]]
//! find = "&nbsp;"
//! replace = "&#160;"
//!
//! [[rules.page.transforms]]
//! root = "post"            # omit to match any root element
//! program = "xsl/post.xsl"
//! state = { year = "/post/@year", month = "/post/@month", day = "/post/@day",
//!           title = "/post/title", summary = "/post/summary", tag = "/post/tag" }
//!
//! [scanners.site]
//! source = "content"
//! target = "public"
//! profiles = []            # empty = every profile
//! include = []
//! exclude = ["^drafts/"]
//! matches = [{ suffix = ".xml", rule = "page" }, { suffix = ".png", action = "link" }]
//! state = { dir = "state", pagination = 10, recent = "recent", tags = "tags" }
//!
//! [build]
//! jobs = 4                 # omit for one worker per core
//! ```
//!
//! Relative paths resolve against the directory holding the file. Unknown
//! keys are rejected to catch typos early.

use crate::params::{Params, slashed};
use crate::xml::{CompiledPath, Namespaces};
use encoding_rs::Encoding;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "xmlforge.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Whole-site configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Prefix → namespace URI bindings for every path expression.
    pub namespaces: Namespaces,
    pub rules: BTreeMap<String, RuleConfig>,
    /// Scanners run in name order.
    pub scanners: BTreeMap<String, ScannerConfig>,
    pub build: BuildConfig,
}

/// One named rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConfig {
    pub extension: String,
    pub encoding: String,
    pub strip: bool,
    pub empty_tags: Vec<String>,
    pub preserve_tags: Vec<String>,
    pub replacements: Vec<Replacement>,
    pub header: Option<String>,
    pub footer: Option<String>,
    pub header_file: Option<PathBuf>,
    pub footer_file: Option<PathBuf>,
    /// Encoding of `header_file` / `footer_file`.
    pub template_encoding: String,
    pub params: Params,
    pub transforms: Vec<TransformConfig>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            extension: ".html".to_string(),
            encoding: "utf-8".to_string(),
            strip: false,
            empty_tags: Vec::new(),
            preserve_tags: Vec::new(),
            replacements: Vec::new(),
            header: None,
            footer: None,
            header_file: None,
            footer_file: None,
            template_encoding: "utf-8".to_string(),
            params: Params::new(),
            transforms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replacement {
    pub find: String,
    pub replace: String,
}

/// A transform program bound to a document root element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Root element local name; `None` matches every document.
    #[serde(default)]
    pub root: Option<String>,
    pub program: PathBuf,
    #[serde(default)]
    pub state: Option<ExtractConfig>,
}

/// Path expressions locating state fields in a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractConfig {
    /// Selects one node per candidate record; the fields below are then
    /// evaluated relative to it.
    #[serde(default)]
    pub entry: Option<String>,
    pub year: String,
    pub month: String,
    pub day: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub bookmark: Option<String>,
}

impl ExtractConfig {
    fn expressions(&self) -> impl Iterator<Item = &str> {
        [
            self.entry.as_deref(),
            Some(self.year.as_str()),
            Some(self.month.as_str()),
            Some(self.day.as_str()),
            Some(self.title.as_str()),
            Some(self.summary.as_str()),
            self.tag.as_deref(),
            self.bookmark.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// One named scanner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    pub source: PathBuf,
    pub target: PathBuf,
    pub profiles: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub matches: Vec<MatchConfig>,
    pub params: Params,
    pub state: Option<StateOutputConfig>,
    /// Source directory as written, recorded on every state entry.
    #[serde(skip)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchConfig {
    /// Literal suffix of the relative path; empty matches every file.
    pub suffix: String,
    pub rule: Option<String>,
    pub action: Option<ActionConfig>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            suffix: ".xml".to_string(),
            rule: None,
            action: None,
        }
    }
}

/// Non-transform match actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionConfig {
    /// Symlink the source file into the target tree.
    Link,
}

/// Where and how a scanner publishes its state pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateOutputConfig {
    pub dir: PathBuf,
    /// Entries per page; values below 2 are raised to 2.
    pub pagination: usize,
    /// Base name of the chronological stream.
    pub recent: String,
    /// Base name of the tag index.
    pub tags: String,
}

impl Default for StateOutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            pagination: 10,
            recent: "recent".to_string(),
            tags: "tags".to_string(),
        }
    }
}

/// Build settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Maximum number of parallel build workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub jobs: Option<usize>,
}

/// Resolve the effective worker count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)`, at least 1
pub fn effective_jobs(config: &BuildConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.jobs.map(|n| n.clamp(1, cores)).unwrap_or(cores)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

/// True if `name` can be used as a single file name component.
pub fn is_file_safe(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl SiteConfig {
    /// Check cross references, patterns, encodings and expressions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rule) in &self.rules {
            rule.validate(name, &self.namespaces)?;
        }
        for (name, scanner) in &self.scanners {
            scanner.validate(name, &self.rules)?;
        }
        check_shared_state(
            self.scanners
                .iter()
                .filter_map(|(name, scanner)| Some((name.as_str(), scanner.state.as_ref()?))),
        )?;
        if self.build.jobs == Some(0) {
            return Err(invalid("build.jobs must be at least 1"));
        }
        Ok(())
    }

    /// Make every relative path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for rule in self.rules.values_mut() {
            for file in [&mut rule.header_file, &mut rule.footer_file].into_iter().flatten() {
                join(file);
            }
            for transform in &mut rule.transforms {
                join(&mut transform.program);
            }
        }
        for scanner in self.scanners.values_mut() {
            join(&mut scanner.source);
            join(&mut scanner.target);
            if let Some(state) = &mut scanner.state {
                join(&mut state.dir);
            }
        }
    }
}

impl RuleConfig {
    fn validate(&self, name: &str, namespaces: &Namespaces) -> Result<(), ConfigError> {
        for label in [&self.encoding, &self.template_encoding] {
            if Encoding::for_label(label.as_bytes()).is_none() {
                return Err(invalid(format!("rules.{name}: unknown encoding `{label}`")));
            }
        }
        if self.header.is_some() && self.header_file.is_some() {
            return Err(invalid(format!(
                "rules.{name}: header and header_file are mutually exclusive"
            )));
        }
        if self.footer.is_some() && self.footer_file.is_some() {
            return Err(invalid(format!(
                "rules.{name}: footer and footer_file are mutually exclusive"
            )));
        }
        if self.transforms.is_empty() {
            return Err(invalid(format!("rules.{name}.transforms must not be empty")));
        }
        let last = self.transforms.len() - 1;
        for (i, transform) in self.transforms.iter().enumerate() {
            if transform.root.is_none() && i != last {
                return Err(invalid(format!(
                    "rules.{name}.transforms[{i}]: an entry without `root` must come last"
                )));
            }
            if let Some(state) = &transform.state {
                for expr in state.expressions() {
                    CompiledPath::compile(expr, namespaces).map_err(|e| {
                        invalid(format!("rules.{name}.transforms[{i}].state: {e}"))
                    })?;
                }
            }
        }
        if self.replacements.iter().any(|r| r.find.is_empty()) {
            return Err(invalid(format!(
                "rules.{name}.replacements: `find` must not be empty"
            )));
        }
        Ok(())
    }
}

impl ScannerConfig {
    fn validate(
        &self,
        name: &str,
        rules: &BTreeMap<String, RuleConfig>,
    ) -> Result<(), ConfigError> {
        if self.source.as_os_str().is_empty() || self.target.as_os_str().is_empty() {
            return Err(invalid(format!(
                "scanners.{name}: source and target are required"
            )));
        }
        for pattern in self.include.iter().chain(&self.exclude) {
            Regex::new(pattern)
                .map_err(|e| invalid(format!("scanners.{name}: bad pattern `{pattern}`: {e}")))?;
        }
        if self.matches.is_empty() {
            return Err(invalid(format!("scanners.{name}.matches must not be empty")));
        }
        for (i, m) in self.matches.iter().enumerate() {
            match (&m.rule, m.action) {
                (None, None) => {
                    return Err(invalid(format!(
                        "scanners.{name}.matches[{i}]: needs a `rule` or an `action`"
                    )));
                }
                (Some(rule), _) if !rules.contains_key(rule) => {
                    return Err(invalid(format!(
                        "scanners.{name}.matches[{i}]: unknown rule `{rule}`"
                    )));
                }
                _ => {}
            }
        }
        if let Some(state) = &self.state {
            state.validate(&format!("scanners.{name}.state"))?;
        }
        Ok(())
    }
}

impl StateOutputConfig {
    pub fn validate(&self, at: &str) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(invalid(format!("{at}.dir must not be empty")));
        }
        for name in [&self.recent, &self.tags] {
            if !is_file_safe(name) {
                return Err(invalid(format!("{at}: `{name}` is not a usable file name")));
            }
        }
        if self.recent == self.tags {
            return Err(invalid(format!(
                "{at}: recent and tags must have different names"
            )));
        }
        Ok(())
    }
}

/// Scanners publishing to one directory share their pages, so they must agree
/// on page names and page size.
pub fn check_shared_state<'a>(
    outputs: impl IntoIterator<Item = (&'a str, &'a StateOutputConfig)>,
) -> Result<(), ConfigError> {
    let mut by_dir: BTreeMap<&Path, (&str, &StateOutputConfig)> = BTreeMap::new();
    for (name, state) in outputs {
        match by_dir.entry(state.dir.as_path()) {
            Entry::Vacant(slot) => {
                slot.insert((name, state));
            }
            Entry::Occupied(slot) => {
                let (first, seen) = *slot.get();
                if seen.recent != state.recent
                    || seen.tags != state.tags
                    || seen.pagination != state.pagination
                {
                    return Err(invalid(format!(
                        "scanners.{first}.state and scanners.{name}.state share dir `{}` but not their page settings",
                        state.dir.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Parse and validate configuration text. Paths stay as written.
pub fn parse_config(text: &str) -> Result<SiteConfig, ConfigError> {
    let mut config: SiteConfig = toml::from_str(text)?;
    config.validate()?;
    for scanner in config.scanners.values_mut() {
        scanner.label = slashed(&scanner.source);
    }
    Ok(config)
}

/// Load, validate and resolve the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<SiteConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_config(&text)?;
    let base = path.parent().unwrap_or(Path::new(""));
    config.resolve_paths(base);
    Ok(config)
}

/// A documented stock configuration, printed by `xmlforge gen-config`.
pub fn stock_config_toml() -> &'static str {
    r##"# xmlforge Configuration
# ======================
# Relative paths are resolved against the directory holding this file.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Namespace prefixes available to every path expression
# ---------------------------------------------------------------------------
[namespaces]
# x = "http://www.w3.org/1999/xhtml"

# ---------------------------------------------------------------------------
# Rules: how one source document becomes one output file
# ---------------------------------------------------------------------------
[rules.page]
# Extension that replaces the matched suffix in the output name.
extension = ".html"

# Output encoding (any WHATWG label). Characters the encoding cannot
# represent are written as numeric character references.
encoding = "utf-8"

# Remove leading whitespace from every output line.
strip = false

# Tags allowed to stay self-closing. When non-empty, every other
# self-closing tag is written as an explicit open/close pair.
empty_tags = ["br", "hr", "img", "link", "meta", "input"]

# Tags whose content is left untouched by `strip`.
preserve_tags = ["pre", "textarea"]

# Text placed before / after the output. `@name@` expands to a transform
# parameter and `@@` to a literal `@`. Use header_file / footer_file to
# read the text from a file instead (not both).
header = "<!DOCTYPE html>"
# footer = ""
# header_file = "templates/header.txt"
# footer_file = "templates/footer.txt"
# template_encoding = "utf-8"

# Default transform parameters.
params = { lang = "en" }

# Literal find/replace pairs applied in order.
[[rules.page.replacements]]
find = "&#160;"
replace = "&nbsp;"

# Transform programs, picked by the root element of the source document.
# The first matching entry wins; an entry without `root` matches anything
# and must come last.
[[rules.page.transforms]]
root = "post"
program = "xsl/post.xsl"

# State fields for this document type. `entry`, `tag` and `bookmark` are
# optional; with `entry` set, the other expressions are relative to each
# node it selects.
[rules.page.transforms.state]
year = "/post/date/@year"
month = "/post/date/@month"
day = "/post/date/@day"
title = "/post/title"
summary = "/post/summary"
tag = "/post/tag"

[[rules.page.transforms]]
program = "xsl/page.xsl"

# ---------------------------------------------------------------------------
# Scanners: which directories to walk and what to do with each file
# ---------------------------------------------------------------------------
[scanners.site]
source = "content"
target = "public"

# Profiles this scanner runs under; empty means every profile.
profiles = []

# Regular expressions searched in the `/`-separated relative path.
include = []
exclude = ["^drafts/"]

# Default transform parameters for files found by this scanner.
params = {}

# Every entry whose suffix ends the relative path runs. `action = "link"`
# symlinks the source file into the target tree.
[[scanners.site.matches]]
suffix = ".xml"
rule = "page"

[[scanners.site.matches]]
suffix = ".png"
action = "link"

# Paginated state listings built from the documents' state fields.
[scanners.site.state]
dir = "public/state"
pagination = 10
recent = "recent"
tags = "tags"

# ---------------------------------------------------------------------------
# Build
# ---------------------------------------------------------------------------
[build]
# Maximum parallel workers (omit for one per CPU core).
# jobs = 4
"##
}
