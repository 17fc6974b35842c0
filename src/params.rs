//! Transform parameters and their precedence.
//!
//! Every transform run receives one flat string map, merged from four layers
//! (later layers win):
//!
//! | Layer | Source |
//! |---|---|
//! | rule defaults | `[rules.<name>] params` |
//! | scanner defaults | `[scanners.<name>] params` |
//! | caller | `NAME=VALUE` arguments on the command line |
//! | reserved | computed per file by [`ReservedParams`] |
//!
//! Reserved parameters describe where the current file lives. Callers can
//! set a parameter with a reserved name, but the computed value always
//! replaces it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A flat name → value parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of `self`.
    pub fn extend(&mut self, other: &Params) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Parse `NAME=VALUE` arguments. Arguments without `=` are ignored;
    /// only the first `=` splits, so values may contain more.
    pub fn from_assignments<S: AsRef<str>>(args: &[S]) -> Self {
        args.iter()
            .filter_map(|arg| arg.as_ref().split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parameters computed for one file, injected last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedParams {
    pub sourceroot: String,
    pub targetroot: String,
    pub sourcedir: String,
    pub targetdir: String,
    pub sourcefile: String,
    pub targetfile: String,
    pub sourcerpath: String,
    pub targetrpath: String,
    pub relativeroot: String,
    pub profile: String,
}

/// Names a caller can never override.
pub const RESERVED_NAMES: [&str; 10] = [
    "sourceroot",
    "targetroot",
    "sourcedir",
    "targetdir",
    "sourcefile",
    "targetfile",
    "sourcerpath",
    "targetrpath",
    "relativeroot",
    "profile",
];

impl ReservedParams {
    /// Compute the reserved parameters for `relpath` (source side) built to
    /// `target_relpath`. Directories end in `/`; all paths use `/`.
    pub fn compute(
        source_root: &Path,
        target_root: &Path,
        relpath: &Path,
        target_relpath: &Path,
        profile: &str,
    ) -> Self {
        let sourcefile = source_root.join(relpath);
        let targetfile = target_root.join(target_relpath);
        let relpath = slashed(relpath);
        let depth = relpath.matches('/').count();

        Self {
            sourceroot: dir_slashed(source_root),
            targetroot: dir_slashed(target_root),
            sourcedir: dir_slashed(sourcefile.parent().unwrap_or(source_root)),
            targetdir: dir_slashed(targetfile.parent().unwrap_or(target_root)),
            sourcefile: slashed(&sourcefile),
            targetfile: slashed(&targetfile),
            targetrpath: slashed(target_relpath),
            relativeroot: "../".repeat(depth),
            sourcerpath: relpath,
            profile: profile.to_string(),
        }
    }

    fn pairs(&self) -> [(&'static str, &str); 10] {
        [
            ("sourceroot", self.sourceroot.as_str()),
            ("targetroot", self.targetroot.as_str()),
            ("sourcedir", self.sourcedir.as_str()),
            ("targetdir", self.targetdir.as_str()),
            ("sourcefile", self.sourcefile.as_str()),
            ("targetfile", self.targetfile.as_str()),
            ("sourcerpath", self.sourcerpath.as_str()),
            ("targetrpath", self.targetrpath.as_str()),
            ("relativeroot", self.relativeroot.as_str()),
            ("profile", self.profile.as_str()),
        ]
    }
}

/// The four parameter layers for one transform run.
#[derive(Debug, Clone, Copy)]
pub struct ParamLayers<'a> {
    pub rule: &'a Params,
    pub scanner: &'a Params,
    pub caller: &'a Params,
    pub reserved: &'a ReservedParams,
}

impl ParamLayers<'_> {
    /// Merge in precedence order: rule < scanner < caller < reserved.
    pub fn merge(&self) -> Params {
        let mut merged = self.rule.clone();
        merged.extend(self.scanner);
        merged.extend(self.caller);
        for (name, value) in self.reserved.pairs() {
            merged.insert(name, value);
        }
        merged
    }
}

/// A path with `/` separators.
pub fn slashed(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// A directory path with `/` separators and exactly one trailing `/`.
pub fn dir_slashed(path: &Path) -> String {
    let mut text = slashed(path).trim_end_matches('/').to_string();
    text.push('/');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn reserved(relpath: &str) -> ReservedParams {
        let target_rel = PathBuf::from(relpath).with_extension("html");
        ReservedParams::compute(
            Path::new("/site/src"),
            Path::new("/site/out/"),
            Path::new(relpath),
            &target_rel,
            "web",
        )
    }

    // =========================================================================
    // Reserved parameters
    // =========================================================================

    #[test]
    fn reserved_paths_are_slashed_and_dirs_terminated() {
        let r = reserved("blog/2020/post.xml");
        assert_eq!(r.sourceroot, "/site/src/");
        assert_eq!(r.targetroot, "/site/out/");
        assert_eq!(r.sourcedir, "/site/src/blog/2020/");
        assert_eq!(r.targetdir, "/site/out/blog/2020/");
        assert_eq!(r.sourcefile, "/site/src/blog/2020/post.xml");
        assert_eq!(r.targetfile, "/site/out/blog/2020/post.html");
        assert_eq!(r.sourcerpath, "blog/2020/post.xml");
        assert_eq!(r.targetrpath, "blog/2020/post.html");
        assert_eq!(r.profile, "web");
    }

    #[test]
    fn relativeroot_climbs_once_per_separator() {
        assert_eq!(reserved("index.xml").relativeroot, "");
        assert_eq!(reserved("a/index.xml").relativeroot, "../");
        assert_eq!(reserved("a/b/c/index.xml").relativeroot, "../../../");
    }

    #[test]
    fn top_level_file_dirs_are_the_roots() {
        let r = reserved("index.xml");
        assert_eq!(r.sourcedir, "/site/src/");
        assert_eq!(r.targetdir, "/site/out/");
    }

    // =========================================================================
    // Precedence
    // =========================================================================

    #[test]
    fn later_layers_win() {
        let rule = params(&[("a", "rule"), ("b", "rule"), ("c", "rule")]);
        let scanner = params(&[("b", "scanner"), ("c", "scanner")]);
        let caller = params(&[("c", "caller")]);
        let r = reserved("x.xml");

        let merged = ParamLayers {
            rule: &rule,
            scanner: &scanner,
            caller: &caller,
            reserved: &r,
        }
        .merge();

        assert_eq!(merged.get("a"), Some("rule"));
        assert_eq!(merged.get("b"), Some("scanner"));
        assert_eq!(merged.get("c"), Some("caller"));
        assert_eq!(merged.len(), 3 + RESERVED_NAMES.len());
    }

    #[test]
    fn reserved_names_cannot_be_overridden() {
        let caller = params(&[("profile", "hacked"), ("relativeroot", "/")]);
        let empty = Params::new();
        let r = reserved("a/b.xml");

        let merged = ParamLayers {
            rule: &empty,
            scanner: &empty,
            caller: &caller,
            reserved: &r,
        }
        .merge();

        assert_eq!(merged.get("profile"), Some("web"));
        assert_eq!(merged.get("relativeroot"), Some("../"));
        for name in RESERVED_NAMES {
            assert!(merged.get(name).is_some(), "missing reserved {name}");
        }
    }

    // =========================================================================
    // Command-line assignments
    // =========================================================================

    #[test]
    fn assignments_split_on_first_equals() {
        let p = Params::from_assignments(&["title=Hello", "expr=a=b", "bare", "empty="]);
        assert_eq!(p.get("title"), Some("Hello"));
        assert_eq!(p.get("expr"), Some("a=b"));
        assert_eq!(p.get("empty"), Some(""));
        assert_eq!(p.get("bare"), None);
        assert_eq!(p.len(), 3);
    }
}
