//! Shared test utilities for the xmlforge test suite.
//!
//! Provides fixture setup, file writing with controlled modification times,
//! and readers for published state pages.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = setup_fixtures();
//! let config = fixture_config(tmp.path());
//! // ... build ...
//! assert_eq!(state_titles(&tmp.path().join("state/recent.xml")), ["Second heat", "Lathe"]);
//! ```

use filetime::FileTime;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::config::{SiteConfig, load_config};
use crate::state::STATE_NS;
use crate::xml::{Document, Namespaces};

// =========================================================================
// Fixture setup
// =========================================================================

/// Copy `fixtures/site/` to a temp directory and return it.
///
/// Tests get an isolated copy they can mutate without affecting other tests
/// or the source fixtures.
pub fn setup_fixtures() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/site");
    copy_dir_recursive(&fixtures, tmp.path()).unwrap();
    tmp
}

/// Load the fixture configuration from a copied fixture tree.
pub fn fixture_config(root: &Path) -> SiteConfig {
    load_config(&root.join("xmlforge.toml")).unwrap()
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

// =========================================================================
// Files and timestamps
// =========================================================================

/// Write `content` at `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Set the modification time of `path` to `secs` after the epoch.
pub fn set_mtime(path: &Path, secs: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
}

/// Give every file under `root` the same old modification time.
pub fn age_tree(root: &Path, secs: i64) {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            set_mtime(entry.path(), secs);
        }
    }
}

// =========================================================================
// State pages
// =========================================================================

fn state_namespaces() -> Namespaces {
    Namespaces::from([("s".to_string(), STATE_NS.to_string())])
}

/// String values of `expr` evaluated on a state page; `s:` is the state
/// namespace.
pub fn state_strings(path: &Path, expr: &str) -> Vec<String> {
    let doc = Document::parse_file(path).unwrap();
    doc.evaluate(expr, &state_namespaces())
        .unwrap()
        .iter()
        .map(|item| doc.item_string(item))
        .collect()
}

/// Entry titles of a state page, in page order.
pub fn state_titles(path: &Path) -> Vec<String> {
    state_strings(path, "/s:state/s:entry/s:title")
}
