//! Text passes applied to serialized transform output.
//!
//! In order:
//!
//! 1. trim, then drop a leading `<?...?>` declaration and a leading
//!    `<!DOCTYPE ...>`
//! 2. expand self-closing tags not listed in `empty_tags` (`<div/>` →
//!    `<div></div>`), only when `empty_tags` is non-empty
//! 3. literal find/replace pairs
//! 4. with `strip`, remove leading whitespace from every line outside the
//!    `preserve_tags` elements
//! 5. prepend the header and append the footer, each joined by a newline,
//!    after expanding `@name@` placeholders from the transform parameters
//!    (`@@` is a literal `@`)

use crate::config::Replacement;
use crate::params::Params;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;

static SELF_CLOSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([a-zA-Z0-9:]*?)((\s[^>]*?)?)/>").expect("static pattern")
});

static LINE_INDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s+").expect("static pattern"));

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([a-zA-Z0-9]*)@").expect("static pattern"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown placeholder `@{0}@` in header or footer")]
pub struct UnknownPlaceholder(pub String);

#[derive(Debug, Clone)]
pub struct PostProcess {
    strip: bool,
    empty_tags: Vec<String>,
    preserve: Option<Regex>,
    replacements: Vec<Replacement>,
    header: String,
    footer: String,
}

impl PostProcess {
    pub fn new(
        strip: bool,
        empty_tags: &[String],
        preserve_tags: &[String],
        replacements: &[Replacement],
        header: &str,
        footer: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            strip,
            empty_tags: empty_tags.iter().map(|t| t.to_lowercase()).collect(),
            preserve: preserve_pattern(preserve_tags)?,
            replacements: replacements.to_vec(),
            header: header.trim().to_string(),
            footer: footer.trim().to_string(),
        })
    }

    pub fn apply(&self, output: &str, params: &Params) -> Result<String, UnknownPlaceholder> {
        let mut text = strip_prolog(output.trim()).to_string();

        if !self.empty_tags.is_empty() {
            text = self.expand_self_closing(&text);
        }
        for r in &self.replacements {
            text = text.replace(&r.find, &r.replace);
        }
        if self.strip {
            text = self.strip_indent(&text);
        }

        if !self.header.is_empty() {
            text = format!("{}\n{}", expand(&self.header, params)?, text);
        }
        if !self.footer.is_empty() {
            text = format!("{}\n{}", text, expand(&self.footer, params)?);
        }
        Ok(text)
    }

    fn expand_self_closing(&self, text: &str) -> String {
        SELF_CLOSING
            .replace_all(text, |caps: &Captures| {
                let name = &caps[1];
                if name.is_empty() || self.empty_tags.contains(&name.to_lowercase()) {
                    caps[0].to_string()
                } else {
                    format!("<{}{}></{}>", name, &caps[2], name)
                }
            })
            .into_owned()
    }

    fn strip_indent(&self, text: &str) -> String {
        let Some(preserve) = &self.preserve else {
            return strip_lines(text, true);
        };
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        for m in preserve.find_iter(text) {
            out.push_str(&strip_lines(&text[pos..m.start()], pos == 0));
            out.push_str(m.as_str());
            pos = m.end();
        }
        out.push_str(&strip_lines(&text[pos..], pos == 0));
        out
    }
}

/// Strip line indentation in `segment`. A segment that continues a line
/// keeps everything up to its first newline.
fn strip_lines(segment: &str, at_line_start: bool) -> String {
    if at_line_start {
        return LINE_INDENT.replace_all(segment, "").into_owned();
    }
    match segment.find('\n') {
        Some(nl) => {
            let (head, rest) = segment.split_at(nl + 1);
            format!("{}{}", head, LINE_INDENT.replace_all(rest, ""))
        }
        None => segment.to_string(),
    }
}

/// One alternative per tag, so each closing tag pairs with its opening tag.
fn preserve_pattern(tags: &[String]) -> Result<Option<Regex>, regex::Error> {
    if tags.is_empty() {
        return Ok(None);
    }
    let alternatives: Vec<String> = tags
        .iter()
        .map(|tag| {
            let tag = regex::escape(tag);
            format!(r"<{tag}(?:>|\s[^>]*?>).*?</{tag}>")
        })
        .collect();
    Regex::new(&format!("(?si){}", alternatives.join("|"))).map(Some)
}

fn strip_prolog(mut text: &str) -> &str {
    if text.starts_with("<?")
        && let Some(end) = text.find("?>")
    {
        text = text[end + 2..].trim_start();
    }
    if text.starts_with("<!")
        && !text.starts_with("<!--")
        && let Some(end) = text.find('>')
    {
        text = text[end + 1..].trim_start();
    }
    text
}

/// Expand `@name@` from `params`; `@@` is a literal `@`.
pub fn expand(template: &str, params: &Params) -> Result<String, UnknownPlaceholder> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        match name.as_str() {
            "" => out.push('@'),
            key => match params.get(key) {
                Some(value) => out.push_str(value),
                None => return Err(UnknownPlaceholder(key.to_string())),
            },
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn plain() -> PostProcess {
        PostProcess::new(false, &[], &[], &[], "", "").unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Prolog
    // =========================================================================

    #[test]
    fn drops_declaration_and_doctype() {
        let out = plain()
            .apply(
                "  <?xml version=\"1.0\"?>\n<!DOCTYPE html>\n<html/>\n",
                &Params::new(),
            )
            .unwrap();
        assert_eq!(out, "<html/>");
    }

    #[test]
    fn keeps_leading_comment() {
        let out = plain().apply("<!-- hi --><p/>", &Params::new()).unwrap();
        assert_eq!(out, "<!-- hi --><p/>");
    }

    // =========================================================================
    // Self-closing tags
    // =========================================================================

    #[test]
    fn expands_tags_not_allowed_empty() {
        let pp = PostProcess::new(false, &tags(&["br", "img"]), &[], &[], "", "").unwrap();
        let out = pp
            .apply(
                r#"<div class="x"/><br/><IMG src="a.png" /><script src="s.js"/>"#,
                &Params::new(),
            )
            .unwrap();
        assert_eq!(
            out,
            r#"<div class="x"></div><br/><IMG src="a.png" /><script src="s.js"></script>"#
        );
    }

    #[test]
    fn empty_list_leaves_self_closing_tags() {
        let out = plain().apply("<div/>", &Params::new()).unwrap();
        assert_eq!(out, "<div/>");
    }

    // =========================================================================
    // Replacements
    // =========================================================================

    #[test]
    fn replacements_apply_in_order() {
        let reps = vec![
            Replacement {
                find: "a".into(),
                replace: "b".into(),
            },
            Replacement {
                find: "bb".into(),
                replace: "c".into(),
            },
        ];
        let pp = PostProcess::new(false, &[], &[], &reps, "", "").unwrap();
        assert_eq!(pp.apply("<p>ab</p>", &Params::new()).unwrap(), "<p>c</p>");
    }

    // =========================================================================
    // Strip
    // =========================================================================

    #[test]
    fn strip_removes_indentation_and_blank_lines() {
        let pp = PostProcess::new(true, &[], &[], &[], "", "").unwrap();
        let out = pp
            .apply("<ul>\n    <li>a</li>\n\n    <li>b</li>\n</ul>", &Params::new())
            .unwrap();
        assert_eq!(out, "<ul>\n<li>a</li>\n<li>b</li>\n</ul>");
    }

    #[test]
    fn strip_preserves_listed_tags() {
        let pp = PostProcess::new(true, &[], &tags(&["pre"]), &[], "", "").unwrap();
        let src = "<div>\n  <pre class=\"c\">\n  keep\n    this\n</pre>\n  <p>x</p>\n</div>";
        let out = pp.apply(src, &Params::new()).unwrap();
        assert_eq!(
            out,
            "<div>\n<pre class=\"c\">\n  keep\n    this\n</pre>\n<p>x</p>\n</div>"
        );
    }

    #[test]
    fn preserve_does_not_match_longer_tag_names() {
        let pp = PostProcess::new(true, &[], &tags(&["pre"]), &[], "", "").unwrap();
        let out = pp
            .apply("<prefix>\n  a\n</prefix>", &Params::new())
            .unwrap();
        assert_eq!(out, "<prefix>\na\n</prefix>");
    }

    // =========================================================================
    // Header and footer
    // =========================================================================

    #[test]
    fn header_and_footer_wrap_output() {
        let pp = PostProcess::new(
            false,
            &[],
            &[],
            &[],
            "  <!DOCTYPE html>\n",
            "<!-- @profile@ build, mail me @@ home -->",
        )
        .unwrap();
        let out = pp
            .apply("<html/>", &params(&[("profile", "web")]))
            .unwrap();
        assert_eq!(
            out,
            "<!DOCTYPE html>\n<html/>\n<!-- web build, mail me @ home -->"
        );
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let pp = PostProcess::new(false, &[], &[], &[], "@nope@", "").unwrap();
        assert_eq!(
            pp.apply("<p/>", &Params::new()),
            Err(UnknownPlaceholder("nope".into()))
        );
    }

    #[test]
    fn expand_leaves_unmatched_at_signs() {
        assert_eq!(
            expand("a@b.c and @x@", &params(&[("x", "1")])).unwrap(),
            "a@b.c and 1"
        );
    }
}
