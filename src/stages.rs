//! Built-in stages.
//!
//! These are deliberately simple text transforms, enough to drive real
//! pipelines (reference discovery, extraction, minification) without pulling
//! in language parsers.  Anything more serious is registered as a plugin.

use crate::stage::{Stage, StageContext, StageOutput, StageRegistry};
use anyhow::{bail, Context};
use std::sync::Arc;

fn utf8(input: &[u8]) -> anyhow::Result<&str> {
    std::str::from_utf8(input).context("input is not UTF-8")
}

/// Passes content through unchanged.
pub struct Passthrough;
impl Stage for Passthrough {
    fn id(&self) -> &str {
        "copy"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::new(input.to_vec()))
    }
}

/// Whether an attribute value names a file in the source tree, as opposed to
/// an absolute URL, inline data, or a fragment.
fn is_local_ref(value: &str) -> bool {
    const SCHEMES: [&str; 4] = ["data:", "mailto:", "tel:", "javascript:"];
    !value.is_empty()
        && !value.starts_with('#')
        && !value.starts_with("//")
        && !value.contains("://")
        && !SCHEMES.iter().any(|s| value.starts_with(s))
}

/// Values of quoted `src` and `href` attributes.
fn html_refs(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut refs: Vec<String> = Vec::new();
    let mut i = 1;
    'scan: while i < bytes.len() {
        if !bytes[i - 1].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        for attr in [&b"src"[..], &b"href"[..]] {
            if !bytes[i..].starts_with(attr) {
                continue;
            }
            let mut j = i + attr.len();
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            if bytes.get(j) != Some(&b'=') {
                continue;
            }
            j += 1;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            let quote = match bytes.get(j) {
                Some(&q) if q == b'"' || q == b'\'' => q,
                _ => continue,
            };
            let start = j + 1;
            let end = match bytes[start..].iter().position(|&c| c == quote) {
                Some(len) => start + len,
                None => break 'scan,
            };
            let value = &text[start..end];
            if is_local_ref(value) && !refs.iter().any(|r| r == value) {
                refs.push(value.to_string());
            }
            i = end + 1;
            continue 'scan;
        }
        i += 1;
    }
    refs
}

/// Finds `src` and `href` references; content passes through, with the
/// references rewritten on emission.
pub struct HtmlRefs;
impl Stage for HtmlRefs {
    fn id(&self) -> &str {
        "html-refs"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::new(input.to_vec()))
    }
    fn scan(&self, input: &[u8]) -> Vec<String> {
        html_refs(&String::from_utf8_lossy(input))
    }
    fn rewrites(&self) -> bool {
        true
    }
}

/// Drops comments and collapses whitespace, removing it entirely between
/// tags.
fn minify_html(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        stripped.push_str(&rest[..start]);
        rest = match rest[start..].find("-->") {
            Some(end) => &rest[start + end + 3..],
            None => "",
        };
    }
    stripped.push_str(rest);

    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            if !out.is_empty() && !(c == '<' && out.ends_with('>')) {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(c);
    }
    out
}

pub struct HtmlMinify;
impl Stage for HtmlMinify {
    fn id(&self) -> &str {
        "html-minify"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::new(minify_html(utf8(input)?).into_bytes()))
    }
}

/// Quoted strings on a line, in order.
fn quoted(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find(|c| c == '"' || c == '\'') {
        let quote = &rest[start..start + 1];
        let body = &rest[start + 1..];
        match body.find(quote) {
            Some(end) => {
                out.push(&body[..end]);
                rest = &body[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Removes a `//` comment, leaving `://` in URLs alone.
fn strip_line_comment(line: &str) -> &str {
    let mut from = 0;
    while let Some(idx) = line[from..].find("//") {
        let idx = from + idx;
        if idx > 0 && line.as_bytes()[idx - 1] == b':' {
            from = idx + 2;
            continue;
        }
        return line[..idx].trim_end();
    }
    line
}

/// A stand-in for a sass compiler: strips line comments and checks that
/// braces balance.  Imports are reported by `scan` so that edits to partials
/// rebuild their importers.
pub struct Sass;
impl Stage for Sass {
    fn id(&self) -> &str {
        "sass"
    }

    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        let text = utf8(input)?;
        let mut out = String::with_capacity(text.len());
        let mut open: Vec<usize> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = strip_line_comment(line);
            for c in line.chars() {
                match c {
                    '{' => open.push(n + 1),
                    '}' => {
                        if open.pop().is_none() {
                            bail!("unexpected '}}' at line {}", n + 1);
                        }
                    }
                    _ => {}
                }
            }
            if !line.trim().is_empty() {
                out.push_str(line);
                out.push('\n');
            }
        }
        if let Some(line) = open.pop() {
            bail!("unclosed '{{' opened at line {}", line);
        }
        Ok(StageOutput::new(out.into_bytes()))
    }

    fn scan(&self, input: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(input);
        let mut refs = Vec::new();
        for line in text.lines() {
            let line = line.trim_start();
            let rest = match line
                .strip_prefix("@import")
                .or_else(|| line.strip_prefix("@use"))
            {
                Some(rest) => rest,
                None => continue,
            };
            for path in quoted(strip_line_comment(rest)) {
                if is_local_ref(path) {
                    refs.push(path.to_string());
                }
            }
        }
        refs
    }
}

/// Moves the content into a separate `css` file, leaving the primary output
/// empty.
pub struct CssExtract;
impl Stage for CssExtract {
    fn id(&self) -> &str {
        "css-extract"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::new(Vec::new()).with_side("css", input.to_vec()))
    }
}

fn minify_css(text: &str) -> String {
    const PUNCT: &[char] = &['{', '}', ':', ';', ','];
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut pending_space = false;
    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            '"' | '\'' => {
                if pending_space && !out.is_empty() && !out.ends_with(PUNCT) {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                for s in chars.by_ref() {
                    out.push(s);
                    if s == c {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_space && !out.is_empty() && !out.ends_with(PUNCT) && !PUNCT.contains(&c)
                {
                    out.push(' ');
                }
                pending_space = false;
                if c == '}' && out.ends_with(';') {
                    out.pop();
                }
                out.push(c);
            }
        }
    }
    out
}

pub struct CssMinify;
impl Stage for CssMinify {
    fn id(&self) -> &str {
        "css-minify"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::new(minify_css(utf8(input)?).into_bytes()))
    }
}

/// Strips trailing whitespace and blank lines.
pub struct JsTrim;
impl Stage for JsTrim {
    fn id(&self) -> &str {
        "js-trim"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        let text = utf8(input)?;
        let mut out = String::with_capacity(text.len());
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            out.push_str(line);
            out.push('\n');
        }
        Ok(StageOutput::new(out.into_bytes()))
    }
}

/// A registry holding every built-in stage.
pub fn builtin_registry() -> anyhow::Result<StageRegistry> {
    let stages: [Arc<dyn Stage>; 7] = [
        Arc::new(Passthrough),
        Arc::new(HtmlRefs),
        Arc::new(HtmlMinify),
        Arc::new(Sass),
        Arc::new(CssExtract),
        Arc::new(CssMinify),
        Arc::new(JsTrim),
    ];
    let mut registry = StageRegistry::new();
    for stage in stages {
        registry.register(stage)?;
    }
    Ok(registry)
}
