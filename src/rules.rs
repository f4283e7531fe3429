//! The rule table: maps a source path to the chain of stages that builds it.
//!
//! Rules are tried in declaration order and the first match wins, so
//! overlapping patterns are resolved by the order of the config file and
//! never by specificity.

use crate::canon::{is_normalized_relative, split_name};
use crate::error::NoMatch;
use crate::hash::ContentHash;
use crate::stage::{ByMode, Chain, Mode};

/// A glob over a path.
///
/// `*` matches a run of characters other than `/`, `**` matches any run,
/// `?` one character other than `/`, and `[...]` a character class (`[!...]`
/// negates, `a-z` is a range).  A pattern without `/` is matched against the
/// file name only.
#[derive(Debug, Clone)]
pub struct Pattern {
    glob: Vec<char>,
    whole_path: bool,
    nocase: bool,
}

impl Pattern {
    pub fn new(glob: &str, nocase: bool) -> Result<Self, String> {
        if glob.is_empty() {
            return Err("empty pattern".to_string());
        }
        let chars: Vec<char> = glob.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '[' {
                match class_end(&chars, i) {
                    Some(end) => i = end,
                    None => return Err(format!("unterminated '[' in pattern {:?}", glob)),
                }
            }
            i += 1;
        }
        Ok(Pattern {
            glob: chars,
            whole_path: glob.contains('/'),
            nocase,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        let subject = if self.whole_path {
            path
        } else {
            match path.rfind('/') {
                Some(idx) => &path[idx + 1..],
                None => path,
            }
        };
        let text: Vec<char> = subject.chars().collect();
        glob_match(&self.glob, &text, self.nocase)
    }
}

/// Index of the ']' closing the class opened at `start`.
fn class_end(pat: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if pat.get(i) == Some(&'!') {
        i += 1;
    }
    // A ']' right after the opening bracket is a literal member.
    if pat.get(i) == Some(&']') {
        i += 1;
    }
    while i < pat.len() {
        if pat[i] == ']' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn chars_eq(a: char, b: char, nocase: bool) -> bool {
    if nocase {
        a.eq_ignore_ascii_case(&b)
    } else {
        a == b
    }
}

fn class_matches(class: &[char], c: char, nocase: bool) -> bool {
    let (negated, members) = match class.first() {
        Some('!') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut found = false;
    let mut i = 0;
    while i < members.len() {
        if i + 2 < members.len() && members[i + 1] == '-' {
            let (lo, hi) = (members[i], members[i + 2]);
            let in_range = |c: char| lo <= c && c <= hi;
            if in_range(c)
                || (nocase
                    && (in_range(c.to_ascii_lowercase()) || in_range(c.to_ascii_uppercase())))
            {
                found = true;
            }
            i += 3;
        } else {
            if chars_eq(members[i], c, nocase) {
                found = true;
            }
            i += 1;
        }
    }
    found != negated
}

fn glob_match(pat: &[char], text: &[char], nocase: bool) -> bool {
    match pat.first() {
        None => text.is_empty(),
        Some('*') if pat.get(1) == Some(&'*') => {
            let rest = &pat[2..];
            // "**/" also matches zero directories.
            if rest.first() == Some(&'/') && glob_match(&rest[1..], text, nocase) {
                return true;
            }
            (0..=text.len()).any(|i| glob_match(rest, &text[i..], nocase))
        }
        Some('*') => {
            let rest = &pat[1..];
            for i in 0..=text.len() {
                if glob_match(rest, &text[i..], nocase) {
                    return true;
                }
                if i < text.len() && text[i] == '/' {
                    break;
                }
            }
            false
        }
        Some('?') => match text.first() {
            Some(&c) if c != '/' => glob_match(&pat[1..], &text[1..], nocase),
            _ => false,
        },
        Some('[') => {
            // Validated in Pattern::new.
            let end = match class_end(pat, 0) {
                Some(end) => end,
                None => return false,
            };
            match text.first() {
                Some(&c) if c != '/' && class_matches(&pat[1..end], c, nocase) => {
                    glob_match(&pat[end + 1..], &text[1..], nocase)
                }
                _ => false,
            }
        }
        Some(&p) => match text.first() {
            Some(&c) if chars_eq(p, c, nocase) => glob_match(&pat[1..], &text[1..], nocase),
            _ => false,
        },
    }
}

/// An output file name template with `[name]`, `[ext]` and `[hash]`
/// placeholders, e.g. "[name].[hash].[ext]".
#[derive(Debug, Clone, PartialEq)]
pub struct NameTemplate(String);

impl NameTemplate {
    pub fn parse(template: &str) -> Result<Self, String> {
        if template.is_empty() {
            return Err("empty name template".to_string());
        }
        let mut rest = template;
        while let Some(start) = rest.find('[') {
            let end = match rest[start..].find(']') {
                Some(end) => start + end,
                None => return Err(format!("unterminated placeholder in {:?}", template)),
            };
            match &rest[start + 1..end] {
                "name" | "ext" | "hash" => {}
                other => return Err(format!("unknown placeholder [{}]", other)),
            }
            rest = &rest[end + 1..];
        }
        Ok(NameTemplate(template.to_string()))
    }

    pub fn render(&self, stem: &str, ext: &str, hash: &ContentHash) -> String {
        let mut name = self
            .0
            .replace("[name]", stem)
            .replace("[ext]", ext)
            .replace("[hash]", &hash.short());
        // "[name].[ext]" on a file without extension.
        if ext.is_empty() && name.ends_with('.') {
            name.pop();
        }
        name
    }
}

impl Default for NameTemplate {
    fn default() -> Self {
        NameTemplate("[name].[ext]".to_string())
    }
}

pub struct Rule {
    pub name: String,
    patterns: Vec<Pattern>,
    excludes: Vec<Pattern>,
    chains: ByMode<Chain>,
    names: ByMode<NameTemplate>,
    /// Output directory replacing the source directory, e.g. "images".
    pub outdir: Option<String>,
    /// Extension of the primary output, if it differs from the source's.
    pub ext: Option<String>,
    /// False for files only ever inlined into others, e.g. sass partials.
    pub emit: bool,
}

impl Rule {
    pub fn new(name: &str, patterns: Vec<Pattern>, chains: ByMode<Chain>) -> Self {
        Rule {
            name: name.to_string(),
            patterns,
            excludes: Vec::new(),
            chains,
            names: ByMode::same(NameTemplate::default()),
            outdir: None,
            ext: None,
            emit: true,
        }
    }

    pub fn with_excludes(mut self, excludes: Vec<Pattern>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_names(mut self, names: ByMode<NameTemplate>) -> Self {
        self.names = names;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path)) && !self.excludes.iter().any(|p| p.matches(path))
    }

    pub fn chain(&self, mode: Mode) -> &Chain {
        self.chains.get(mode)
    }

    pub fn name_template(&self, mode: Mode) -> &NameTemplate {
        self.names.get(mode)
    }

    /// Whether the stage list differs between development and production.
    pub fn is_mode_sensitive(&self) -> bool {
        self.chains.development != self.chains.production
    }

    /// Output path for content built from `source`, with extension `ext`.
    pub fn output_path(&self, mode: Mode, source: &str, ext: &str, hash: &ContentHash) -> String {
        output_path(self.name_template(mode), self.outdir.as_deref(), source, ext, hash)
    }
}

/// Output path of `source` under `template`, placed in `outdir` if given or
/// in the source's own directory otherwise.
pub fn output_path(
    template: &NameTemplate,
    outdir: Option<&str>,
    source: &str,
    ext: &str,
    hash: &ContentHash,
) -> String {
    let (stem, _) = split_name(source);
    let name = template.render(stem, ext, hash);
    let dir = match outdir {
        Some(dir) => dir,
        None => crate::canon::dirname(source),
    };
    if dir.is_empty() {
        name
    } else {
        format!("{}/{}", dir, name)
    }
}

/// The result of resolving a path: the winning rule and its index.
pub struct Match<'a> {
    pub index: usize,
    pub rule: &'a Rule,
}

impl<'a> Match<'a> {
    pub fn chain(&self, mode: Mode) -> &'a Chain {
        self.rule.chain(mode)
    }
}

#[derive(Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleTable { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> &Rule {
        &self.rules[index]
    }

    /// Find the first rule matching `path`, which must be a normalized
    /// relative path.
    pub fn resolve(&self, path: &str) -> Result<Match<'_>, NoMatch> {
        if is_normalized_relative(path) {
            for (index, rule) in self.rules.iter().enumerate() {
                if rule.matches(path) {
                    return Ok(Match { index, rule });
                }
            }
        }
        Err(NoMatch {
            path: path.to_string(),
        })
    }

    /// Resolve `path` to its stage chain under `mode`.
    pub fn resolve_chain(&self, path: &str, mode: Mode) -> Result<&Chain, NoMatch> {
        self.resolve(path).map(|m| m.chain(mode))
    }
}
