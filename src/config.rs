//! Loading assets.conf into a validated configuration: settings, entry
//! points, and the rule table with every stage id resolved.

use crate::canon::{canon_path, is_normalized_relative};
use crate::error::Error;
use crate::fs::FileSystem;
use crate::parse::{Attr, Parser, RuleDecl, Statement, Word};
use crate::rules::{NameTemplate, Pattern, Rule, RuleTable};
use crate::scanner::{format_parse_error, ParseError};
use crate::stage::{ByMode, Chain, StageRegistry};
use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with a discovered file no rule matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unmatched {
    /// Fail with NoMatch.
    Error,
    /// Emit the file verbatim.
    Copy,
}

pub struct Config {
    /// Directory source paths are relative to.
    pub root: PathBuf,
    /// Directory outputs are written under.
    pub out: PathBuf,
    pub unmatched: Unmatched,
    /// Remove the output directory before a one-shot build.
    pub clean: bool,
    pub cache_capacity: usize,
    /// How long watch mode waits for further changes before rebuilding.
    pub debounce: Duration,
    /// How often watch mode checks for a stop request while waiting for
    /// changes.
    pub poll: Duration,
    pub entries: Vec<String>,
    /// Files emitted verbatim, bypassing rules.
    pub copies: Vec<String>,
    /// (prefix, directory) pairs; a reference starting with prefix resolves
    /// under directory instead of relative to the referencing file.
    pub aliases: Vec<(String, String)>,
    pub rules: RuleTable,
}

impl Config {
    fn new() -> Self {
        Config {
            root: PathBuf::from("."),
            out: PathBuf::from("dist"),
            unmatched: Unmatched::Error,
            clean: false,
            cache_capacity: 4096,
            debounce: Duration::from_millis(100),
            poll: Duration::from_millis(200),
            entries: Vec::new(),
            copies: Vec::new(),
            aliases: Vec::new(),
            rules: RuleTable::new(Vec::new()),
        }
    }
}

/// Read and parse a config file.
pub fn load(fs: &dyn FileSystem, path: &Path, registry: &StageRegistry) -> anyhow::Result<Config> {
    let bytes = fs
        .read(path)
        .map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
    let text = String::from_utf8(bytes).map_err(|_| anyhow!("{}: not UTF-8", path.display()))?;
    parse(&path.display().to_string(), &text, registry)
}

fn find_attr<'d, 't>(decl: &'d RuleDecl<'t>, name: &str) -> Option<&'d Attr<'t>> {
    decl.attrs.iter().find(|a| a.name.text == name)
}

/// Builds a Config from statements, reporting errors against the text.
struct Builder<'a> {
    filename: &'a str,
    text: &'a str,
    registry: &'a StageRegistry,
}

impl<'a> Builder<'a> {
    fn error(&self, word: &Word, msg: impl Into<String>) -> anyhow::Error {
        anyhow!(format_parse_error(
            self.filename,
            self.text,
            ParseError::new(msg, word.ofs)
        ))
    }

    fn single<'t>(&self, name: &Word, values: &[Word<'t>]) -> anyhow::Result<Word<'t>> {
        match values {
            [value] => Ok(*value),
            _ => Err(self.error(name, format!("{} expects a single value", name.text))),
        }
    }

    fn flag(&self, name: &Word, values: &[Word]) -> anyhow::Result<bool> {
        let value = self.single(name, values)?;
        match value.text {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.error(&value, "expected true or false")),
        }
    }

    fn number(&self, name: &Word, values: &[Word]) -> anyhow::Result<u64> {
        let value = self.single(name, values)?;
        value
            .text
            .parse()
            .map_err(|_| self.error(&value, "expected a number"))
    }

    fn path(&self, word: &Word) -> anyhow::Result<String> {
        let path = canon_path(word.text);
        if !is_normalized_relative(&path) {
            return Err(self.error(word, "path must be relative to the root"));
        }
        Ok(path)
    }

    fn binding(&self, config: &mut Config, name: &Word, values: &[Word]) -> anyhow::Result<()> {
        match name.text {
            "root" => config.root = PathBuf::from(self.single(name, values)?.text),
            "out" => config.out = PathBuf::from(self.single(name, values)?.text),
            "unmatched" => {
                let value = self.single(name, values)?;
                config.unmatched = match value.text {
                    "error" => Unmatched::Error,
                    "copy" => Unmatched::Copy,
                    _ => return Err(self.error(&value, "expected error or copy")),
                }
            }
            "clean" => config.clean = self.flag(name, values)?,
            "cache_capacity" => config.cache_capacity = self.number(name, values)? as usize,
            "debounce_ms" => config.debounce = Duration::from_millis(self.number(name, values)?),
            "poll_ms" => config.poll = Duration::from_millis(self.number(name, values)?.max(1)),
            _ => return Err(self.error(name, format!("unknown setting {:?}", name.text))),
        }
        Ok(())
    }

    fn patterns(&self, values: &[Word], nocase: bool) -> anyhow::Result<Vec<Pattern>> {
        values
            .iter()
            .map(|word| Pattern::new(word.text, nocase).map_err(|msg| self.error(word, msg)))
            .collect()
    }

    fn chain(&self, rule: &Word, values: &[Word]) -> anyhow::Result<Chain> {
        let mut stages = Vec::with_capacity(values.len());
        for word in values {
            let stage = self.registry.get(word.text).ok_or_else(|| {
                let err = Error::UnknownStage {
                    rule: rule.text.to_string(),
                    stage: word.text.to_string(),
                };
                self.error(word, err.to_string())
            })?;
            stages.push(stage);
        }
        Ok(Chain::new(stages))
    }

    fn template(&self, name: &Word, values: &[Word]) -> anyhow::Result<NameTemplate> {
        let value = self.single(name, values)?;
        NameTemplate::parse(value.text).map_err(|msg| self.error(&value, msg))
    }

    fn rule(&self, decl: &RuleDecl) -> anyhow::Result<Rule> {
        let find = |name: &str| find_attr(decl, name);
        for (i, attr) in decl.attrs.iter().enumerate() {
            if decl.attrs[..i].iter().any(|a| a.name.text == attr.name.text) {
                return Err(self.error(&attr.name, format!("duplicate {:?}", attr.name.text)));
            }
            match attr.name.text {
                "match" | "exclude" | "nocase" | "stages" | "stages.production"
                | "stages.development" | "name" | "name.production" | "name.development"
                | "outdir" | "ext" | "emit" => {}
                other => {
                    return Err(self.error(&attr.name, format!("unknown rule attribute {:?}", other)))
                }
            }
        }

        let nocase = match find("nocase") {
            Some(attr) => self.flag(&attr.name, &attr.values)?,
            None => false,
        };
        let patterns = match find("match") {
            Some(attr) if !attr.values.is_empty() => self.patterns(&attr.values, nocase)?,
            _ => return Err(self.error(&decl.name, format!("rule {} has no match", decl.name.text))),
        };
        let excludes = match find("exclude") {
            Some(attr) => self.patterns(&attr.values, nocase)?,
            None => Vec::new(),
        };

        let base = match find("stages") {
            Some(attr) => Some(self.chain(&decl.name, &attr.values)?),
            None => None,
        };
        let per_mode = |name: &str| -> anyhow::Result<Chain> {
            match (find(name), &base) {
                (Some(attr), _) => self.chain(&decl.name, &attr.values),
                (None, Some(base)) => Ok(base.clone()),
                (None, None) => Err(self.error(
                    &decl.name,
                    format!("rule {} has no stages for {}", decl.name.text, name),
                )),
            }
        };
        let chains = ByMode {
            development: per_mode("stages.development")?,
            production: per_mode("stages.production")?,
        };

        let base_name = match find("name") {
            Some(attr) => self.template(&attr.name, &attr.values)?,
            None => NameTemplate::default(),
        };
        let name_for = |name: &str| -> anyhow::Result<NameTemplate> {
            match find(name) {
                Some(attr) => self.template(&attr.name, &attr.values),
                None => Ok(base_name.clone()),
            }
        };
        let names = ByMode {
            development: name_for("name.development")?,
            production: name_for("name.production")?,
        };

        let mut rule = Rule::new(decl.name.text, patterns, chains)
            .with_excludes(excludes)
            .with_names(names);
        if let Some(attr) = find("outdir") {
            let dir = self.single(&attr.name, &attr.values)?;
            rule.outdir = Some(self.path(&dir)?);
        }
        if let Some(attr) = find("ext") {
            let ext = self.single(&attr.name, &attr.values)?;
            rule.ext = Some(ext.text.trim_start_matches('.').to_string());
        }
        if let Some(attr) = find("emit") {
            rule.emit = self.flag(&attr.name, &attr.values)?;
        }
        Ok(rule)
    }
}

/// Parse config text; `filename` is used in error messages.
pub fn parse(filename: &str, text: &str, registry: &StageRegistry) -> anyhow::Result<Config> {
    let builder = Builder {
        filename,
        text,
        registry,
    };
    let mut config = Config::new();
    let mut rules: Vec<Rule> = Vec::new();
    let mut parser = Parser::new(text);
    loop {
        let stmt = match parser.read() {
            Ok(None) => break,
            Ok(Some(stmt)) => stmt,
            Err(err) => return Err(anyhow!(parser.format_parse_error(filename, err))),
        };
        match stmt {
            Statement::Binding { name, values } => builder.binding(&mut config, &name, &values)?,
            Statement::Entry(paths) => {
                for word in &paths {
                    config.entries.push(builder.path(word)?);
                }
            }
            Statement::Copy(paths) => {
                for word in &paths {
                    config.copies.push(builder.path(word)?);
                }
            }
            Statement::Alias { prefix, dir } => {
                let dir = builder.path(&dir)?;
                config.aliases.push((prefix.text.to_string(), dir));
            }
            Statement::Rule(decl) => {
                if rules.iter().any(|r| r.name == decl.name.text) {
                    return Err(builder.error(
                        &decl.name,
                        format!("duplicate rule {:?}", decl.name.text),
                    ));
                }
                rules.push(builder.rule(&decl)?);
            }
        }
    }
    if config.entries.is_empty() && config.copies.is_empty() {
        anyhow::bail!("{}: no entry or copy statements", filename);
    }
    // Longest prefix first, so "@lib/ui" wins over "@lib".
    config
        .aliases
        .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    config.rules = RuleTable::new(rules);
    Ok(config)
}
