//! Parser for assets.conf files.
//!
//! The parser only produces statements, with offsets kept on every word so
//! that semantic errors found later (see config.rs) can point at the text.
//! Words borrow from the input, marked with the lifetime `'text`.

use crate::scanner::{ParseError, ParseResult, Scanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word<'text> {
    pub text: &'text str,
    pub ofs: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Attr<'text> {
    pub name: Word<'text>,
    pub values: Vec<Word<'text>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RuleDecl<'text> {
    pub name: Word<'text>,
    pub attrs: Vec<Attr<'text>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Statement<'text> {
    /// `name = value...`
    Binding {
        name: Word<'text>,
        values: Vec<Word<'text>>,
    },
    Entry(Vec<Word<'text>>),
    Copy(Vec<Word<'text>>),
    Alias {
        prefix: Word<'text>,
        dir: Word<'text>,
    },
    Rule(RuleDecl<'text>),
}

fn is_ident_char(c: char) -> bool {
    matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.')
}

fn is_word_end(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n' | '\0')
}

pub struct Parser<'text> {
    scanner: Scanner<'text>,
}

impl<'text> Parser<'text> {
    pub fn new(text: &'text str) -> Parser<'text> {
        Parser {
            scanner: Scanner::new(text),
        }
    }

    pub fn format_parse_error(&self, filename: &str, err: ParseError) -> String {
        self.scanner.format_parse_error(filename, err)
    }

    pub fn read(&mut self) -> ParseResult<Option<Statement<'text>>> {
        loop {
            match self.scanner.peek() {
                '\0' if self.scanner.at_end() => return Ok(None),
                '\n' => self.scanner.next(),
                '\r' if self.scanner.peek_newline() => self.scanner.next(),
                '#' => self.skip_comment(),
                ' ' | '\t' => {
                    self.scanner.skip_spaces();
                    if self.scanner.peek_newline() || self.scanner.at_end() {
                        continue;
                    }
                    if self.scanner.peek() == '#' {
                        self.skip_comment();
                        continue;
                    }
                    return self.scanner.parse_error("unexpected indentation");
                }
                _ => {
                    let ident = self.read_ident()?;
                    self.scanner.skip_spaces();
                    let stmt = match ident.text {
                        "entry" => Statement::Entry(self.read_paths()?),
                        "copy" => Statement::Copy(self.read_paths()?),
                        "alias" => self.read_alias()?,
                        "rule" => Statement::Rule(self.read_rule()?),
                        _ => {
                            self.scanner.expect('=')?;
                            let values = self.read_words()?;
                            Statement::Binding {
                                name: ident,
                                values,
                            }
                        }
                    };
                    return Ok(Some(stmt));
                }
            }
        }
    }

    fn skip_comment(&mut self) {
        while !self.scanner.at_end() && self.scanner.peek() != '\n' {
            self.scanner.next();
        }
    }

    fn read_ident(&mut self) -> ParseResult<Word<'text>> {
        let start = self.scanner.ofs;
        while is_ident_char(self.scanner.peek()) {
            self.scanner.next();
        }
        let end = self.scanner.ofs;
        if end == start {
            return self.scanner.parse_error("failed to scan ident");
        }
        Ok(Word {
            text: self.scanner.slice(start, end),
            ofs: start,
        })
    }

    fn read_word(&mut self) -> Word<'text> {
        let start = self.scanner.ofs;
        while !is_word_end(self.scanner.peek()) {
            self.scanner.next();
        }
        Word {
            text: self.scanner.slice(start, self.scanner.ofs),
            ofs: start,
        }
    }

    /// Consume the end of a line: a comment, a newline, or end of file.
    fn read_eol(&mut self) -> ParseResult<()> {
        self.scanner.skip_spaces();
        if self.scanner.peek() == '#' {
            self.skip_comment();
        }
        self.scanner.skip('\r');
        if self.scanner.at_end() {
            return Ok(());
        }
        self.scanner.expect('\n')
    }

    /// Read whitespace-separated words up to the end of the line.
    fn read_words(&mut self) -> ParseResult<Vec<Word<'text>>> {
        let mut words = Vec::new();
        loop {
            self.scanner.skip_spaces();
            match self.scanner.peek() {
                '#' => break,
                c if is_word_end(c) => break,
                _ => words.push(self.read_word()),
            }
        }
        self.read_eol()?;
        Ok(words)
    }

    fn read_paths(&mut self) -> ParseResult<Vec<Word<'text>>> {
        let ofs = self.scanner.ofs;
        let paths = self.read_words()?;
        if paths.is_empty() {
            return Err(ParseError::new("expected path", ofs));
        }
        Ok(paths)
    }

    fn read_alias(&mut self) -> ParseResult<Statement<'text>> {
        let prefix = self.read_word();
        if prefix.text.is_empty() {
            return self.scanner.parse_error("expected alias prefix");
        }
        self.scanner.skip_spaces();
        self.scanner.expect('=')?;
        self.scanner.skip_spaces();
        let dir = self.read_word();
        if dir.text.is_empty() {
            return self.scanner.parse_error("expected alias directory");
        }
        self.read_eol()?;
        Ok(Statement::Alias { prefix, dir })
    }

    fn read_rule(&mut self) -> ParseResult<RuleDecl<'text>> {
        let name = self.read_ident()?;
        self.read_eol()?;
        let mut attrs = Vec::new();
        loop {
            // Blank lines inside a rule are allowed; the rule ends at the
            // first unindented line.
            let (ofs, line) = (self.scanner.ofs, self.scanner.line);
            while self.scanner.peek_newline() {
                self.scanner.skip('\r');
                self.scanner.next();
            }
            if !matches!(self.scanner.peek(), ' ' | '\t') {
                self.scanner.ofs = ofs;
                self.scanner.line = line;
                break;
            }
            self.scanner.skip_spaces();
            match self.scanner.peek() {
                '#' => {
                    self.skip_comment();
                    self.read_eol()?;
                    continue;
                }
                c if is_word_end(c) => {
                    self.read_eol()?;
                    continue;
                }
                _ => {}
            }
            let attr = self.read_ident()?;
            self.scanner.skip_spaces();
            self.scanner.expect('=')?;
            let values = self.read_words()?;
            attrs.push(Attr { name: attr, values });
        }
        Ok(RuleDecl { name, attrs })
    }
}
