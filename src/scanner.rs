//! Scans an input string (config file) character by character.

#[derive(Debug)]
pub struct ParseError {
    msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

impl ParseError {
    pub fn new(msg: impl Into<String>, ofs: usize) -> Self {
        ParseError {
            msg: msg.into(),
            ofs,
        }
    }
}

pub struct Scanner<'a> {
    text: &'a str,
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Scanner {
            text,
            ofs: 0,
            line: 1,
        }
    }

    /// Slices between two offsets previously returned by the scanner.  Tokens
    /// are delimited by ASCII, so these always fall on char boundaries.
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[start..end]
    }

    /// The current byte as a char, or '\0' at end of input.
    pub fn peek(&self) -> char {
        match self.text.as_bytes().get(self.ofs) {
            Some(&c) => c as char,
            None => '\0',
        }
    }

    pub fn peek_newline(&self) -> bool {
        match self.peek() {
            '\n' => true,
            '\r' => self.text.as_bytes().get(self.ofs + 1) == Some(&b'\n'),
            _ => false,
        }
    }

    pub fn at_end(&self) -> bool {
        self.ofs >= self.text.len()
    }

    pub fn next(&mut self) {
        if self.at_end() {
            return;
        }
        if self.peek() == '\n' {
            self.line += 1;
        }
        self.ofs += 1;
    }

    pub fn back(&mut self) {
        if self.ofs == 0 {
            return;
        }
        self.ofs -= 1;
        if self.peek() == '\n' {
            self.line -= 1;
        }
    }

    pub fn read(&mut self) -> char {
        let c = self.peek();
        self.next();
        c
    }

    pub fn skip(&mut self, ch: char) -> bool {
        if !self.at_end() && self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn skip_spaces(&mut self) {
        while self.skip(' ') || self.skip('\t') {}
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        if self.at_end() {
            return self.parse_error(format!("expected {:?}, got end of file", ch));
        }
        let r = self.read();
        if r != ch {
            self.back();
            return self.parse_error(format!("expected {:?}, got {:?}", ch, r));
        }
        Ok(())
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        Err(ParseError::new(msg, self.ofs))
    }

    pub fn format_parse_error(&self, filename: &str, err: ParseError) -> String {
        format_parse_error(filename, self.text, err)
    }
}

/// Render an error as "parse error: msg" followed by the offending line with
/// a caret under the error position.
pub fn format_parse_error(filename: &str, text: &str, err: ParseError) -> String {
    let mut ofs = 0;
    for (line_number, line) in text.split('\n').enumerate() {
        if ofs + line.len() >= err.ofs {
            let mut msg = "parse error: ".to_string();
            msg.push_str(&err.msg);
            msg.push('\n');

            let prefix = format!("{}:{}: ", filename, line_number + 1);
            msg.push_str(&prefix);

            let line = line.trim_end_matches('\r');
            let mut context = line;
            let mut col = (err.ofs - ofs).min(line.len());
            if col > 40 && context.is_char_boundary(col - 20) {
                // Trim beginning of line to fit it on screen.
                msg.push_str("...");
                context = &context[col - 20..];
                col = 3 + 20;
            }
            if context.len() > 40 && context.is_char_boundary(40) {
                msg.push_str(&context[0..40]);
                msg.push_str("...");
            } else {
                msg.push_str(context);
            }
            msg.push('\n');

            msg.push_str(&" ".repeat(prefix.len() + col));
            msg.push_str("^\n");
            return msg;
        }
        ofs += line.len() + 1;
    }
    format!("parse error: {}\n{}: at end of file\n", err.msg, filename)
}
