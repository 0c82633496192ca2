//! Reader: source text to value trees
//!
//! A char-level lexer feeding a recursive parser. `(…)` groups become
//! lists, `[…]` vectors, `{…}` a `(Dict …)` call, the quote family wraps
//! its form, and `\args body` is shorthand for `(fn args body)`. A bare
//! `.` inside a list puts the following form in the final cons cell.

use cedar_core::Value;
use cedar_core::vector::PersistentVec;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Quote,
    Quasiquote,
    Unquote,
    UnquoteSplicing,
    Backslash,
    HashModifier(char),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Keyword(String),
    Eof,
}

/// A token with source position for diagnostics (1-indexed).
#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub col: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

const DELIMITERS: &str = " \t\r\n(){}[],'`@;\"";

impl Lexer {
    fn new(src: &str) -> Lexer {
        Lexer {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn here(&self, tok: Tok) -> Token {
        Token {
            tok,
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, msg: impl std::fmt::Display) -> String {
        format!("{msg} at line {}, column {}", self.line, self.col)
    }

    fn lex(&mut self) -> Result<Token, String> {
        loop {
            match self.peek() {
                Some(';') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.next();
                    }
                }
                Some(c) if c.is_whitespace() => {
                    self.next();
                }
                _ => break,
            }
        }

        let start_line = self.line;
        let start_col = self.col;
        let position = |tok: Tok| Token {
            tok,
            line: start_line,
            col: start_col,
        };

        let Some(c) = self.next() else {
            return Ok(self.here(Tok::Eof));
        };

        match c {
            '(' => Ok(position(Tok::LParen)),
            ')' => Ok(position(Tok::RParen)),
            '[' => Ok(position(Tok::LBracket)),
            ']' => Ok(position(Tok::RBracket)),
            '{' => Ok(position(Tok::LBrace)),
            '}' => Ok(position(Tok::RBrace)),
            '\'' => Ok(position(Tok::Quote)),
            '`' => Ok(position(Tok::Quasiquote)),
            ',' => {
                if self.peek() == Some('@') {
                    self.next();
                    Ok(position(Tok::UnquoteSplicing))
                } else {
                    Ok(position(Tok::Unquote))
                }
            }
            '\\' => Ok(position(Tok::Backslash)),
            '#' => match self.peek() {
                Some(m) if m.is_alphabetic() => {
                    self.next();
                    Ok(position(Tok::HashModifier(m)))
                }
                other => Err(self.error(format_args!(
                    "invalid hash modifier syntax: #{}",
                    other.map(String::from).unwrap_or_default()
                ))),
            },
            '"' => self.lex_string().map(position),
            c if c.is_ascii_digit() => self.lex_number(c).map(position),
            '-' if self.peek().is_some_and(|p| p.is_ascii_digit()) => {
                self.lex_number(c).map(position)
            }
            '.' if self.peek().is_some_and(|p| p.is_ascii_digit()) => {
                self.lex_number(c).map(position)
            }
            c => self.lex_symbol(c).map(position),
        }
    }

    fn lex_string(&mut self) -> Result<Tok, String> {
        let mut buf = String::new();
        loop {
            match self.next() {
                None => return Err(self.error("unterminated string literal")),
                Some('"') => break,
                Some('\\') => match self.next() {
                    Some('n') => buf.push('\n'),
                    Some('t') => buf.push('\t'),
                    Some('r') => buf.push('\r'),
                    Some('0') => buf.push('\0'),
                    Some('e') => buf.push('\x1b'),
                    Some('\\') => buf.push('\\'),
                    Some('"') => buf.push('"'),
                    Some(other) => {
                        return Err(self.error(format_args!("unknown string escape \\{other}")));
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(c) => buf.push(c),
            }
        }
        Ok(Tok::Str(buf))
    }

    fn accept_run(&mut self, set: &str) -> String {
        let mut buf = String::new();
        while let Some(c) = self.peek() {
            if !set.contains(c) {
                break;
            }
            buf.push(c);
            self.next();
        }
        buf
    }

    fn lex_number(&mut self, first: char) -> Result<Tok, String> {
        if first == '0' {
            if self.peek() == Some('x') {
                self.next();
                let digits = self.accept_run("0123456789abcdefABCDEF");
                return i64::from_str_radix(&digits, 16)
                    .map(Tok::Int)
                    .map_err(|_| self.error(format_args!("invalid hex literal 0x{digits}")));
            }
            if self.peek() == Some('o') {
                self.next();
                let digits = self.accept_run("01234567");
                return i64::from_str_radix(&digits, 8)
                    .map(Tok::Int)
                    .map_err(|_| self.error(format_args!("invalid octal literal 0o{digits}")));
            }
        }

        let mut buf = String::new();
        buf.push(first);
        let mut has_decimal = first == '.';
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                buf.push(c);
                self.next();
            } else if c == '.' && !has_decimal {
                has_decimal = true;
                buf.push(c);
                self.next();
            } else {
                break;
            }
        }

        if has_decimal {
            buf.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format_args!("invalid number literal {buf}")))
        } else {
            buf.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format_args!("invalid number literal {buf}")))
        }
    }

    fn lex_symbol(&mut self, first: char) -> Result<Tok, String> {
        let mut buf = String::new();
        buf.push(first);
        while let Some(c) = self.peek() {
            if DELIMITERS.contains(c) {
                break;
            }
            buf.push(c);
            self.next();
        }
        if let Some(stripped) = buf.strip_prefix(':') {
            if stripped.is_empty() {
                return Err(self.error("keyword token must have at least one character after ':'"));
            }
            return Ok(Tok::Keyword(buf));
        }
        Ok(Tok::Symbol(buf))
    }
}

fn lex_all(src: &str) -> Result<Vec<Token>, String> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();
    loop {
        let t = lexer.lex()?;
        let done = t.tok == Tok::Eof;
        tokens.push(t);
        if done {
            return Ok(tokens);
        }
    }
}

pub struct Reader {
    tokens: Vec<Token>,
    pos: usize,
}

impl Reader {
    pub fn new(src: &str) -> Result<Reader, String> {
        Ok(Reader {
            tokens: lex_all(src)?,
            pos: 0,
        })
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let t = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at_eof(&self) -> bool {
        self.current().tok == Tok::Eof
    }

    fn error(&self, msg: impl std::fmt::Display) -> String {
        let t = self.current();
        format!("{msg} at line {}, column {}", t.line, t.col)
    }

    /// Read every top-level form in the source.
    pub fn read_all(&mut self) -> Result<Vec<Value>, String> {
        let mut forms = Vec::new();
        while !self.at_eof() {
            forms.push(self.parse_expr()?);
        }
        Ok(forms)
    }

    fn parse_expr(&mut self) -> Result<Value, String> {
        let token = self.advance();
        match token.tok {
            Tok::Int(n) => Ok(Value::Int(n)),
            Tok::Float(f) => Ok(Value::Float(f)),
            Tok::Str(s) => Ok(Value::string(s)),
            Tok::Keyword(k) => Ok(Value::keyword(&k)),
            Tok::Symbol(s) => {
                if s == "nil" {
                    Ok(Value::nil())
                } else {
                    Ok(Value::symbol(&s))
                }
            }
            Tok::LParen => self.parse_list(),
            Tok::LBracket => self.parse_vector(),
            Tok::LBrace => self.parse_grouping_as_call("Dict", Tok::RBrace),
            Tok::Quote => self.parse_wrapped("quote"),
            Tok::Quasiquote => self.parse_wrapped("quasiquote"),
            Tok::Unquote => self.parse_wrapped("unquote"),
            Tok::UnquoteSplicing => self.parse_wrapped("unquote-splicing"),
            Tok::Backslash => self.parse_backslash_lambda(),
            Tok::HashModifier(m) => Err(self.error(format_args!("invalid hash modifier: #{m}"))),
            Tok::RParen | Tok::RBracket | Tok::RBrace => {
                Err(self.error("unexpected closing delimiter"))
            }
            Tok::Eof => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_list(&mut self) -> Result<Value, String> {
        let mut items = Vec::new();
        let mut tail = Value::nil();
        loop {
            if self.at_eof() {
                return Err(self.error("unexpected eof in list"));
            }
            if self.current().tok == Tok::RParen {
                self.advance();
                break;
            }
            // a bare `.` puts the next form in the final cons cell
            if self.current().tok == Tok::Symbol(".".to_string()) {
                if items.is_empty() {
                    return Err(self.error("dotted pair needs a head element"));
                }
                self.advance();
                tail = self.parse_expr()?;
                if self.current().tok != Tok::RParen {
                    return Err(self.error("expected ')' after dotted tail"));
                }
                self.advance();
                break;
            }
            items.push(self.parse_expr()?);
        }
        let mut list = tail;
        for item in items.into_iter().rev() {
            list = Value::cons(item, list);
        }
        Ok(list)
    }

    fn parse_vector(&mut self) -> Result<Value, String> {
        let mut v = PersistentVec::new();
        loop {
            if self.at_eof() {
                return Err(self.error("unexpected eof in vector"));
            }
            if self.current().tok == Tok::RBracket {
                self.advance();
                return Ok(Value::vector(v));
            }
            v = v.push(self.parse_expr()?);
        }
    }

    fn parse_grouping_as_call(&mut self, name: &str, closing: Tok) -> Result<Value, String> {
        let mut items = vec![Value::symbol(name)];
        loop {
            if self.at_eof() {
                return Err(self.error("unexpected eof in braces"));
            }
            if self.current().tok == closing {
                self.advance();
                return Ok(Value::list_from(&items));
            }
            items.push(self.parse_expr()?);
        }
    }

    fn parse_wrapped(&mut self, name: &str) -> Result<Value, String> {
        let form = self.parse_expr()?;
        Ok(Value::list_from(&[Value::symbol(name), form]))
    }

    fn parse_backslash_lambda(&mut self) -> Result<Value, String> {
        let mut args = self.parse_expr()?;
        if !args.is_list() && !args.is_nil() {
            args = Value::list_from(&[args]);
        }
        let body = self.parse_expr()?;
        Ok(Value::list_from(&[Value::symbol("fn"), args, body]))
    }
}

/// Read every form in `src`.
pub fn read_all(src: &str) -> Result<Vec<Value>, String> {
    Reader::new(src)?.read_all()
}

/// Read exactly one form.
pub fn read_one(src: &str) -> Result<Value, String> {
    let forms = read_all(src)?;
    match forms.len() {
        1 => Ok(forms.into_iter().next().expect("length checked")),
        n => Err(format!("expected a single form, found {n}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(read_one("42").unwrap(), Value::Int(42));
        assert_eq!(read_one("-17").unwrap(), Value::Int(-17));
        assert_eq!(read_one("0xff").unwrap(), Value::Int(255));
        assert_eq!(read_one("0o17").unwrap(), Value::Int(15));
        assert_eq!(read_one("2.5").unwrap(), Value::Float(2.5));
        assert_eq!(read_one("-1.5").unwrap(), Value::Float(-1.5));
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(read_one(r#""hi""#).unwrap(), Value::string("hi"));
        assert_eq!(
            read_one(r#""a\nb\t\"c\"""#).unwrap(),
            Value::string("a\nb\t\"c\"")
        );
        assert!(read_one(r#""open"#).is_err());
    }

    #[test]
    fn symbols_keywords_nil() {
        assert_eq!(read_one("foo").unwrap(), Value::symbol("foo"));
        assert_eq!(read_one(":kw").unwrap(), Value::keyword(":kw"));
        assert!(read_one("nil").unwrap().is_nil());
        assert!(read_one(":").is_err());
    }

    #[test]
    fn lists() {
        let v = read_one("(+ 1 2)").unwrap();
        assert_eq!(
            v,
            Value::list_from(&[Value::symbol("+"), Value::Int(1), Value::Int(2)])
        );
        assert!(read_one("()").unwrap().is_nil());
        assert!(read_one("(1 2").is_err());
    }

    #[test]
    fn dotted_pair() {
        let v = read_one("(1 . 2)").unwrap();
        assert_eq!(v.first().unwrap(), Value::Int(1));
        assert_eq!(v.rest().unwrap(), Value::Int(2));
        let v = read_one("(1 2 . 3)").unwrap();
        assert_eq!(v.rest().unwrap().rest().unwrap(), Value::Int(3));
    }

    #[test]
    fn vectors() {
        let v = read_one("[1 2 3]").unwrap();
        let obj = v.as_obj().unwrap();
        match &obj.payload {
            cedar_core::object::Payload::Vector(pv) => {
                assert_eq!(pv.len(), 3);
                assert_eq!(pv.get(0), Some(&Value::Int(1)));
            }
            _ => panic!("expected vector"),
        }
    }

    #[test]
    fn braces_build_dict_call() {
        let v = read_one("{:a 1}").unwrap();
        assert_eq!(v.first().unwrap(), Value::symbol("Dict"));
        assert_eq!(v.rest().unwrap().first().unwrap(), Value::keyword(":a"));
    }

    #[test]
    fn quote_family() {
        assert_eq!(
            read_one("'x").unwrap(),
            Value::list_from(&[Value::symbol("quote"), Value::symbol("x")])
        );
        assert_eq!(
            read_one("`x").unwrap(),
            Value::list_from(&[Value::symbol("quasiquote"), Value::symbol("x")])
        );
        assert_eq!(
            read_one(",x").unwrap(),
            Value::list_from(&[Value::symbol("unquote"), Value::symbol("x")])
        );
        assert_eq!(
            read_one(",@x").unwrap(),
            Value::list_from(&[Value::symbol("unquote-splicing"), Value::symbol("x")])
        );
    }

    #[test]
    fn backslash_lambda() {
        let v = read_one(r"\x (+ x 1)").unwrap();
        assert_eq!(v.first().unwrap(), Value::symbol("fn"));
        let args = v.rest().unwrap().first().unwrap();
        assert_eq!(args.first().unwrap(), Value::symbol("x"));

        let v = read_one(r"\(x y) (+ x y)").unwrap();
        let args = v.rest().unwrap().first().unwrap();
        assert_eq!(args.len().unwrap(), 2);
    }

    #[test]
    fn comments_are_skipped() {
        let forms = read_all("; a comment\n1 ; trailing\n2").unwrap();
        assert_eq!(forms, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn hash_modifier_is_reserved() {
        assert!(read_one("#t").is_err());
    }

    #[test]
    fn multiple_forms() {
        let forms = read_all("(def a 1) (def b 2)").unwrap();
        assert_eq!(forms.len(), 2);
    }
}
