//! Lexer and parser for the constrained dialect.
//!
//! Surface syntax is s-expressions with vector `[...]` and map `{...}`
//! literals, string escapes, `;` line comments, and `:keyword` atoms.

use std::fmt;

use crate::lang::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Symbol(String),
    List(Vec<Expr>),
    Vector(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(char),
    Close(char),
    Str(String),
    Atom(String),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
        }
    }

    fn skip_trivia(&mut self) {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_whitespace() || c == b',' {
                self.pos += 1;
            } else if c == b';' {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<(Token, usize)>, ParseError> {
        self.skip_trivia();
        if self.pos >= self.src.len() {
            return Ok(None);
        }
        let start = self.pos;
        let c = self.src[self.pos];
        match c {
            b'(' | b'[' | b'{' => {
                self.pos += 1;
                Ok(Some((Token::Open(c as char), start)))
            }
            b')' | b']' | b'}' => {
                self.pos += 1;
                Ok(Some((Token::Close(c as char), start)))
            }
            b'"' => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    if self.pos >= self.src.len() {
                        return Err(self.error("unterminated string"));
                    }
                    match self.src[self.pos] {
                        b'"' => {
                            self.pos += 1;
                            break;
                        }
                        b'\\' => {
                            self.pos += 1;
                            if self.pos >= self.src.len() {
                                return Err(self.error("unterminated escape"));
                            }
                            let escaped = self.src[self.pos];
                            self.pos += 1;
                            out.push(match escaped {
                                b'n' => '\n',
                                b't' => '\t',
                                b'r' => '\r',
                                b'"' => '"',
                                b'\\' => '\\',
                                other => {
                                    return Err(self.error(format!(
                                        "unknown escape \\{}",
                                        other as char
                                    )))
                                }
                            });
                        }
                        other => {
                            // Multi-byte UTF-8 passes through untouched.
                            let ch_len = utf8_len(other);
                            let end = (self.pos + ch_len).min(self.src.len());
                            out.push_str(
                                std::str::from_utf8(&self.src[self.pos..end])
                                    .map_err(|_| self.error("invalid utf-8 in string"))?,
                            );
                            self.pos = end;
                        }
                    }
                }
                Ok(Some((Token::Str(out), start)))
            }
            _ => {
                let mut end = self.pos;
                while end < self.src.len() {
                    let b = self.src[end];
                    if b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b';' | b',')
                    {
                        break;
                    }
                    end += 1;
                }
                let atom = std::str::from_utf8(&self.src[self.pos..end])
                    .map_err(|_| self.error("invalid utf-8 in atom"))?
                    .to_string();
                self.pos = end;
                Ok(Some((Token::Atom(atom), start)))
            }
        }
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

fn atom_to_expr(atom: &str) -> Expr {
    match atom {
        "nil" => return Expr::Literal(Value::Nil),
        "true" => return Expr::Literal(Value::Bool(true)),
        "false" => return Expr::Literal(Value::Bool(false)),
        _ => {}
    }
    if let Some(name) = atom.strip_prefix(':') {
        return Expr::Literal(Value::Keyword(name.to_string()));
    }
    if let Ok(i) = atom.parse::<i64>() {
        return Expr::Literal(Value::Int(i));
    }
    if atom.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '-')
        && atom.parse::<f64>().is_ok()
        && atom != "-"
    {
        return Expr::Literal(Value::Float(atom.parse().expect("checked above")));
    }
    Expr::Symbol(atom.to_string())
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<(Token, usize)>,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Result<Option<(Token, usize)>, ParseError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(Some(tok));
        }
        self.lexer.next_token()
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let Some((token, position)) = self.next()? else {
            return Err(ParseError {
                message: "unexpected end of input".into(),
                position: self.lexer.pos,
            });
        };
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Atom(a) => Ok(atom_to_expr(&a)),
            Token::Open(open) => {
                let close = match open {
                    '(' => ')',
                    '[' => ']',
                    _ => '}',
                };
                let mut items = Vec::new();
                loop {
                    match self.next()? {
                        None => {
                            return Err(ParseError {
                                message: format!("missing closing {}", close),
                                position,
                            })
                        }
                        Some((Token::Close(c), pos)) => {
                            if c != close {
                                return Err(ParseError {
                                    message: format!("mismatched {} closed by {}", open, c),
                                    position: pos,
                                });
                            }
                            break;
                        }
                        Some(other) => {
                            self.peeked = Some(other);
                            items.push(self.parse_expr()?);
                        }
                    }
                }
                match open {
                    '(' => Ok(Expr::List(items)),
                    '[' => Ok(Expr::Vector(items)),
                    _ => {
                        if items.len() % 2 != 0 {
                            return Err(ParseError {
                                message: "map literal needs an even number of forms".into(),
                                position,
                            });
                        }
                        let mut pairs = Vec::with_capacity(items.len() / 2);
                        let mut iter = items.into_iter();
                        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                            pairs.push((k, v));
                        }
                        Ok(Expr::MapLit(pairs))
                    }
                }
            }
            Token::Close(c) => Err(ParseError {
                message: format!("unexpected {}", c),
                position,
            }),
        }
    }
}

/// Parse a whole program: a sequence of top-level forms.
pub fn parse_program(src: &str) -> Result<Vec<Expr>, ParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(src),
        peeked: None,
    };
    let mut forms = Vec::new();
    loop {
        match parser.next()? {
            None => break,
            Some(token) => {
                parser.peeked = Some(token);
                forms.push(parser.parse_expr()?);
            }
        }
    }
    if forms.is_empty() {
        return Err(ParseError {
            message: "empty program".into(),
            position: 0,
        });
    }
    Ok(forms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_atoms_and_collections() {
        let forms = parse_program(r#"(if true [1 2.5 "x"] {:allowed false :reason "no"})"#).unwrap();
        assert_eq!(forms.len(), 1);
        let Expr::List(items) = &forms[0] else {
            panic!("expected list")
        };
        assert_eq!(items[0], Expr::Symbol("if".into()));
        assert_eq!(items[1], Expr::Literal(Value::Bool(true)));
        assert!(matches!(items[2], Expr::Vector(_)));
        assert!(matches!(items[3], Expr::MapLit(_)));
    }

    #[test]
    fn comments_and_commas_are_trivia() {
        let forms = parse_program("; header\n(+ 1, 2) ; trailing\n").unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[test]
    fn negative_numbers_and_minus_symbol() {
        let forms = parse_program("(- -3 1.5)").unwrap();
        let Expr::List(items) = &forms[0] else { panic!() };
        assert_eq!(items[0], Expr::Symbol("-".into()));
        assert_eq!(items[1], Expr::Literal(Value::Int(-3)));
        assert_eq!(items[2], Expr::Literal(Value::Float(1.5)));
    }

    #[test]
    fn unterminated_forms_error() {
        assert!(parse_program("(+ 1 2").is_err());
        assert!(parse_program(r#""dangling"#).is_err());
        assert!(parse_program("{:odd}").is_err());
        assert!(parse_program("").is_err());
    }
}
