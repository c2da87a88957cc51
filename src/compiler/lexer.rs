use crate::error::CompileError;

use super::tokens::{match_lexeme, Lit, Tok, Token, Tokens, TOP};

struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    out: Tokens,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

impl<'s> Lexer<'s> {
    fn peek(&self, at: usize) -> Option<u8> {
        self.src.get(self.pos + at).copied()
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::new(self.line, msg)
    }

    fn push(&mut self, kind: Tok, line: u32, lit: Lit) {
        let last = self.out.toks[TOP].last.map(|l| self.out.kind(l));
        // A minus right after an arithmetic operator can only be unary.
        let kind = match (kind, last) {
            (Tok::Minus, Some(Tok::Plus | Tok::Minus | Tok::Mul | Tok::Div | Tok::Cat | Tok::Neg)) => {
                Tok::Neg
            }
            _ => kind,
        };
        let i = self.out.add(Token::new(kind, line, lit));
        self.out.append(TOP, i);
    }

    fn run(mut self) -> Result<Tokens, CompileError> {
        while let Some(c) = self.peek(0) {
            match c {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' | 0x0c => self.pos += 1,
                b'#' => {
                    while let Some(c) = self.peek(0) {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                b'"' | b'\'' => self.string(c)?,
                b'`' => self.char_literal()?,
                b'0'..=b'9' => self.number()?,
                _ => self.word()?,
            }
        }
        Ok(self.out)
    }

    fn word(&mut self) -> Result<(), CompileError> {
        let src = self.src;
        let rest = &src[self.pos..];
        let ident_len = if is_ident_start(rest[0]) {
            rest.iter().take_while(|&&c| is_ident(c)).count()
        } else {
            0
        };
        match match_lexeme(rest) {
            Some((len, tok)) if len >= ident_len => {
                self.pos += len;
                self.push(tok, self.line, Lit::None);
            }
            _ if ident_len > 0 => {
                let name = rest[..ident_len].to_vec();
                self.pos += ident_len;
                self.push(Tok::Symbol, self.line, Lit::Sym(name));
            }
            _ => return Err(self.error(format!("illegal character '{}'", rest[0] as char))),
        }
        Ok(())
    }

    /// Reads one escape after a backslash in a double-quoted string or a
    /// character literal.
    fn escape(&mut self) -> Result<u8, CompileError> {
        let c = self.peek(0).ok_or_else(|| self.error("unterminated string"))?;
        self.pos += 1;
        Ok(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'`' => b'`',
            b'x' => {
                let hi = self.peek(0).and_then(hex_digit);
                let lo = self.peek(1).and_then(hex_digit);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        self.pos += 2;
                        hi * 16 + lo
                    }
                    _ => return Err(self.error("bad \\x escape")),
                }
            }
            other => return Err(self.error(format!("bad escape '\\{}'", other as char))),
        })
    }

    fn string(&mut self, quote: u8) -> Result<(), CompileError> {
        let line = self.line;
        self.pos += 1;
        let mut buf = Vec::new();
        loop {
            let c = self.peek(0).ok_or_else(|| CompileError::new(line, "unterminated string"))?;
            self.pos += 1;
            match c {
                c if c == quote => break,
                b'\\' if quote == b'"' => buf.push(self.escape()?),
                b'\\' => match self.peek(0) {
                    // Single quotes only escape themselves and backslash.
                    Some(e @ (b'\'' | b'\\')) => {
                        self.pos += 1;
                        buf.push(e);
                    }
                    _ => buf.push(b'\\'),
                },
                b'\n' => {
                    self.line += 1;
                    buf.push(c);
                }
                c => buf.push(c),
            }
        }
        self.push(Tok::Literal, line, Lit::Str(buf));
        Ok(())
    }

    fn char_literal(&mut self) -> Result<(), CompileError> {
        self.pos += 1;
        let c = self.peek(0).ok_or_else(|| self.error("unterminated character literal"))?;
        self.pos += 1;
        let byte = if c == b'\\' { self.escape()? } else { c };
        if self.peek(0) != Some(b'`') {
            return Err(self.error("bad character literal"));
        }
        self.pos += 1;
        self.push(Tok::Literal, self.line, Lit::Num(byte as f64));
        Ok(())
    }

    fn radix(&mut self, radix: u32) -> Result<f64, CompileError> {
        self.pos += 2;
        let start = self.pos;
        let mut n = 0.0;
        while let Some(d) = self.peek(0).and_then(|c| (c as char).to_digit(radix)) {
            n = n * radix as f64 + d as f64;
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("bad number"));
        }
        Ok(n)
    }

    fn digits(&mut self) {
        while matches!(self.peek(0), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<(), CompileError> {
        let n = match (self.peek(0), self.peek(1)) {
            (Some(b'0'), Some(b'x')) => self.radix(16)?,
            (Some(b'0'), Some(b'o')) => self.radix(8)?,
            _ => {
                let start = self.pos;
                self.digits();
                if self.peek(0) == Some(b'.') && matches!(self.peek(1), Some(b'0'..=b'9')) {
                    self.pos += 1;
                    self.digits();
                }
                if matches!(self.peek(0), Some(b'e' | b'E')) {
                    let sign = matches!(self.peek(1), Some(b'+' | b'-')) as usize;
                    if matches!(self.peek(1 + sign), Some(b'0'..=b'9')) {
                        self.pos += 1 + sign;
                        self.digits();
                    }
                }
                let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
                text.parse::<f64>().map_err(|_| self.error("bad number"))?
            }
        };
        if self.peek(0).map_or(false, is_ident) {
            return Err(self.error("bad number"));
        }
        self.push(Tok::Literal, self.line, Lit::Num(n));
        Ok(())
    }
}

/// Scans `src` into a flat token list under the top token.
pub fn lex(src: &[u8], first_line: u32) -> Result<Tokens, CompileError> {
    Lexer {
        src,
        pos: 0,
        line: first_line,
        out: Tokens::new(first_line),
    }
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        let t = lex(src.as_bytes(), 1).unwrap();
        t.children(TOP).into_iter().map(|i| t.kind(i)).collect()
    }

    fn lits(src: &str) -> Vec<Lit> {
        let t = lex(src.as_bytes(), 1).unwrap();
        t.children(TOP).into_iter().map(|i| t.toks[i].lit.clone()).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(kinds("foreach foreachx"), vec![Tok::Foreach, Tok::Symbol]);
        assert_eq!(kinds("a<=b"), vec![Tok::Symbol, Tok::Lte, Tok::Symbol]);
        assert_eq!(kinds("x && !y"), vec![Tok::Symbol, Tok::And, Tok::Not, Tok::Symbol]);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(
            kinds("a - -b"),
            vec![Tok::Symbol, Tok::Minus, Tok::Neg, Tok::Symbol]
        );
        assert_eq!(kinds("a = -b"), vec![Tok::Symbol, Tok::Assign, Tok::Minus, Tok::Symbol]);
    }

    #[test]
    fn literals() {
        assert_eq!(
            lits(r#"0x1f 0o17 1.5e2 `a` "a\tb" 'c\n'"#),
            vec![
                Lit::Num(31.0),
                Lit::Num(15.0),
                Lit::Num(150.0),
                Lit::Num(97.0),
                Lit::Str(b"a\tb".to_vec()),
                Lit::Str(b"c\\n".to_vec()),
            ]
        );
    }

    #[test]
    fn lines_and_comments() {
        let t = lex(b"a # comment\n\nb", 5).unwrap();
        let lines: Vec<u32> = t.children(TOP).into_iter().map(|i| t.toks[i].line).collect();
        assert_eq!(lines, vec![5, 7]);
    }

    #[test]
    fn errors() {
        assert_eq!(lex(b"\"abc", 1).unwrap_err().message, "unterminated string");
        assert_eq!(lex(b"a\n@", 1).unwrap_err().line, 2);
        assert!(lex(b"12ab", 1).is_err());
    }
}
