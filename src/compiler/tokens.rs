use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tok {
    And,
    Or,
    Not,
    LPar,
    RPar,
    LBra,
    RBra,
    LCurl,
    RCurl,
    Mul,
    Plus,
    Minus,
    Neg,
    Div,
    Cat,
    Colon,
    Dot,
    Comma,
    Semi,
    Assign,
    Lt,
    Lte,
    Eq,
    Neq,
    Gt,
    Gte,
    Nil,
    If,
    Elsif,
    Else,
    For,
    Foreach,
    Forindex,
    While,
    Return,
    Break,
    Continue,
    Func,
    Symbol,
    Literal,
    Var,
    Ellipsis,
    Question,
    PlusEq,
    MinusEq,
    MulEq,
    DivEq,
    CatEq,

    // Synthesized by the parser.
    Empty,
    Top,
    Call,
    Index,
    List,
}

impl Tok {
    pub fn is_open(self) -> bool {
        matches!(self, Tok::LPar | Tok::LBra | Tok::LCurl)
    }

    pub fn is_close(self) -> bool {
        matches!(self, Tok::RPar | Tok::RBra | Tok::RCurl)
    }

    pub fn closer(self) -> Option<Tok> {
        match self {
            Tok::LPar => Some(Tok::RPar),
            Tok::LBra => Some(Tok::RBra),
            Tok::LCurl => Some(Tok::RCurl),
            _ => None,
        }
    }

    /// Statements that take a parenthesized header and a body.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Tok::If | Tok::While | Tok::For | Tok::Foreach | Tok::Forindex
        )
    }

    /// Tokens that stand for a value on their own.
    pub fn is_atom(self) -> bool {
        matches!(
            self,
            Tok::Symbol
                | Tok::Literal
                | Tok::Nil
                | Tok::Empty
                | Tok::LPar
                | Tok::LBra
                | Tok::LCurl
                | Tok::Func
        ) || self.is_control()
    }

    /// Binary operator emitted for a compound assignment.
    pub fn compound_base(self) -> Option<Tok> {
        match self {
            Tok::PlusEq => Some(Tok::Plus),
            Tok::MinusEq => Some(Tok::Minus),
            Tok::MulEq => Some(Tok::Mul),
            Tok::DivEq => Some(Tok::Div),
            Tok::CatEq => Some(Tok::Cat),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Lit {
    None,
    Num(f64),
    Str(Vec<u8>),
    Sym(Vec<u8>),
}

const LEXEMES: &[(&str, Tok)] = &[
    ("and", Tok::And),
    ("or", Tok::Or),
    ("&&", Tok::And),
    ("||", Tok::Or),
    ("!", Tok::Not),
    ("(", Tok::LPar),
    (")", Tok::RPar),
    ("[", Tok::LBra),
    ("]", Tok::RBra),
    ("{", Tok::LCurl),
    ("}", Tok::RCurl),
    ("*", Tok::Mul),
    ("+", Tok::Plus),
    ("-", Tok::Minus),
    ("/", Tok::Div),
    ("~", Tok::Cat),
    (":", Tok::Colon),
    (".", Tok::Dot),
    (",", Tok::Comma),
    (";", Tok::Semi),
    ("=", Tok::Assign),
    ("<", Tok::Lt),
    ("<=", Tok::Lte),
    ("==", Tok::Eq),
    ("!=", Tok::Neq),
    (">", Tok::Gt),
    (">=", Tok::Gte),
    ("nil", Tok::Nil),
    ("if", Tok::If),
    ("elsif", Tok::Elsif),
    ("else", Tok::Else),
    ("for", Tok::For),
    ("foreach", Tok::Foreach),
    ("forindex", Tok::Forindex),
    ("while", Tok::While),
    ("return", Tok::Return),
    ("break", Tok::Break),
    ("continue", Tok::Continue),
    ("func", Tok::Func),
    ("...", Tok::Ellipsis),
    ("?", Tok::Question),
    ("var", Tok::Var),
    ("+=", Tok::PlusEq),
    ("-=", Tok::MinusEq),
    ("*=", Tok::MulEq),
    ("/=", Tok::DivEq),
    ("~=", Tok::CatEq),
];

/// Lexemes sorted longest first, so the first hit is the longest match.
static SORTED: Lazy<Vec<(&'static [u8], Tok)>> = Lazy::new(|| {
    let mut table: Vec<_> = LEXEMES.iter().map(|&(s, t)| (s.as_bytes(), t)).collect();
    table.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    table
});

/// Longest lexeme at the start of `src`.
pub fn match_lexeme(src: &[u8]) -> Option<(usize, Tok)> {
    SORTED
        .iter()
        .find(|(lex, _)| src.starts_with(lex))
        .map(|&(lex, tok)| (lex.len(), tok))
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: Tok,
    pub line: u32,
    pub lit: Lit,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub parent: Option<usize>,
    pub first: Option<usize>,
    pub last: Option<usize>,
}

impl Token {
    pub fn new(kind: Tok, line: u32, lit: Lit) -> Self {
        Self {
            kind,
            line,
            lit,
            prev: None,
            next: None,
            parent: None,
            first: None,
            last: None,
        }
    }
}

/// Arena of tokens. Siblings form a doubly linked list under their parent;
/// index 0 is the synthesized top-level token.
#[derive(Debug)]
pub struct Tokens {
    pub toks: Vec<Token>,
}

pub const TOP: usize = 0;

impl Tokens {
    pub fn new(line: u32) -> Self {
        Self {
            toks: vec![Token::new(Tok::Top, line, Lit::None)],
        }
    }

    pub fn add(&mut self, tok: Token) -> usize {
        self.toks.push(tok);
        self.toks.len() - 1
    }

    /// Appends `i` as the last child of `parent`.
    pub fn append(&mut self, parent: usize, i: usize) {
        let last = self.toks[parent].last;
        {
            let t = &mut self.toks[i];
            t.prev = last;
            t.next = None;
            t.parent = Some(parent);
        }
        match last {
            Some(l) => self.toks[l].next = Some(i),
            None => self.toks[parent].first = Some(i),
        }
        self.toks[parent].last = Some(i);
    }

    /// Removes `i` from its sibling list.
    pub fn unlink(&mut self, i: usize) {
        let (prev, next, parent) = {
            let t = &self.toks[i];
            (t.prev, t.next, t.parent)
        };
        match prev {
            Some(p) => self.toks[p].next = next,
            None => {
                if let Some(parent) = parent {
                    self.toks[parent].first = next;
                }
            }
        }
        match next {
            Some(n) => self.toks[n].prev = prev,
            None => {
                if let Some(parent) = parent {
                    self.toks[parent].last = prev;
                }
            }
        }
        let t = &mut self.toks[i];
        t.prev = None;
        t.next = None;
        t.parent = None;
    }

    pub fn insert_after(&mut self, at: usize, i: usize) {
        let (next, parent) = (self.toks[at].next, self.toks[at].parent);
        {
            let t = &mut self.toks[i];
            t.prev = Some(at);
            t.next = next;
            t.parent = parent;
        }
        self.toks[at].next = Some(i);
        match next {
            Some(n) => self.toks[n].prev = Some(i),
            None => {
                if let Some(parent) = parent {
                    self.toks[parent].last = Some(i);
                }
            }
        }
    }

    pub fn children(&self, parent: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.toks[parent].first;
        while let Some(i) = cur {
            out.push(i);
            cur = self.toks[i].next;
        }
        out
    }

    pub fn kind(&self, i: usize) -> Tok {
        self.toks[i].kind
    }

    pub fn next_kind(&self, i: usize) -> Option<Tok> {
        self.toks[i].next.map(|n| self.toks[n].kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_lexeme_wins() {
        assert_eq!(match_lexeme(b"...x"), Some((3, Tok::Ellipsis)));
        assert_eq!(match_lexeme(b"<=1"), Some((2, Tok::Lte)));
        assert_eq!(match_lexeme(b"foreach(x"), Some((7, Tok::Foreach)));
        assert_eq!(match_lexeme(b"@"), None);
    }

    #[test]
    fn sibling_lists() {
        let mut t = Tokens::new(1);
        let a = t.add(Token::new(Tok::Symbol, 1, Lit::None));
        let b = t.add(Token::new(Tok::Symbol, 1, Lit::None));
        let c = t.add(Token::new(Tok::Semi, 1, Lit::None));
        t.append(TOP, a);
        t.append(TOP, b);
        t.insert_after(a, c);
        assert_eq!(t.children(TOP), vec![a, c, b]);
        t.unlink(a);
        assert_eq!(t.children(TOP), vec![c, b]);
        t.unlink(b);
        assert_eq!(t.children(TOP), vec![c]);
        assert_eq!(t.toks[TOP].last, Some(c));
    }
}
