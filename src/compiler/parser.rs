//! Token list to parse tree.
//!
//! Brace matching nests bracketed tokens under their opener, block fix-up
//! gathers the pieces of function literals and control statements under
//! their keyword, and precedence climbing turns each sibling list into a
//! tree of [`Node`]s.
//!
//! Statement and item lists are parsed in a loop into one flat
//! [`Tok::List`] node. Everything else recurses, so real nesting is capped
//! at [`MAX_NESTING`].
use crate::error::CompileError;

use super::{
    lexer::lex,
    tokens::{Lit, Tok, Token, Tokens, TOP},
};

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: Tok,
    pub line: u32,
    pub lit: Lit,
    pub children: Vec<Node>,
}

impl Node {
    fn new(kind: Tok, line: u32, children: Vec<Node>) -> Self {
        Self {
            kind,
            line,
            lit: Lit::None,
            children,
        }
    }

    pub fn empty(line: u32) -> Self {
        Self::new(Tok::Empty, line, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.kind == Tok::Empty
    }

    /// Name of a symbol node.
    pub fn sym(&self) -> Option<&[u8]> {
        match (&self.kind, &self.lit) {
            (Tok::Symbol, Lit::Sym(name)) => Some(name),
            _ => None,
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// Deepest nesting of blocks, brackets and operators the parser accepts.
pub const MAX_NESTING: usize = 200;

const TOO_DEEP: &str = "expression too deeply nested";

fn error(t: &Tokens, i: usize, msg: impl Into<String>) -> CompileError {
    CompileError::new(t.toks[i].line, msg)
}

fn deeper(t: &Tokens, i: usize, depth: usize) -> Result<usize, CompileError> {
    if depth >= MAX_NESTING {
        return Err(error(t, i, TOO_DEEP));
    }
    Ok(depth + 1)
}

fn match_braces(t: &mut Tokens) -> Result<(), CompileError> {
    let mut open: Vec<usize> = Vec::new();
    let mut cur = t.toks[TOP].first;
    while let Some(i) = cur {
        let next = t.toks[i].next;
        let kind = t.kind(i);
        if kind.is_open() {
            if open.len() >= MAX_NESTING {
                return Err(error(t, i, TOO_DEEP));
            }
            open.push(i);
        } else if kind.is_close() {
            let Some(o) = open.pop() else {
                return Err(error(t, i, "unmatched closing brace"));
            };
            if t.kind(o).closer() != Some(kind) {
                return Err(error(t, i, "mismatched brace"));
            }
            while let Some(c) = t.toks[o].next {
                if c == i {
                    break;
                }
                t.unlink(c);
                t.append(o, c);
            }
            t.unlink(i);
        }
        cur = next;
    }
    match open.pop() {
        Some(o) => Err(error(t, o, "unterminated brace")),
        None => Ok(()),
    }
}

/// Tokens after which a function literal following `=` needs no implicit
/// semicolon.
const FUNC_FOLLOWERS: &[Tok] = &[
    Tok::Semi,
    Tok::Comma,
    Tok::Colon,
    Tok::RPar,
    Tok::LPar,
    Tok::LBra,
    Tok::Dot,
];

fn add_semi(t: &mut Tokens, i: usize, keep: &[Tok]) {
    if let Some(next) = t.next_kind(i) {
        if next != Tok::Semi && !keep.contains(&next) {
            let line = t.toks[i].line;
            let semi = t.add(Token::new(Tok::Semi, line, Lit::None));
            t.insert_after(i, semi);
        }
    }
}

fn fix_block(t: &mut Tokens, parent: usize, depth: usize) -> Result<(), CompileError> {
    let depth = deeper(t, parent, depth)?;
    let mut cur = t.toks[parent].first;
    while let Some(i) = cur {
        match t.kind(i) {
            Tok::Func => {
                fix_func(t, i, depth)?;
                let after_assign = t.toks[i].prev.map_or(false, |p| t.kind(p) == Tok::Assign);
                if after_assign {
                    add_semi(t, i, FUNC_FOLLOWERS);
                }
            }
            k if k.is_control() => {
                fix_control(t, i, depth)?;
                add_semi(t, i, &[]);
            }
            Tok::Else | Tok::Elsif => return Err(error(t, i, "else without matching if")),
            k if k.is_open() => fix_block(t, i, depth)?,
            _ => (),
        }
        cur = t.toks[i].next;
    }
    Ok(())
}

fn fix_func(t: &mut Tokens, i: usize, depth: usize) -> Result<(), CompileError> {
    let mut next = t.toks[i].next;
    if let Some(params) = next.filter(|&n| t.kind(n) == Tok::LPar) {
        t.unlink(params);
        t.append(i, params);
        fix_block(t, params, depth)?;
        next = t.toks[i].next;
    }
    match next.filter(|&n| t.kind(n) == Tok::LCurl) {
        Some(body) => {
            t.unlink(body);
            t.append(i, body);
            fix_block(t, body, depth)
        }
        None => Err(error(t, i, "bad function definition")),
    }
}

fn fix_control(t: &mut Tokens, i: usize, depth: usize) -> Result<(), CompileError> {
    let depth = deeper(t, i, depth)?;
    let Some(head) = t.toks[i].next.filter(|&n| t.kind(n) == Tok::LPar) else {
        return Err(error(t, i, "missing '(' after control keyword"));
    };
    t.unlink(head);
    t.append(i, head);
    fix_block(t, head, depth)?;
    let body = take_body(t, i, depth)?;
    t.append(i, body);
    if t.kind(i) == Tok::If {
        fix_else(t, i, depth)?;
    }
    Ok(())
}

fn fix_else(t: &mut Tokens, i: usize, depth: usize) -> Result<(), CompileError> {
    let Some(mut n) = t.toks[i].next else {
        return Ok(());
    };
    // `if (c) x; else y;` puts a semicolon between the branches.
    if t.kind(n) == Tok::Semi && matches!(t.next_kind(n), Some(Tok::Else | Tok::Elsif)) {
        let next = t.toks[n].next;
        t.unlink(n);
        match next {
            Some(next) => n = next,
            None => return Ok(()),
        }
    }
    match t.kind(n) {
        Tok::Elsif => {
            t.toks[n].kind = Tok::If;
            fix_control(t, n, depth)?;
            t.unlink(n);
            t.append(i, n);
        }
        Tok::Else => match t.toks[n].next.filter(|&m| t.kind(m) == Tok::If) {
            Some(inner) => {
                t.unlink(n);
                fix_control(t, inner, depth)?;
                t.unlink(inner);
                t.append(i, inner);
            }
            None => {
                let body = take_body(t, n, depth)?;
                t.unlink(n);
                t.append(i, body);
            }
        },
        _ => (),
    }
    Ok(())
}

/// Detaches the body following `owner`, wrapping an unbraced statement in
/// a synthesized block.
fn take_body(t: &mut Tokens, owner: usize, depth: usize) -> Result<usize, CompileError> {
    let Some(n) = t.toks[owner].next else {
        return Err(error(t, owner, "missing statement body"));
    };
    if t.kind(n) == Tok::LCurl {
        t.unlink(n);
        fix_block(t, n, depth)?;
        return Ok(n);
    }
    let line = t.toks[n].line;
    let block = t.add(Token::new(Tok::LCurl, line, Lit::None));
    if t.kind(n).is_control() {
        fix_control(t, n, depth)?;
        t.unlink(n);
        t.append(block, n);
        return Ok(block);
    }
    while let Some(c) = t.toks[owner].next {
        if t.kind(c) == Tok::Semi {
            break;
        }
        t.unlink(c);
        t.append(block, c);
    }
    fix_block(t, block, depth)?;
    Ok(block)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    /// Separated items, collected into one flat list.
    List,
    /// Right associative; splits at the leftmost operator.
    Reverse,
    /// Left associative; splits at the rightmost operator.
    Binary,
    Prefix,
    Suffix,
}

const LEVELS: &[(&[Tok], Rule)] = &[
    (&[Tok::Semi, Tok::Comma], Rule::List),
    (&[Tok::Ellipsis], Rule::Suffix),
    (&[Tok::Return, Tok::Break, Tok::Continue], Rule::Prefix),
    (
        &[
            Tok::Assign,
            Tok::PlusEq,
            Tok::MinusEq,
            Tok::MulEq,
            Tok::DivEq,
            Tok::CatEq,
        ],
        Rule::Reverse,
    ),
    (&[Tok::Colon, Tok::Question], Rule::Reverse),
    (&[Tok::Var], Rule::Prefix),
    (&[Tok::Or], Rule::Binary),
    (&[Tok::And], Rule::Binary),
    (&[Tok::Eq, Tok::Neq], Rule::Binary),
    (&[Tok::Lt, Tok::Lte, Tok::Gt, Tok::Gte], Rule::Binary),
    (&[Tok::Plus, Tok::Minus, Tok::Cat], Rule::Binary),
    (&[Tok::Mul, Tok::Div], Rule::Binary),
    (&[Tok::Minus, Tok::Neg, Tok::Not], Rule::Prefix),
    (&[Tok::LPar, Tok::LBra], Rule::Suffix),
    (&[Tok::Dot], Rule::Binary),
];

struct Parser<'t> {
    t: &'t Tokens,
    depth: usize,
}

impl Parser<'_> {
    fn line(&self, i: usize) -> u32 {
        self.t.toks[i].line
    }

    fn op(&self, i: usize, children: Vec<Node>) -> Node {
        Node::new(self.t.kind(i), self.line(i), children)
    }

    fn nested<T>(
        &mut self,
        line: u32,
        f: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        if self.depth >= MAX_NESTING {
            return Err(CompileError::new(line, TOO_DEEP));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Parses the children of a bracket or block token.
    fn group(&mut self, i: usize) -> Result<Node, CompileError> {
        let ids = self.t.children(i);
        self.prec(&ids, 0, self.line(i))
    }

    fn block(&mut self, i: usize) -> Result<Node, CompileError> {
        Ok(Node::new(Tok::LCurl, self.line(i), vec![self.group(i)?]))
    }

    fn atom(&mut self, i: usize) -> Result<Node, CompileError> {
        let t = self.t;
        let tok = &t.toks[i];
        let kids = t.children(i);
        match tok.kind {
            Tok::Symbol | Tok::Literal | Tok::Nil | Tok::Empty => Ok(Node {
                kind: tok.kind,
                line: tok.line,
                lit: tok.lit.clone(),
                children: Vec::new(),
            }),
            Tok::LPar => self.group(i),
            Tok::LBra | Tok::LCurl => {
                let g = self.group(i)?;
                Ok(self.op(i, vec![g]))
            }
            Tok::Func => {
                let mut children = Vec::with_capacity(2);
                if let [params, _] = kids[..] {
                    children.push(self.group(params)?);
                }
                let body = *kids.last().ok_or_else(|| error(t, i, "bad function definition"))?;
                children.push(self.block(body)?);
                Ok(self.op(i, children))
            }
            k if k.is_control() => {
                let (head, body, alt) = match kids[..] {
                    [head, body] => (head, body, None),
                    [head, body, alt] => (head, body, Some(alt)),
                    _ => return Err(error(t, i, "malformed control statement")),
                };
                let mut children = vec![self.group(head)?, self.block(body)?];
                if let Some(alt) = alt {
                    children.push(match t.kind(alt) {
                        Tok::If => self.nested(self.line(alt), |p| p.atom(alt))?,
                        _ => self.block(alt)?,
                    });
                }
                Ok(self.op(i, children))
            }
            _ => Err(error(t, i, "parse error")),
        }
    }

    fn operand(&mut self, ids: &[usize], level: usize, at: usize) -> Result<Node, CompileError> {
        let node = self.prec(ids, level, self.line(at))?;
        if node.is_empty() {
            return Err(error(self.t, at, "missing operand"));
        }
        Ok(node)
    }

    fn prec(&mut self, ids: &[usize], level: usize, line: u32) -> Result<Node, CompileError> {
        self.nested(line, |p| p.climb(ids, level, line))
    }

    fn list(&mut self, ids: &[usize], seps: &[usize], level: usize) -> Result<Node, CompileError> {
        let mut items = Vec::with_capacity(seps.len() + 1);
        let mut start = 0;
        for &k in seps {
            items.push(self.prec(&ids[start..k], level + 1, self.line(ids[k]))?);
            start = k + 1;
        }
        let last = seps[seps.len() - 1];
        items.push(self.prec(&ids[start..], level + 1, self.line(ids[last]))?);
        Ok(Node::new(Tok::List, self.line(ids[seps[0]]), items))
    }

    fn climb(&mut self, ids: &[usize], mut level: usize, line: u32) -> Result<Node, CompileError> {
        let t = self.t;
        let Some(&first) = ids.first() else {
            return Ok(Node::empty(line));
        };
        if ids.len() == 1 && t.kind(first).is_atom() {
            return self.atom(first);
        }
        let n = ids.len();

        loop {
            let Some(&(ops, rule)) = LEVELS.get(level) else {
                let at = ids.get(1).copied().unwrap_or(first);
                return Err(error(t, at, "parse error"));
            };
            let is_op = |i: usize| ops.contains(&t.kind(i));

            match rule {
                Rule::List => {
                    let seps: Vec<usize> = (0..n).filter(|&k| is_op(ids[k])).collect();
                    if !seps.is_empty() {
                        return self.list(ids, &seps, level);
                    }
                }
                Rule::Reverse => {
                    if let Some(at) = ids.iter().position(|&i| is_op(i)) {
                        let op = ids[at];
                        let left = self.prec(&ids[..at], level + 1, self.line(op))?;
                        let right = self.prec(&ids[at + 1..], level, self.line(op))?;
                        return Ok(self.op(op, vec![left, right]));
                    }
                }
                Rule::Binary => {
                    if let Some(at) = (1..n).rev().find(|&k| is_op(ids[k])) {
                        let op = ids[at];
                        let left = self.operand(&ids[..at], level, op)?;
                        let right = self.operand(&ids[at + 1..], level + 1, op)?;
                        return Ok(self.op(op, vec![left, right]));
                    }
                }
                Rule::Prefix => {
                    if is_op(first) {
                        let right = match t.kind(first) {
                            Tok::Return | Tok::Break | Tok::Continue => {
                                self.prec(&ids[1..], level, self.line(first))?
                            }
                            _ => self.operand(&ids[1..], level, first)?,
                        };
                        return Ok(self.op(first, vec![right]));
                    }
                }
                Rule::Suffix => {
                    let last = ids[n - 1];
                    match t.kind(last) {
                        Tok::Ellipsis if is_op(last) => {
                            let left = self.operand(&ids[..n - 1], level, last)?;
                            return Ok(self.op(last, vec![left]));
                        }
                        Tok::LPar | Tok::LBra if is_op(last) => {
                            let left = self.operand(&ids[..n - 1], level, last)?;
                            let inner = self.group(last)?;
                            let kind = if t.kind(last) == Tok::LPar {
                                Tok::Call
                            } else {
                                Tok::Index
                            };
                            return Ok(Node::new(kind, self.line(last), vec![left, inner]));
                        }
                        // Member access chains with calls and indexing, left to
                        // right: `a.b(1).c[2]`.
                        Tok::Symbol if ops.contains(&Tok::LPar) => {
                            if n >= 3 && t.kind(ids[n - 2]) == Tok::Dot {
                                let dot = ids[n - 2];
                                let left = self.operand(&ids[..n - 2], level, dot)?;
                                let right = self.atom(last)?;
                                return Ok(self.op(dot, vec![left, right]));
                            }
                        }
                        _ => (),
                    }
                }
            }
            level += 1;
        }
    }
}

/// Parses `src` into a tree rooted at a statement list.
pub fn parse(src: &[u8], first_line: u32) -> Result<Node, CompileError> {
    let mut t = lex(src, first_line)?;
    match_braces(&mut t)?;
    fix_block(&mut t, TOP, 0)?;
    let mut parser = Parser { t: &t, depth: 0 };
    let ids = t.children(TOP);
    parser.prec(&ids, 0, first_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(n: &Node) -> String {
        let head = match (&n.kind, &n.lit) {
            (Tok::Symbol, Lit::Sym(s)) => String::from_utf8_lossy(s).into_owned(),
            (Tok::Literal, Lit::Num(x)) => x.to_string(),
            (Tok::Literal, Lit::Str(s)) => format!("{:?}", String::from_utf8_lossy(s)),
            (k, _) => format!("{:?}", k),
        };
        if n.children.is_empty() {
            head
        } else {
            let kids: Vec<String> = n.children.iter().map(shape).collect();
            format!("({} {})", head, kids.join(" "))
        }
    }

    fn tree(src: &str) -> String {
        shape(&parse(src.as_bytes(), 1).unwrap())
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(tree("a + b * c"), "(Plus a (Mul b c))");
        assert_eq!(tree("a - b - c"), "(Minus (Minus a b) c)");
        assert_eq!(tree("a = b = 1"), "(Assign a (Assign b 1))");
        assert_eq!(tree("-a * b"), "(Mul (Minus a) b)");
        assert_eq!(tree("a - -b"), "(Minus a (Neg b))");
        assert_eq!(tree("!a or b and c"), "(Or (Not a) (And b c))");
    }

    #[test]
    fn member_call_chains() {
        assert_eq!(tree("a.b(1)"), "(Call (Dot a b) 1)");
        assert_eq!(tree("a(1).b"), "(Dot (Call a 1) b)");
        assert_eq!(tree("a.b.c[0]"), "(Index (Dot (Dot a b) c) 0)");
    }

    #[test]
    fn statements_and_blocks() {
        assert_eq!(tree("a; b;"), "(List a b Empty)");
        assert_eq!(
            tree("if (a) b = 1; else c"),
            "(If a (LCurl (Assign b 1)) (LCurl c))"
        );
        assert_eq!(
            tree("while (x) { y }\nz"),
            "(List (While x (LCurl y)) z)"
        );
        assert_eq!(
            tree("f = func(a, b...) { a }\ng"),
            "(List (Assign f (Func (List a (Ellipsis b)) (LCurl a))) g)"
        );
        assert_eq!(tree("x ? 1 : 2"), "(Question x (Colon 1 2))");
    }

    #[test]
    fn else_if_chains() {
        assert_eq!(
            tree("if (a) { 1 } elsif (b) { 2 } else if (c) { 3 } else { 4 }"),
            "(If a (LCurl 1) (If b (LCurl 2) (If c (LCurl 3) (LCurl 4))))"
        );
    }

    #[test]
    fn errors_carry_lines() {
        let err = parse(b"x = 1;\nif (", 1).unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(parse(b"(a]", 1).unwrap_err().message, "mismatched brace");
        assert_eq!(parse(b"a b", 1).unwrap_err().message, "parse error");
        assert_eq!(parse(b"a +", 1).unwrap_err().message, "missing operand");
        assert!(parse(b"else { }", 1).is_err());
    }

    #[test]
    fn long_statement_lists_stay_flat() {
        let items = std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(|| {
                let src: String = (0..20_000).map(|i| format!("x = {};\n", i)).collect();
                parse(src.as_bytes(), 1).map(|tree| tree.children.len())
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(items.unwrap(), 20_001);
        assert_eq!(tree("f(1, (2, 3), 4)"), "(Call f (List 1 (List 2 3) 4))");
    }

    #[test]
    fn nesting_is_capped() {
        let deep = format!("{}x{}", "[".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert_eq!(parse(deep.as_bytes(), 1).unwrap_err().message, TOO_DEEP);
        let chain = format!("x = y{}", ".z".repeat(MAX_NESTING * 2));
        assert_eq!(parse(chain.as_bytes(), 1).unwrap_err().message, TOO_DEEP);
        let ifs = format!("if (a) 1;{}", " elsif (a) 1;".repeat(MAX_NESTING * 2));
        assert_eq!(parse(ifs.as_bytes(), 1).unwrap_err().message, TOO_DEEP);
        assert!(parse(b"[[[[x]]]]", 1).is_ok());
    }
}
