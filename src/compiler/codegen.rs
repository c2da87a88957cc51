use indexmap::IndexSet;

use crate::{
    bytecode::opcodes::*,
    error::CompileError,
    runtime::{hashtable::hash_key, object::CodeObj, value::Value},
    vm::context::Ctx,
};

use super::{
    parser::Node,
    tokens::{Lit, Tok},
};

type CResult<T = ()> = Result<T, CompileError>;

#[derive(Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Num(u64),
    Str(Vec<u8>),
    Sym(Vec<u8>),
    Nil,
    /// Function literals are never shared.
    Code(usize),
}

struct Loop {
    label: Option<Vec<u8>>,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Default)]
struct Unit {
    bytecode: Vec<u16>,
    consts: Vec<Value>,
    const_hashes: Vec<u32>,
    keys: IndexSet<ConstKey>,
    lines: Vec<(u32, u32)>,
    loops: Vec<Loop>,
    functions: usize,
}

/// Items of a statement or item list, with lists nested in parentheses
/// spliced in place.
fn flatten(node: &Node) -> Vec<&Node> {
    let mut out = Vec::new();
    let mut pending = vec![node];
    while let Some(node) = pending.pop() {
        if node.kind == Tok::List {
            pending.extend(node.children.iter().rev());
        } else {
            out.push(node);
        }
    }
    out
}

fn items(node: &Node) -> Vec<&Node> {
    flatten(node).into_iter().filter(|n| !n.is_empty()).collect()
}

fn is_statement(node: &Node) -> bool {
    node.kind.is_control() || matches!(node.kind, Tok::Return | Tok::Break | Tok::Continue)
}

fn binary_op(kind: Tok) -> Option<u16> {
    Some(match kind {
        Tok::Plus => OP_PLUS,
        Tok::Minus => OP_MINUS,
        Tok::Mul => OP_MUL,
        Tok::Div => OP_DIV,
        Tok::Cat => OP_CAT,
        Tok::Lt => OP_LT,
        Tok::Lte => OP_LTE,
        Tok::Gt => OP_GT,
        Tok::Gte => OP_GTE,
        Tok::Eq => OP_EQ,
        Tok::Neq => OP_NEQ,
        _ => return None,
    })
}

pub(crate) struct Codegen<'c, 'a> {
    ctx: &'c mut Ctx<'a>,
    file: &'c str,
    unit: Unit,
    line: u32,
}

impl<'c, 'a> Codegen<'c, 'a> {
    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::new(self.line, msg)
    }

    fn here(&self) -> u16 {
        self.unit.bytecode.len() as u16
    }

    fn emit(&mut self, op: u16) -> CResult {
        if self.unit.bytecode.len() >= u16::MAX as usize - 2 {
            return Err(self.error("function too large"));
        }
        let ip = self.unit.bytecode.len() as u32;
        if self.unit.lines.last().map(|&(_, line)| line) != Some(self.line) {
            self.unit.lines.push((ip, self.line));
        }
        self.unit.bytecode.push(op);
        Ok(())
    }

    fn emit_arg(&mut self, op: u16, arg: u16) -> CResult {
        self.emit(op)?;
        self.unit.bytecode.push(arg);
        Ok(())
    }

    /// Emits a jump and returns the operand slot to patch.
    fn emit_jump(&mut self, op: u16) -> CResult<usize> {
        self.emit_arg(op, u16::MAX)?;
        Ok(self.unit.bytecode.len() - 1)
    }

    fn patch(&mut self, at: usize) {
        let here = self.here();
        self.unit.bytecode[at] = here;
    }

    fn patch_to(&mut self, at: usize, target: u16) {
        self.unit.bytecode[at] = target;
    }

    fn add_const(&mut self, key: ConstKey, make: impl FnOnce(&mut Ctx<'a>) -> Value) -> CResult<u16> {
        if let Some(i) = self.unit.keys.get_index_of(&key) {
            return Ok(i as u16);
        }
        if self.unit.consts.len() >= u16::MAX as usize {
            return Err(self.error("too many constants"));
        }
        let v = make(self.ctx);
        let hash = if v.is_str() { hash_key(&v).0 } else { 0 };
        self.unit.keys.insert(key);
        self.unit.consts.push(v);
        self.unit.const_hashes.push(hash);
        Ok((self.unit.consts.len() - 1) as u16)
    }

    fn sym_const(&mut self, name: &[u8]) -> CResult<u16> {
        self.add_const(ConstKey::Sym(name.to_vec()), |ctx| ctx.intern(name))
    }

    fn str_const(&mut self, bytes: &[u8]) -> CResult<u16> {
        self.add_const(ConstKey::Str(bytes.to_vec()), |ctx| ctx.new_str(bytes))
    }

    fn num_const(&mut self, n: f64) -> CResult<u16> {
        self.add_const(ConstKey::Num(n.to_bits()), |_| Value::Num(n))
    }

    fn symbol(&mut self, node: &Node) -> CResult<u16> {
        match node.sym() {
            Some(name) => self.sym_const(name),
            None => Err(self.error("expected a symbol")),
        }
    }

    fn push_num(&mut self, n: f64) -> CResult {
        if n == 0.0 && n.is_sign_positive() {
            self.emit(OP_PUSH_ZERO)
        } else if n == 1.0 {
            self.emit(OP_PUSH_ONE)
        } else {
            let i = self.num_const(n)?;
            self.emit_arg(OP_PUSH_CONST, i)
        }
    }

    /// Constant for a default argument or a literal hash key.
    fn literal_const(&mut self, node: &Node) -> CResult<Option<u16>> {
        match (&node.kind, &node.lit) {
            (Tok::Literal, Lit::Num(n)) => self.num_const(*n).map(Some),
            (Tok::Literal, Lit::Str(s)) => self.str_const(s).map(Some),
            (Tok::Nil, _) => self.add_const(ConstKey::Nil, |_| Value::Nil).map(Some),
            (Tok::Minus | Tok::Neg, _) if node.children.len() == 1 => match &node.children[0].lit {
                Lit::Num(n) => self.num_const(-*n).map(Some),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn expr(&mut self, node: &Node) -> CResult {
        self.line = node.line;
        match node.kind {
            Tok::Nil | Tok::Empty => self.emit(OP_PUSH_NIL),
            Tok::Literal => match &node.lit {
                Lit::Num(n) => self.push_num(*n),
                Lit::Str(s) => {
                    let i = self.str_const(s)?;
                    self.emit_arg(OP_PUSH_CONST, i)
                }
                _ => Err(self.error("bad literal")),
            },
            Tok::Symbol => {
                let i = self.symbol(node)?;
                self.emit_arg(OP_LOCAL, i)
            }
            Tok::LBra => {
                self.emit(OP_NEW_VEC)?;
                for item in items(&node.children[0]) {
                    self.expr(item)?;
                    self.emit(OP_VAPPEND)?;
                }
                Ok(())
            }
            Tok::LCurl => self.hash_literal(&node.children[0]),
            Tok::Func => self.function(node),
            Tok::Minus | Tok::Neg if node.children.len() == 1 => {
                self.expr(&node.children[0])?;
                self.emit(OP_NEG)
            }
            Tok::Not => {
                self.expr(&node.children[0])?;
                self.emit(OP_NOT)
            }
            Tok::And | Tok::Or => {
                // The deciding operand is the result.
                self.expr(&node.children[0])?;
                let op = if node.kind == Tok::And {
                    OP_JIF_NOT
                } else {
                    OP_JIF_TRUE
                };
                let end = self.emit_jump(op)?;
                self.emit(OP_POP)?;
                self.expr(&node.children[1])?;
                self.patch(end);
                Ok(())
            }
            Tok::Question => self.ternary(node),
            Tok::Assign => self.assign(node),
            Tok::PlusEq | Tok::MinusEq | Tok::MulEq | Tok::DivEq | Tok::CatEq => self.compound(node),
            Tok::Dot => {
                self.expr(&node.children[0])?;
                self.line = node.line;
                let i = self.symbol(&node.children[1])?;
                self.emit_arg(OP_MEMBER, i)
            }
            Tok::Call => self.call(node),
            Tok::Index => self.index(node),
            Tok::Var => {
                // A bare declaration binds nil.
                let i = self.symbol(&node.children[0])?;
                self.emit(OP_PUSH_NIL)?;
                self.emit_arg(OP_SET_LOCAL, i)
            }
            Tok::List => self.statements(node, true),
            _ if is_statement(node) => {
                self.statement(node)?;
                self.emit(OP_PUSH_NIL)
            }
            _ => match binary_op(node.kind) {
                Some(op) if node.children.len() == 2 => {
                    self.expr(&node.children[0])?;
                    self.expr(&node.children[1])?;
                    self.line = node.line;
                    self.emit(op)
                }
                _ => Err(self.error(format!("unexpected {:?}", node.kind))),
            },
        }
    }

    /// Compiles a statement list. With `value`, the last statement's value
    /// is left on the stack.
    fn statements(&mut self, node: &Node, value: bool) -> CResult {
        let list = items(node);
        if list.is_empty() {
            if value {
                self.emit(OP_PUSH_NIL)?;
            }
            return Ok(());
        }
        let n = list.len();
        for (k, item) in list.into_iter().enumerate() {
            let keep = value && k + 1 == n;
            if is_statement(item) {
                self.statement(item)?;
                if keep {
                    self.emit(OP_PUSH_NIL)?;
                }
            } else {
                self.expr(item)?;
                if !keep {
                    self.emit(OP_POP)?;
                }
            }
        }
        Ok(())
    }

    fn block(&mut self, block: &Node) -> CResult {
        match block.kind {
            Tok::LCurl => self.statements(&block.children[0], false),
            _ => self.statements(block, false),
        }
    }

    fn statement(&mut self, node: &Node) -> CResult {
        self.line = node.line;
        match node.kind {
            Tok::If => self.if_chain(node),
            Tok::While => self.while_loop(node),
            Tok::For => self.for_loop(node),
            Tok::Foreach | Tok::Forindex => self.foreach_loop(node),
            Tok::Return => {
                self.expr(&node.children[0])?;
                self.emit(OP_RETURN)
            }
            Tok::Break | Tok::Continue => self.loop_jump(node),
            _ => Err(self.error("bad statement")),
        }
    }

    fn condition(&mut self, node: &Node) -> CResult<usize> {
        if node.is_empty() {
            return Err(self.error("missing condition"));
        }
        self.expr(node)?;
        self.emit_jump(OP_JIF_NOT_POP)
    }

    fn if_chain(&mut self, node: &Node) -> CResult {
        let skip = self.condition(&node.children[0])?;
        self.block(&node.children[1])?;
        match node.children.get(2) {
            Some(alt) => {
                let end = self.emit_jump(OP_JMP)?;
                self.patch(skip);
                if alt.kind == Tok::If {
                    self.if_chain(alt)?;
                } else {
                    self.block(alt)?;
                }
                self.patch(end);
            }
            None => self.patch(skip),
        }
        Ok(())
    }

    /// Splits a loop header into its parts, taking an optional leading
    /// label.
    fn loop_header<'n>(&self, head: &'n Node, parts: usize) -> CResult<(Option<Vec<u8>>, Vec<&'n Node>)> {
        let mut list = flatten(head);
        if list.len() == parts + 1 {
            let label = list.remove(0);
            match label.sym() {
                Some(name) => Ok((Some(name.to_vec()), list)),
                None => Err(self.error("bad loop label")),
            }
        } else if list.len() == parts {
            Ok((None, list))
        } else {
            Err(self.error("bad loop header"))
        }
    }

    fn loop_body(&mut self, label: Option<Vec<u8>>, body: &Node) -> CResult<Loop> {
        self.unit.loops.push(Loop {
            label,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
        let result = self.block(body);
        let lp = self.unit.loops.pop();
        result?;
        lp.ok_or_else(|| self.error("loop stack underflow"))
    }

    /// Patches the loop's exits and closes its mark.
    fn end_loop(&mut self, lp: &Loop, exit: Option<usize>) -> CResult {
        if let Some(exit) = exit {
            self.patch(exit);
        }
        for &at in &lp.breaks {
            self.patch(at);
        }
        self.emit(OP_UNMARK)
    }

    fn continue_here(&mut self, lp: &Loop) {
        let here = self.here();
        for &at in &lp.continues {
            self.patch_to(at, here);
        }
    }

    fn while_loop(&mut self, node: &Node) -> CResult {
        let (label, parts) = self.loop_header(&node.children[0], 1)?;
        self.emit(OP_MARK)?;
        let top = self.here();
        let exit = self.condition(parts[0])?;
        let lp = self.loop_body(label, &node.children[1])?;
        self.continue_here(&lp);
        self.emit_arg(OP_JMP_LOOP, top)?;
        self.end_loop(&lp, Some(exit))
    }

    fn for_loop(&mut self, node: &Node) -> CResult {
        let (label, parts) = self.loop_header(&node.children[0], 3)?;
        let (init, cond, update) = (parts[0], parts[1], parts[2]);
        if !init.is_empty() {
            self.expr(init)?;
            self.emit(OP_POP)?;
        }
        self.emit(OP_MARK)?;
        let top = self.here();
        let exit = if cond.is_empty() {
            None
        } else {
            Some(self.condition(cond)?)
        };
        let lp = self.loop_body(label, &node.children[1])?;
        self.continue_here(&lp);
        if !update.is_empty() {
            self.expr(update)?;
            self.emit(OP_POP)?;
        }
        self.emit_arg(OP_JMP_LOOP, top)?;
        self.end_loop(&lp, exit)
    }

    fn foreach_loop(&mut self, node: &Node) -> CResult {
        let (label, parts) = self.loop_header(&node.children[0], 2)?;
        let (var, vec) = (parts[0], parts[1]);
        let (set, target) = match var.kind {
            Tok::Symbol => (OP_SET_SYM, self.symbol(var)?),
            Tok::Var => (OP_SET_LOCAL, self.symbol(&var.children[0])?),
            _ => return Err(self.error("bad foreach variable")),
        };
        self.expr(vec)?;
        self.emit(OP_PUSH_ZERO)?;
        self.emit(OP_MARK)?;
        let top = self.here();
        self.emit(if node.kind == Tok::Foreach {
            OP_EACH
        } else {
            OP_INDEX
        })?;
        let exit = self.emit_jump(OP_JIF_END)?;
        self.emit_arg(set, target)?;
        self.emit(OP_POP)?;
        let lp = self.loop_body(label, &node.children[1])?;
        self.continue_here(&lp);
        self.emit_arg(OP_JMP_LOOP, top)?;
        self.end_loop(&lp, Some(exit))?;
        self.emit(OP_POP)?;
        self.emit(OP_POP)
    }

    /// `break` / `continue`, optionally naming an enclosing loop.
    fn loop_jump(&mut self, node: &Node) -> CResult {
        let label = match &node.children[0] {
            n if n.is_empty() => None,
            n => match n.sym() {
                Some(name) => Some(name.to_vec()),
                None => return Err(self.error("bad loop label")),
            },
        };
        let depth = self.unit.loops.len();
        let target = match &label {
            None => depth.checked_sub(1),
            Some(name) => self
                .unit
                .loops
                .iter()
                .rposition(|lp| lp.label.as_deref() == Some(name.as_slice())),
        };
        let Some(target) = target else {
            return Err(match label {
                Some(name) => self.error(format!("no enclosing loop labeled {}", String::from_utf8_lossy(&name))),
                None => self.error("break or continue outside a loop"),
            });
        };
        for _ in target + 1..depth {
            self.emit(OP_BREAK2)?;
        }
        self.emit(OP_BREAK)?;
        let jump = self.emit_jump(OP_JMP)?;
        let lp = &mut self.unit.loops[target];
        if node.kind == Tok::Break {
            lp.breaks.push(jump);
        } else {
            lp.continues.push(jump);
        }
        Ok(())
    }

    fn ternary(&mut self, node: &Node) -> CResult {
        let branches = &node.children[1];
        if branches.kind != Tok::Colon {
            return Err(self.error("'?' without ':'"));
        }
        let skip = self.condition(&node.children[0])?;
        self.expr(&branches.children[0])?;
        let end = self.emit_jump(OP_JMP)?;
        self.patch(skip);
        self.expr(&branches.children[1])?;
        self.patch(end);
        Ok(())
    }

    fn value(&mut self, node: &Node) -> CResult {
        if node.is_empty() {
            return Err(self.error("missing expression"));
        }
        self.expr(node)
    }

    fn assign(&mut self, node: &Node) -> CResult {
        let (lhs, rhs) = (&node.children[0], &node.children[1]);
        match lhs.kind {
            Tok::Symbol => {
                let i = self.symbol(lhs)?;
                self.value(rhs)?;
                self.emit_arg(OP_SET_SYM, i)
            }
            Tok::Var => {
                let i = self.symbol(&lhs.children[0])?;
                self.value(rhs)?;
                self.emit_arg(OP_SET_LOCAL, i)
            }
            Tok::Dot => {
                let i = self.symbol(&lhs.children[1])?;
                self.expr(&lhs.children[0])?;
                self.value(rhs)?;
                self.emit_arg(OP_SET_MEMBER, i)
            }
            Tok::Index if lhs.children[1].kind != Tok::Colon => {
                self.expr(&lhs.children[0])?;
                self.value(&lhs.children[1])?;
                self.value(rhs)?;
                self.emit(OP_INSERT)
            }
            _ => Err(self.error("bad lvalue")),
        }
    }

    fn compound(&mut self, node: &Node) -> CResult {
        let (lhs, rhs) = (&node.children[0], &node.children[1]);
        let op = node
            .kind
            .compound_base()
            .and_then(binary_op)
            .ok_or_else(|| self.error("bad compound assignment"))?;
        match lhs.kind {
            Tok::Symbol => {
                let i = self.symbol(lhs)?;
                self.emit_arg(OP_LOCAL, i)?;
                self.value(rhs)?;
                self.emit(op)?;
                self.emit_arg(OP_SET_SYM, i)
            }
            Tok::Dot => {
                let i = self.symbol(&lhs.children[1])?;
                self.expr(&lhs.children[0])?;
                self.emit(OP_DUP)?;
                self.emit_arg(OP_MEMBER, i)?;
                self.value(rhs)?;
                self.emit(op)?;
                self.emit_arg(OP_SET_MEMBER, i)
            }
            Tok::Index if lhs.children[1].kind != Tok::Colon => {
                self.expr(&lhs.children[0])?;
                self.value(&lhs.children[1])?;
                self.emit(OP_DUP2)?;
                self.emit(OP_EXTRACT)?;
                self.value(rhs)?;
                self.emit(op)?;
                self.emit(OP_INSERT)
            }
            _ => Err(self.error("bad lvalue")),
        }
    }

    fn key_const(&mut self, key: &Node) -> CResult {
        let i = match key.sym() {
            Some(name) => self.sym_const(name)?,
            None => self
                .literal_const(key)?
                .ok_or_else(|| self.error("bad hash key"))?,
        };
        self.emit_arg(OP_PUSH_CONST, i)
    }

    fn hash_literal(&mut self, list: &Node) -> CResult {
        self.emit(OP_NEW_HASH)?;
        for item in items(list) {
            if item.kind != Tok::Colon {
                return Err(self.error("hash entries need a key"));
            }
            self.key_const(&item.children[0])?;
            self.value(&item.children[1])?;
            self.emit(OP_HAPPEND)?;
        }
        Ok(())
    }

    fn call(&mut self, node: &Node) -> CResult {
        let (callee, args) = (&node.children[0], items(&node.children[1]));
        let named = args.iter().filter(|a| a.kind == Tok::Colon).count();
        if named != 0 && named != args.len() {
            return Err(self.error("mixed named and positional arguments"));
        }
        let method = callee.kind == Tok::Dot;
        if method {
            let i = self.symbol(&callee.children[1])?;
            self.expr(&callee.children[0])?;
            self.emit(OP_DUP)?;
            self.emit_arg(OP_MEMBER, i)?;
        } else {
            self.expr(callee)?;
        }
        if named > 0 {
            self.emit(OP_NEW_HASH)?;
            for arg in &args {
                self.key_const(&arg.children[0])?;
                self.value(&arg.children[1])?;
                self.emit(OP_HAPPEND)?;
            }
            self.line = node.line;
            return self.emit(if method { OP_MCALLH } else { OP_FCALLH });
        }
        if args.len() > u16::MAX as usize {
            return Err(self.error("too many arguments"));
        }
        for arg in &args {
            self.expr(arg)?;
        }
        self.line = node.line;
        self.emit_arg(if method { OP_MCALL } else { OP_FCALL }, args.len() as u16)
    }

    fn index(&mut self, node: &Node) -> CResult {
        let key = &node.children[1];
        self.expr(&node.children[0])?;
        if key.kind == Tok::Colon {
            self.expr(&key.children[0])?;
            self.expr(&key.children[1])?;
            self.line = node.line;
            return self.emit(OP_SLICE);
        }
        self.value(key)?;
        self.line = node.line;
        self.emit(OP_EXTRACT)
    }

    fn function(&mut self, node: &Node) -> CResult {
        let (params, body) = match &node.children[..] {
            [body] => (None, body),
            [params, body] => (Some(params), body),
            _ => return Err(self.error("bad function definition")),
        };
        let outer = std::mem::take(&mut self.unit);
        let line = self.line;
        let result = self.unit_code(params, &body.children[0]);
        self.unit = outer;
        self.line = line;
        let code = result?;

        let n = self.unit.functions;
        self.unit.functions += 1;
        let i = self.add_const(ConstKey::Code(n), |ctx| ctx.new_code(code))?;
        self.emit_arg(OP_FUNC, i)
    }

    /// Compiles a function body into the current (fresh) unit.
    fn unit_code(&mut self, params: Option<&Node>, body: &Node) -> CResult<CodeObj> {
        let mut args = Vec::new();
        let mut opt_args = Vec::new();
        let mut rest = None;
        let mut need_arg_vector = false;

        match params {
            None => {
                rest = Some(self.sym_const(b"arg")?);
                need_arg_vector = true;
            }
            Some(params) => {
                for param in items(params) {
                    self.line = param.line;
                    if rest.is_some() {
                        return Err(self.error("rest argument must be last"));
                    }
                    match param.kind {
                        Tok::Symbol if opt_args.is_empty() => args.push(self.symbol(param)?),
                        Tok::Assign => {
                            let sym = self.symbol(&param.children[0])?;
                            let default = self
                                .literal_const(&param.children[1])?
                                .ok_or_else(|| self.error("default arguments must be constants"))?;
                            opt_args.push((sym, default));
                        }
                        Tok::Ellipsis => {
                            rest = Some(self.symbol(&param.children[0])?);
                            need_arg_vector = true;
                        }
                        _ => return Err(self.error("bad function argument")),
                    }
                }
                if rest.is_none() {
                    rest = Some(self.sym_const(b"arg")?);
                }
            }
        }

        self.line = body.line;
        self.statements(body, true)?;
        self.emit(OP_RETURN)?;

        let unit = std::mem::take(&mut self.unit);
        Ok(CodeObj {
            bytecode: unit.bytecode,
            consts: unit.consts,
            const_hashes: unit.const_hashes,
            lines: unit.lines,
            file: self.file.to_string(),
            args,
            opt_args,
            rest,
            need_arg_vector,
        })
    }
}

/// Compiles a parsed unit. The result takes no parameters and returns the
/// value of its last statement.
pub(crate) fn generate(ctx: &mut Ctx<'_>, tree: &Node, file: &str) -> Result<Value, CompileError> {
    let mut gen = Codegen {
        ctx,
        file,
        unit: Unit::default(),
        line: tree.line,
    };
    let code = gen.unit_code(None, tree)?;
    log::debug!(
        target: "compiler",
        "compiled {}: {} words, {} constants",
        file,
        code.bytecode.len(),
        code.consts.len()
    );
    Ok(gen.ctx.new_code(code))
}
