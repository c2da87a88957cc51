//! Opcode table.
//!
//! Bytecode is a flat array of 16-bit words: an opcode followed by zero or
//! one operand word. Operands are constant-pool indices, jump targets
//! (absolute word offsets) or argument counts.

#[macro_export]
macro_rules! for_each_opcode {
    ($m: path) => {
        $m! {
            (op_nop, "nop", 0)
            (op_pop, "pop", 0)
            (op_dup, "dup", 0)
            // Duplicates the top two values, keeping their order.
            (op_dup2, "dup2", 0)
            (op_push_const, "push-const", 1)
            (op_push_one, "push-one", 0)
            (op_push_zero, "push-zero", 0)
            (op_push_nil, "push-nil", 0)
            (op_new_vec, "new-vec", 0)
            // [vec, val] -> [vec]
            (op_vappend, "vappend", 0)
            (op_new_hash, "new-hash", 0)
            // [hash, key, val] -> [hash]
            (op_happend, "happend", 0)
            // Pushes the operand stack height onto the mark stack.
            (op_mark, "mark", 0)
            (op_unmark, "unmark", 0)
            // Cuts the operand stack back to the innermost mark.
            (op_break, "break", 0)
            // Same, popping the mark.
            (op_break2, "break2", 0)
            (op_not, "not", 0)
            (op_neg, "neg", 0)
            (op_plus, "plus", 0)
            (op_minus, "minus", 0)
            (op_mul, "mul", 0)
            (op_div, "div", 0)
            (op_cat, "cat", 0)
            (op_lt, "lt", 0)
            (op_lte, "lte", 0)
            (op_gt, "gt", 0)
            (op_gte, "gte", 0)
            (op_eq, "eq", 0)
            (op_neq, "neq", 0)
            (op_jmp, "jmp", 1)
            // Backward jump; the interpreter polls for a pending collection here.
            (op_jmp_loop, "jmp-loop", 1)
            (op_jif_not_pop, "jif-not-pop", 1)
            // Jumps and pops if the top is the end-of-iteration marker.
            (op_jif_end, "jif-end", 1)
            // Short-circuit jumps; the tested value stays on the stack.
            (op_jif_true, "jif-true", 1)
            (op_jif_not, "jif-not", 1)
            // [func, args...] -> [result]
            (op_fcall, "fcall", 1)
            // [me, func, args...] -> [result]
            (op_mcall, "mcall", 1)
            // [func, hash] -> [result]
            (op_fcallh, "fcallh", 0)
            (op_mcallh, "mcallh", 0)
            (op_return, "return", 0)
            (op_local, "local", 1)
            (op_set_sym, "set-sym", 1)
            (op_set_local, "set-local", 1)
            (op_member, "member", 1)
            // [obj, val] -> [val]
            (op_set_member, "set-member", 1)
            // [box, key] -> [val]
            (op_extract, "extract", 0)
            // [box, key, val] -> [val]
            (op_insert, "insert", 0)
            // [box, from, to] -> [slice]
            (op_slice, "slice", 0)
            // Binds the code constant to the current scope.
            (op_func, "func", 1)
            // [vec, i] -> [vec, i+1, vec[i]] or [vec, i, end]
            (op_each, "each", 0)
            (op_index, "index", 0)
        }
    };
}

macro_rules! decl_constants {
    (($name: ident, $str: literal, $n: literal) $($rest:tt)*) => {
        paste::paste! { pub const [<$name:upper>]: u16 = 0; }
        decl_constants!(@parse 1, $($rest)*);
    };

    (@parse $cursor: expr, ($name: ident, $str: literal, $n: literal) $($rest:tt)*) => {
        paste::paste! {
            pub const [<$name:upper>]: u16 = $cursor;
        }
        decl_constants!(@parse $cursor + 1, $($rest)*);
    };
    (@parse $cursor: expr, ) => {}
}

for_each_opcode!(decl_constants);

macro_rules! decl_info {
    ($(($name: ident, $str: literal, $n: literal))*) => {
        paste::paste! {
            pub fn opcode_name(op: u16) -> Option<&'static str> {
                match op {
                    $([<$name:upper>] => Some($str),)*
                    _ => None,
                }
            }

            /// Number of operand words following `op`.
            pub fn operand_count(op: u16) -> usize {
                match op {
                    $([<$name:upper>] => $n,)*
                    _ => 0,
                }
            }
        }
    };
}

for_each_opcode!(decl_info);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_dense() {
        assert_eq!(OP_NOP, 0);
        assert_eq!(OP_POP, 1);
        assert_eq!(opcode_name(OP_JMP_LOOP), Some("jmp-loop"));
        assert_eq!(operand_count(OP_FCALL), 1);
        assert_eq!(operand_count(OP_RETURN), 0);
        assert_eq!(opcode_name(OP_INDEX + 1), None);
    }
}
