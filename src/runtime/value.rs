//! The value type shared by the compiler, the interpreter and the host.
use std::fmt;

use super::{
    object::{Body, Gc, GhostType, ObjType},
    string::{format_num, parse_num},
};

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Num(f64),
    Obj(Gc),
    /// End-of-iteration marker pushed by the foreach opcodes. Never escapes
    /// to scripts.
    #[doc(hidden)]
    End,
}

macro_rules! declare_typed {
    ($($name: ident => $typ: ident),*) => {
        paste::paste! {
            impl Value {
                $(
                    #[inline]
                    pub fn [<is_ $name>](&self) -> bool {
                        matches!(self, Value::Obj(o) if o.ty() == ObjType::$typ)
                    }
                )*
            }
        }
    };
}

declare_typed!(
    str => Str,
    vec => Vec,
    hash => Hash,
    code => Code,
    closure => Closure,
    func => Func,
    native => Native,
    ghost => Ghost
);

impl Value {
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_num(&self) -> bool {
        matches!(self, Value::Num(_))
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        matches!(self, Value::End)
    }

    pub fn is_scalar(&self) -> bool {
        self.is_num() || self.is_str()
    }

    pub fn is_callable(&self) -> bool {
        self.is_func() || self.is_native()
    }

    pub fn obj_type(&self) -> Option<ObjType> {
        match self {
            Value::Obj(o) => Some(o.ty()),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&Gc> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// 1 or 0.
    #[inline]
    pub fn from_bool(b: bool) -> Value {
        Value::Num(if b { 1.0 } else { 0.0 })
    }

    pub fn num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Same number or same object.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::End, Value::End) => true,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Num(_) => "scalar",
            Value::Obj(o) => o.ty().name(),
            Value::End => "end",
        }
    }

    /// Runs `f` over the bytes of a string value.
    pub fn with_str<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Str)?;
        let body = o.body();
        match &*body {
            Body::Str(s) => Some(f(s.as_bytes())),
            _ => None,
        }
    }

    pub fn str_bytes(&self) -> Option<Vec<u8>> {
        self.with_str(|b| b.to_vec())
    }

    pub fn to_str_lossy(&self) -> Option<String> {
        self.with_str(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Numeric value of a number or a numeric string.
    pub fn to_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Obj(_) => self.with_str(parse_num).flatten(),
            _ => None,
        }
    }

    /// Byte rendering of a scalar; `None` for anything else.
    pub fn stringify(&self) -> Option<Vec<u8>> {
        match self {
            Value::Num(n) => Some(format_num(*n).into_bytes()),
            _ => self.str_bytes(),
        }
    }

    pub fn vec_len(&self) -> Option<usize> {
        self.with_vec(|v| v.len())
    }

    pub fn vec_get(&self, i: usize) -> Option<Value> {
        self.with_vec(|v| v.get(i).cloned()).flatten()
    }

    /// Snapshot of a vector's elements.
    pub fn vec_items(&self) -> Option<Vec<Value>> {
        self.with_vec(|v| v.clone())
    }

    pub fn vec_push(&self, item: Value) -> bool {
        self.with_vec_mut(|v| v.push(item)).is_some()
    }

    pub fn vec_set(&self, i: usize, item: Value) -> bool {
        self.with_vec_mut(|v| match v.get_mut(i) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    pub(crate) fn with_vec<R>(&self, f: impl FnOnce(&Vec<Value>) -> R) -> Option<R> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Vec)?;
        let body = o.body();
        match &*body {
            Body::Vec(v) => Some(f(v)),
            _ => None,
        }
    }

    pub(crate) fn with_vec_mut<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Vec)?;
        let mut body = o.body();
        match &mut *body {
            Body::Vec(v) => Some(f(v)),
            _ => None,
        }
    }

    pub fn hash_get(&self, key: &Value) -> Option<Value> {
        self.with_hash(|h| h.get(key)).flatten()
    }

    pub fn hash_len(&self) -> Option<usize> {
        self.with_hash(|h| h.len())
    }

    pub fn hash_keys(&self) -> Option<Vec<Value>> {
        self.with_hash(|h| h.keys())
    }

    pub(crate) fn with_hash<R>(
        &self,
        f: impl FnOnce(&super::hashtable::HashTable) -> R,
    ) -> Option<R> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Hash)?;
        let body = o.body();
        match &*body {
            Body::Hash(h) => Some(f(h)),
            _ => None,
        }
    }

    pub fn ghost_type(&self) -> Option<&'static GhostType> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Ghost)?;
        let body = o.body();
        match &*body {
            Body::Ghost(g) => Some(g.ty),
            _ => None,
        }
    }

    /// Runs `f` over a ghost's payload if it has type `T`.
    pub fn with_ghost<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Ghost)?;
        let mut body = o.body();
        match &mut *body {
            Body::Ghost(g) => g.data.as_mut()?.downcast_mut::<T>().map(f),
            _ => None,
        }
    }

    /// Code object of a bound function.
    pub fn func_code(&self) -> Option<Value> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Func)?;
        let body = o.body();
        match &*body {
            Body::Func(f) => Some(f.code.clone()),
            _ => None,
        }
    }

    /// Registered name of a native, or of the native a function wraps.
    pub fn native_name(&self) -> Option<&'static str> {
        let target = self.func_code().unwrap_or_else(|| self.clone());
        let o = target.as_obj().filter(|o| o.ty() == ObjType::Native)?;
        let body = o.body();
        match &*body {
            Body::Native(n) => Some(n.name),
            _ => None,
        }
    }

    /// Closure a bound function was created in, nil for top-level natives.
    pub fn func_closure(&self) -> Option<Value> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Func)?;
        let body = o.body();
        match &*body {
            Body::Func(f) => Some(f.closure.clone()),
            _ => None,
        }
    }

    pub(crate) fn closure_parts(&self) -> Option<(Value, Value)> {
        let o = self.as_obj().filter(|o| o.ty() == ObjType::Closure)?;
        let body = o.body();
        match &*body {
            Body::Closure(c) => Some((c.ns.clone(), c.next.clone())),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<Gc> for Value {
    fn from(o: Gc) -> Self {
        Value::Obj(o)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Num(n) => f.write_str(&format_num(*n)),
            Value::End => f.write_str("<end>"),
            Value::Obj(o) if o.ty() == ObjType::Str => match self.to_str_lossy() {
                Some(s) => write!(f, "{:?}", s),
                None => o.fmt(f),
            },
            Value::Obj(o) => o.fmt(f),
        }
    }
}
