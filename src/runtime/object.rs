//! Heap cells and the per-type object layouts stored in them.
//!
//! Every cell is owned by the pool of its type. A cell carries a mark byte
//! and a type tag; the payload sits behind a mutex so that a value can be
//! read from any thread. Reclaimed cells are tagged [`ObjType::Freed`] and
//! keep no payload.
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, MutexGuard};

use super::{hashtable::HashTable, string::StrObj, value::Value};
use crate::{error::RtResult, vm::context::Ctx};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum ObjType {
    Str = 0,
    Vec,
    Hash,
    Code,
    Closure,
    Func,
    Native,
    Ghost,
    Freed = 0xff,
}

pub const NUM_TYPES: usize = 8;

impl ObjType {
    pub const ALL: [ObjType; NUM_TYPES] = [
        ObjType::Str,
        ObjType::Vec,
        ObjType::Hash,
        ObjType::Code,
        ObjType::Closure,
        ObjType::Func,
        ObjType::Native,
        ObjType::Ghost,
    ];

    fn from_u8(b: u8) -> Self {
        match b {
            0 => ObjType::Str,
            1 => ObjType::Vec,
            2 => ObjType::Hash,
            3 => ObjType::Code,
            4 => ObjType::Closure,
            5 => ObjType::Func,
            6 => ObjType::Native,
            7 => ObjType::Ghost,
            _ => ObjType::Freed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjType::Str => "scalar",
            ObjType::Vec => "vector",
            ObjType::Hash => "hash",
            ObjType::Code => "code",
            ObjType::Closure => "closure",
            ObjType::Func => "func",
            ObjType::Native => "func",
            ObjType::Ghost => "ghost",
            ObjType::Freed => "freed",
        }
    }
}

pub type NativeFn = fn(&mut Ctx<'_>, Value, &[Value]) -> RtResult;
pub type NativeFnWithData =
    fn(&mut Ctx<'_>, Value, &[Value], &(dyn Any + Send + Sync)) -> RtResult;

pub struct CodeObj {
    pub(crate) bytecode: Vec<u16>,
    pub(crate) consts: Vec<Value>,
    /// Cached hash of each string constant, zero for other constants.
    pub(crate) const_hashes: Vec<u32>,
    /// `(ip, line)` pairs sorted by ip.
    pub(crate) lines: Vec<(u32, u32)>,
    pub(crate) file: String,
    pub(crate) args: Vec<u16>,
    pub(crate) opt_args: Vec<(u16, u16)>,
    pub(crate) rest: Option<u16>,
    pub(crate) need_arg_vector: bool,
}

impl CodeObj {
    /// Source line of the instruction at `ip`.
    pub fn line_at(&self, ip: usize) -> u32 {
        let ip = ip as u32;
        match self.lines.binary_search_by(|(at, _)| at.cmp(&ip)) {
            Ok(i) => self.lines[i].1,
            Err(0) => self.lines.first().map(|l| l.1).unwrap_or(0),
            Err(i) => self.lines[i - 1].1,
        }
    }

    pub fn bytecode(&self) -> &[u16] {
        &self.bytecode
    }

    pub fn constants(&self) -> &[Value] {
        &self.consts
    }

    pub fn file(&self) -> &str {
        &self.file
    }
}

pub struct ClosureObj {
    pub(crate) ns: Value,
    pub(crate) next: Value,
}

pub struct FuncObj {
    /// A `Code` or `Native` object.
    pub(crate) code: Value,
    /// A `Closure` object or nil.
    pub(crate) closure: Value,
}

pub enum NativeImpl {
    Plain(NativeFn),
    WithData {
        f: NativeFnWithData,
        data: Arc<dyn Any + Send + Sync>,
        destroy: Option<fn(&(dyn Any + Send + Sync))>,
    },
}

impl Clone for NativeImpl {
    fn clone(&self) -> Self {
        match self {
            NativeImpl::Plain(f) => NativeImpl::Plain(*f),
            NativeImpl::WithData { f, data, destroy } => NativeImpl::WithData {
                f: *f,
                data: data.clone(),
                destroy: *destroy,
            },
        }
    }
}

pub struct NativeObj {
    pub(crate) imp: NativeImpl,
    pub(crate) name: &'static str,
}

/// Describes a family of host objects exposed to scripts.
pub struct GhostType {
    pub name: &'static str,
    /// Invoked with the payload when the ghost is collected.
    pub destroy: Option<fn(Box<dyn Any + Send>)>,
    pub get_member: Option<fn(&mut Ctx<'_>, &Value, &[u8]) -> RtResult<Option<Value>>>,
    pub set_member: Option<fn(&mut Ctx<'_>, &Value, &[u8], Value) -> RtResult<()>>,
}

pub struct GhostObj {
    pub(crate) ty: &'static GhostType,
    pub(crate) data: Option<Box<dyn Any + Send>>,
}

pub enum Body {
    Free,
    Str(StrObj),
    Vec(Vec<Value>),
    Hash(HashTable),
    Code(Arc<CodeObj>),
    Closure(ClosureObj),
    Func(FuncObj),
    Native(NativeObj),
    Ghost(GhostObj),
}

impl Body {
    /// Pushes every value this body refers to onto `out`.
    pub(crate) fn trace(&self, out: &mut Vec<Value>) {
        match self {
            Body::Vec(v) => out.extend(v.iter().cloned()),
            Body::Hash(h) => h.trace(out),
            Body::Code(c) => out.extend(c.consts.iter().cloned()),
            Body::Closure(c) => {
                out.push(c.ns.clone());
                out.push(c.next.clone());
            }
            Body::Func(f) => {
                out.push(f.code.clone());
                out.push(f.closure.clone());
            }
            Body::Free | Body::Str(_) | Body::Native(_) | Body::Ghost(_) => {}
        }
    }
}

pub struct ObjCell {
    mark: AtomicBool,
    ty: AtomicU8,
    body: Mutex<Body>,
}

/// Shared handle to a heap cell.
#[derive(Clone)]
pub struct Gc(Arc<ObjCell>);

impl Gc {
    pub(crate) fn new_free() -> Gc {
        Gc(Arc::new(ObjCell {
            mark: AtomicBool::new(false),
            ty: AtomicU8::new(ObjType::Freed as u8),
            body: Mutex::new(Body::Free),
        }))
    }

    #[inline]
    pub fn ty(&self) -> ObjType {
        ObjType::from_u8(self.0.ty.load(Ordering::Acquire))
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Gc) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Locks the payload. Touching a reclaimed cell is a liveness bug.
    pub(crate) fn body(&self) -> MutexGuard<'_, Body> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "strict-freed-check")] {
                assert!(self.ty() != ObjType::Freed, "use of reclaimed object");
            } else {
                debug_assert!(self.ty() != ObjType::Freed, "use of reclaimed object");
            }
        }
        self.0.body.lock()
    }

    /// Fills a free cell handed out by a pool.
    pub(crate) fn install(&self, ty: ObjType, body: Body) {
        debug_assert_eq!(self.ty(), ObjType::Freed, "allocating a live cell");
        *self.0.body.lock() = body;
        self.0.mark.store(false, Ordering::Relaxed);
        self.0.ty.store(ty as u8, Ordering::Release);
    }

    /// Tags the cell freed and hands back its payload for cleanup.
    pub(crate) fn reclaim(&self) -> Body {
        self.0.ty.store(ObjType::Freed as u8, Ordering::Release);
        std::mem::replace(&mut *self.0.body.lock(), Body::Free)
    }

    /// Sets the mark byte, returning whether it was already set.
    #[inline]
    pub(crate) fn mark(&self) -> bool {
        self.0.mark.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn is_marked(&self) -> bool {
        self.0.mark.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_mark(&self) {
        self.0.mark.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Gc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}@{:#x}>", self.ty().name(), self.addr())
    }
}
