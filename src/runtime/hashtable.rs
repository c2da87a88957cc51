//! Open-addressed hash table used for the `hash` type and for every
//! namespace.
//!
//! Entries are appended to a dense array; a separate index array of twice
//! the entry capacity maps hash slots to entry slots. Deleting leaves a
//! tombstone in both arrays until the next rebuild.
use super::{
    object::{Body, ObjType},
    string::{hash_bytes, hash_number},
    value::Value,
};

const ENT_EMPTY: i32 = -1;
const ENT_DELETED: i32 = -2;
const MIN_LGSZ: u32 = 2;

#[derive(Clone)]
struct Entry {
    hash: u32,
    interned: bool,
    key: Value,
    val: Value,
}

/// Backing storage of a table. Replaced wholesale on rebuild.
pub struct HashRec {
    lgsz: u32,
    size: usize,
    dels: usize,
    ents: Vec<Option<Entry>>,
    idx: Vec<i32>,
}

impl HashRec {
    fn new(lgsz: u32) -> Box<Self> {
        Box::new(Self {
            lgsz,
            size: 0,
            dels: 0,
            ents: Vec::with_capacity(1 << lgsz),
            idx: vec![ENT_EMPTY; 2 << lgsz],
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        1 << self.lgsz
    }

    #[inline]
    fn start(&self, hash: u32) -> usize {
        if self.lgsz == 0 {
            0
        } else {
            (hash >> (32 - self.lgsz)) as usize
        }
    }

    #[inline]
    fn step(&self, hash: u32) -> usize {
        (hash.wrapping_mul(2).wrapping_add(1) as usize) & (self.idx.len() - 1)
    }

    /// Index-array slot and entry slot holding `key`.
    fn find(&self, key: &Value, hash: u32, interned: bool) -> Option<(usize, usize)> {
        let mask = self.idx.len() - 1;
        let step = self.step(hash);
        let mut i = self.start(hash);
        loop {
            match self.idx[i] {
                ENT_EMPTY => return None,
                ENT_DELETED => {}
                e => {
                    let e = e as usize;
                    if let Some(ent) = &self.ents[e] {
                        if ent.hash == hash && same_key(ent, key, interned) {
                            return Some((i, e));
                        }
                    }
                }
            }
            i = (i + step) & mask;
        }
    }

    fn insert_new(&mut self, ent: Entry) {
        let mask = self.idx.len() - 1;
        let step = self.step(ent.hash);
        let mut i = self.start(ent.hash);
        while self.idx[i] >= 0 {
            i = (i + step) & mask;
        }
        self.idx[i] = self.ents.len() as i32;
        self.ents.push(Some(ent));
        self.size += 1;
    }
}

fn same_key(ent: &Entry, key: &Value, interned: bool) -> bool {
    match (&ent.key, key) {
        (Value::Obj(a), Value::Obj(b)) if a.ptr_eq(b) => true,
        // Distinct interned strings never share contents.
        (Value::Obj(_), Value::Obj(_)) if ent.interned && interned => false,
        _ => keys_equal(&ent.key, key),
    }
}

/// Key equality: numbers by value, strings by content, everything else by
/// identity.
pub fn keys_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            if x.ty() != ObjType::Str || y.ty() != ObjType::Str {
                return false;
            }
            // Copy one side out so two string locks are never held at once.
            match a.str_bytes() {
                Some(bytes) => b.with_str(|other| other == bytes.as_slice()).unwrap_or(false),
                None => false,
            }
        }
        (Value::Nil, Value::Nil) => true,
        _ => false,
    }
}

/// Hash code of a key plus whether it is an interned symbol.
pub fn hash_key(key: &Value) -> (u32, bool) {
    match key {
        Value::Num(n) => (hash_number(*n), false),
        Value::Obj(o) if o.ty() == ObjType::Str => {
            let mut body = o.body();
            match &mut *body {
                Body::Str(s) => (s.hash_code(), s.is_interned()),
                _ => (0, false),
            }
        }
        Value::Obj(o) => (hash_bytes(&o.addr().to_le_bytes()), false),
        Value::Nil | Value::End => (0, false),
    }
}

#[derive(Default)]
pub struct HashTable {
    rec: Option<Box<HashRec>>,
}

impl HashTable {
    pub fn new() -> Self {
        Self { rec: None }
    }

    pub fn len(&self) -> usize {
        self.rec.as_ref().map_or(0, |r| r.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the entry array, zero before the first insert.
    pub fn capacity(&self) -> usize {
        self.rec.as_ref().map_or(0, |r| r.capacity())
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        let (hash, interned) = hash_key(key);
        self.get_hashed(key, hash, interned)
    }

    pub(crate) fn get_hashed(&self, key: &Value, hash: u32, interned: bool) -> Option<Value> {
        let rec = self.rec.as_ref()?;
        let (_, e) = rec.find(key, hash, interned)?;
        rec.ents[e].as_ref().map(|ent| ent.val.clone())
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or updates. Returns the storage retired by a rebuild, which
    /// the caller hands to the collector for deferred release.
    pub fn set(&mut self, key: Value, val: Value) -> Option<Box<HashRec>> {
        let (hash, interned) = hash_key(&key);
        self.set_hashed(key, hash, interned, val)
    }

    pub(crate) fn set_hashed(
        &mut self,
        key: Value,
        hash: u32,
        interned: bool,
        val: Value,
    ) -> Option<Box<HashRec>> {
        if let Some(rec) = self.rec.as_mut() {
            if let Some((_, e)) = rec.find(&key, hash, interned) {
                if let Some(ent) = rec.ents[e].as_mut() {
                    ent.val = val;
                }
                return None;
            }
        }

        let full = self
            .rec
            .as_ref()
            .map(|rec| (rec.ents.len() >= rec.capacity(), rec.size));
        let retired = match full {
            None => {
                self.rec = Some(HashRec::new(MIN_LGSZ));
                None
            }
            Some((true, live)) => self.rebuild(live + 1),
            Some((false, _)) => None,
        };

        if let Some(rec) = self.rec.as_mut() {
            rec.insert_new(Entry {
                hash,
                interned,
                key,
                val,
            });
        }
        retired
    }

    /// Removes `key`, returning its value and any retired storage.
    pub fn delete(&mut self, key: &Value) -> (Option<Value>, Option<Box<HashRec>>) {
        let (hash, interned) = hash_key(key);
        let rec = match self.rec.as_mut() {
            Some(rec) => rec,
            None => return (None, None),
        };
        let (i, e) = match rec.find(key, hash, interned) {
            Some(found) => found,
            None => return (None, None),
        };
        rec.idx[i] = ENT_DELETED;
        let old = rec.ents[e].take().map(|ent| ent.val);
        rec.size -= 1;
        rec.dels += 1;

        let shrink = rec.lgsz > MIN_LGSZ && rec.size < rec.capacity() / 4;
        let live = rec.size;
        let retired = if shrink { self.rebuild(live) } else { None };
        (old, retired)
    }

    /// Rehashes live entries into storage sized for `live` entries at no
    /// more than half load.
    fn rebuild(&mut self, live: usize) -> Option<Box<HashRec>> {
        let mut lgsz = MIN_LGSZ;
        while (1usize << lgsz) < live * 2 {
            lgsz += 1;
        }
        let mut fresh = HashRec::new(lgsz);
        let old = self.rec.take();
        if let Some(old) = &old {
            for ent in old.ents.iter().flatten() {
                fresh.insert_new(ent.clone());
            }
            log::trace!(
                target: "gc",
                "hash rebuild {} -> {} ({} live, {} tombstones)",
                old.capacity(),
                fresh.capacity(),
                fresh.size,
                old.dels
            );
        }
        self.rec = Some(fresh);
        old
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.rec
            .iter()
            .flat_map(|r| r.ents.iter().flatten())
            .map(|ent| (&ent.key, &ent.val))
    }

    pub(crate) fn trace(&self, out: &mut Vec<Value>) {
        for (k, v) in self.iter() {
            out.push(k.clone());
            out.push(v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::runtime::Runtime;

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn matches_model_under_random_operations() {
        let mut table = HashTable::new();
        let mut model: HashMap<u64, f64> = HashMap::new();
        let mut rng = Lcg(0x5eed);

        for step in 0..20_000 {
            let key = rng.next() % 512;
            let k = Value::Num(key as f64);
            if rng.next() % 3 == 0 {
                let (old, _) = table.delete(&k);
                assert_eq!(old.and_then(|v| v.num()), model.remove(&key));
            } else {
                let before = table.len();
                let existed = model.insert(key, step as f64).is_some();
                table.set(k, Value::Num(step as f64));
                assert_eq!(table.len(), if existed { before } else { before + 1 });
            }
            assert_eq!(table.len(), model.len());
        }

        for key in 0..512u64 {
            let got = table.get(&Value::Num(key as f64)).and_then(|v| v.num());
            assert_eq!(got, model.get(&key).copied(), "key {}", key);
        }
        let mut keys: Vec<u64> = table
            .keys()
            .iter()
            .map(|k| k.num().unwrap() as u64)
            .collect();
        keys.sort_unstable();
        let mut expected: Vec<u64> = model.keys().copied().collect();
        expected.sort_unstable();
        assert_eq!(keys, expected);
    }

    #[test]
    fn reinsert_updates_without_growing() {
        let mut table = HashTable::new();
        table.set(Value::Num(1.0), Value::Num(10.0));
        table.set(Value::Num(1.0), Value::Num(20.0));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&Value::Num(1.0)).and_then(|v| v.num()), Some(20.0));
    }

    #[test]
    fn negative_zero_is_the_same_key() {
        let mut table = HashTable::new();
        table.set(Value::Num(0.0), Value::Num(1.0));
        assert!(table.contains(&Value::Num(-0.0)));
    }

    #[test]
    fn grows_and_shrinks() {
        let mut table = HashTable::new();
        for i in 0..100 {
            table.set(Value::Num(i as f64), Value::Nil);
        }
        let grown = table.capacity();
        assert!(grown >= 100);
        let mut retired = 0;
        for i in 0..98 {
            if table.delete(&Value::Num(i as f64)).1.is_some() {
                retired += 1;
            }
        }
        assert!(retired > 0);
        assert!(table.capacity() < grown);
        assert_eq!(table.len(), 2);
        assert!(table.contains(&Value::Num(99.0)));
    }

    #[test]
    fn nil_key() {
        let mut table = HashTable::new();
        assert!(table.get(&Value::Nil).is_none());
        table.set(Value::Nil, Value::Num(3.0));
        assert_eq!(table.get(&Value::Nil).and_then(|v| v.num()), Some(3.0));
    }

    #[test]
    fn interned_and_plain_strings_are_the_same_key() {
        let rt = Runtime::new();
        let mut cx = rt.new_context();
        cx.with(|ctx| {
            let sym = ctx.intern(b"speed");
            let plain = ctx.new_string("speed");
            let other = ctx.intern(b"spend");
            let (hash, interned) = hash_key(&sym);
            assert!(interned);
            assert_eq!(hash_key(&plain), (hash, false));

            let mut table = HashTable::new();
            table.set(plain.clone(), Value::Num(1.0));
            assert_eq!(table.get_hashed(&sym, hash, true).and_then(|v| v.num()), Some(1.0));
            assert!(table.get(&other).is_none());
            table.set(sym.clone(), Value::Num(2.0));
            assert_eq!(table.len(), 1);
            assert_eq!(table.get(&plain).and_then(|v| v.num()), Some(2.0));

            let mut table = HashTable::new();
            table.set(sym.clone(), Value::Num(3.0));
            table.set(other.clone(), Value::Num(4.0));
            assert_eq!(table.get(&plain).and_then(|v| v.num()), Some(3.0));
            assert_eq!(table.delete(&plain).0.and_then(|v| v.num()), Some(3.0));
            assert_eq!(table.len(), 1);
            assert!(table.get_hashed(&sym, hash, true).is_none());
        });
    }
}
