use std::fmt;
use std::rc::Rc;

use super::value::grow_capacity;

const MAX_LOAD: f64 = 0.75;

/// FNV-1a over raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// An interned identifier. Two keys with the same text are the same `Rc`,
/// so identity comparison is enough everywhere past the interner.
#[derive(Debug)]
pub struct Key {
    chars: Box<str>,
    hash: u32,
    /// Position in the interner, stable for the life of the interner.
    slot: usize,
}

impl Key {
    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.chars)
    }
}

#[derive(Debug, Clone)]
enum Entry<V> {
    Empty,
    Tombstone,
    Occupied { key: Rc<Key>, value: V },
}

/// Open-addressing hash table keyed by interned [`Key`]s, probing linearly.
///
/// `count` includes tombstones so the load factor accounts for them; it is
/// recomputed from live entries whenever the table grows.
#[derive(Debug, Clone)]
pub struct Table<V> {
    entries: Vec<Entry<V>>,
    count: usize,
    live: usize,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Table<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
            live: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slot index for `key`: the matching entry, else the first tombstone
    /// seen, else the empty slot that ended the probe.
    fn find_entry(entries: &[Entry<V>], key: &Rc<Key>) -> usize {
        let capacity = entries.len();
        let mut index = key.hash as usize % capacity;
        let mut tombstone = None;
        loop {
            match &entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    tombstone.get_or_insert(index);
                }
                Entry::Occupied { key: k, .. } if Rc::ptr_eq(k, key) => return index,
                Entry::Occupied { .. } => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(
            &mut self.entries,
            std::iter::repeat_with(|| Entry::Empty).take(capacity).collect(),
        );
        self.count = 0;
        for entry in old {
            if let Entry::Occupied { key, value } = entry {
                let index = Self::find_entry(&self.entries, &key);
                self.entries[index] = Entry::Occupied { key, value };
                self.count += 1;
            }
        }
    }

    pub fn get(&self, key: &Rc<Key>) -> Option<&V> {
        if self.count == 0 {
            return None;
        }
        match &self.entries[Self::find_entry(&self.entries, key)] {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: Rc<Key>, value: V) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let over_load = (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD;
        if over_load {
            self.adjust_capacity(grow_capacity(self.capacity()));
        }
        let index = Self::find_entry(&self.entries, &key);
        let slot = &mut self.entries[index];
        let is_new = !matches!(slot, Entry::Occupied { .. });
        // Reusing a tombstone still counts as an insert.
        if is_new {
            self.count += 1;
            self.live += 1;
        }
        *slot = Entry::Occupied { key, value };
        is_new
    }

    /// Replace the entry with a tombstone. Returns `true` if something was removed.
    pub fn delete(&mut self, key: &Rc<Key>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let slot = &mut self.entries[index];
        if !matches!(slot, Entry::Occupied { .. }) {
            return false;
        }
        *slot = Entry::Tombstone;
        self.live -= 1;
        true
    }

    /// Content lookup used by the interner: compares text instead of identity.
    pub fn find_key(&self, chars: &str, hash: u32) -> Option<&Rc<Key>> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Occupied { key, .. } if key.hash == hash && &*key.chars == chars => {
                    return Some(key)
                }
                Entry::Tombstone | Entry::Occupied { .. } => {}
            }
            index = (index + 1) % capacity;
        }
    }
}

/// Owns every [`Key`] the compiler and VM hand out.
#[derive(Debug, Default)]
pub struct Interner {
    table: Table<()>,
    keys: Vec<Rc<Key>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the unique key for `text`, creating it on first sight.
    pub fn intern(&mut self, text: &str) -> Rc<Key> {
        let hash = hash_bytes(text.as_bytes());
        if let Some(key) = self.table.find_key(text, hash) {
            return Rc::clone(key);
        }
        let key = Rc::new(Key {
            chars: text.into(),
            hash,
            slot: self.keys.len(),
        });
        self.table.set(Rc::clone(&key), ());
        self.keys.push(Rc::clone(&key));
        key
    }

    /// The existing key for `text`, without interning it.
    pub fn get(&self, text: &str) -> Option<Rc<Key>> {
        self.table.find_key(text, hash_bytes(text.as_bytes())).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fnv_reference_values() {
        assert_eq!(hash_bytes(b""), 2_166_136_261);
        assert_eq!(hash_bytes(b"a"), 0xe40c_292c);
    }

    #[test]
    fn interning_is_identity() {
        let mut interner = Interner::new();
        let a = interner.intern("alpha");
        let b = interner.intern("alpha");
        let c = interner.intern("beta");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
        assert_eq!(c.slot(), 1);
    }

    #[test]
    fn set_then_get_with_fresh_key() {
        let mut interner = Interner::new();
        let mut table = Table::new();
        table.set(interner.intern("x"), 42);
        assert_eq!(table.get(&interner.intern("x")), Some(&42));
        assert_eq!(table.get(&interner.intern("y")), None);
    }

    #[test]
    fn set_reports_new_keys_and_overwrites() {
        let mut interner = Interner::new();
        let mut table = Table::new();
        let k = interner.intern("k");
        assert!(table.set(Rc::clone(&k), 1));
        assert!(!table.set(Rc::clone(&k), 2));
        assert_eq!(table.get(&k), Some(&2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_leaves_probe_chain_intact() {
        let mut interner = Interner::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..20).map(|i| interner.intern(&format!("k{i}"))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(Rc::clone(key), i);
        }
        assert!(table.delete(&keys[3]));
        assert!(!table.delete(&keys[3]));
        assert_eq!(table.get(&keys[3]), None);
        for (i, key) in keys.iter().enumerate().filter(|(i, _)| *i != 3) {
            assert_eq!(table.get(key), Some(&i));
        }
        assert_eq!(table.len(), 19);
        // The tombstone slot is reusable.
        assert!(table.set(Rc::clone(&keys[3]), 99));
        assert_eq!(table.get(&keys[3]), Some(&99));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut interner = Interner::new();
        let mut table = Table::new();
        for i in 0..7 {
            table.set(interner.intern(&i.to_string()), ());
        }
        assert_eq!(table.capacity(), 16, "seventh insert exceeds 8 * 0.75");
    }

    #[test]
    fn resize_drops_tombstones() {
        let mut interner = Interner::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..6).map(|i| interner.intern(&format!("k{i}"))).collect();
        for key in &keys {
            table.set(Rc::clone(key), ());
        }
        for key in &keys {
            table.delete(key);
        }
        assert_eq!((table.capacity(), table.count, table.len()), (8, 6, 0));

        table.set(interner.intern("fresh"), ());
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.count, 1, "tombstones are not carried into the new buffer");
        assert_eq!(table.len(), 1);
        assert!(keys.iter().all(|key| table.get(key).is_none()));
    }

    #[test]
    fn find_key_probes_past_tombstones() {
        let colliding = |text: &str, slot| {
            Rc::new(Key {
                chars: text.into(),
                hash: 0,
                slot,
            })
        };
        let (a, b) = (colliding("a", 0), colliding("b", 1));
        let mut table = Table::new();
        table.set(Rc::clone(&a), ());
        table.set(Rc::clone(&b), ());
        table.delete(&a);

        let found = table.find_key("b", 0).unwrap();
        assert!(Rc::ptr_eq(found, &b));
        assert!(table.find_key("a", 0).is_none());
        assert!(table.find_key("c", 0).is_none(), "stops at the first empty slot");
        assert_eq!(table.get(&b), Some(&()));
    }

    #[test]
    fn interner_get_does_not_intern() {
        let mut interner = Interner::new();
        let key = interner.intern("known");
        assert!(Rc::ptr_eq(&interner.get("known").unwrap(), &key));
        assert!(interner.get("unknown").is_none());
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn find_key_by_content() {
        let mut interner = Interner::new();
        let key = interner.intern("name");
        let mut table = Table::new();
        table.set(Rc::clone(&key), ());
        let found = table.find_key("name", hash_bytes(b"name")).unwrap();
        assert!(Rc::ptr_eq(found, &key));
        assert!(table.find_key("nope", hash_bytes(b"nope")).is_none());
    }
}
