//! I define [`Buffer`], a deduplicating set of statements
//! used to stage inferred statements before they are written to the store.
//!
//! Statements are stored flat, four value slots per statement,
//! in fixed-size blocks allocated on demand.
//! They are indexed by an open-addressing hash table of 64-bit buckets,
//! each packing a 32-bit hash, an occupied flag and a 31-bit position.
//!
//! Producers do not write into the shared table directly:
//! each of them uses its own [`Appender`], which batches statements
//! and merges them into the table under a lock.
use std::{
    collections::hash_map::RandomState,
    hash::BuildHasher,
    mem,
    sync::{Mutex, MutexGuard, PoisonError},
};

use sophia_store::{
    term::{GraphName, Value},
    Statement,
};

/// Number of statements per storage block (and per [`Appender`] batch).
pub const BLOCK_STATEMENTS: usize = 1 << 10;
const BLOCK_SLOTS: usize = BLOCK_STATEMENTS * 4;
const INITIAL_BUCKETS: usize = 1 << 4;

const OCCUPIED: u64 = 1 << 31;
const POSITION_MASK: u64 = OCCUPIED - 1;

/// A deduplicating, append-only set of statements.
///
/// See [module documentation](self).
pub struct Buffer {
    hasher: RandomState,
    table: Mutex<Table>,
}

struct Table {
    blocks: Vec<Vec<Option<Value>>>,
    len: usize,
    buckets: Vec<u64>,
    mask: usize,
}

type Pending = ([Value; 3], GraphName, u32);

impl Buffer {
    /// A new empty buffer
    pub fn new() -> Self {
        Buffer {
            hasher: RandomState::new(),
            table: Mutex::new(Table::new()),
        }
    }

    /// A new [`Appender`] feeding this buffer.
    pub fn appender(&self) -> Appender<'_> {
        Appender {
            buffer: self,
            pending: Vec::new(),
            added: 0,
        }
    }

    /// The number of distinct statements in this buffer.
    pub fn size(&self) -> usize {
        self.lock().len
    }

    /// Whether this buffer contains no statement.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Iterate over the statements of this buffer, in insertion order.
    ///
    /// Exclusive access guarantees that no [`Appender`] is still feeding this buffer,
    /// so the returned iterator can be recreated at will and always yields the same sequence.
    pub fn iter(&mut self) -> impl Iterator<Item = Statement> + '_ {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        let table = &*table;
        (0..table.len).filter_map(move |pos| table.statement(pos))
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hash(&self, [s, p, o]: &[Value; 3], c: &GraphName) -> u32 {
        let mut h = self.hasher.hash_one(s);
        h = h.wrapping_mul(31).wrapping_add(self.hasher.hash_one(p));
        h = h.wrapping_mul(31).wrapping_add(self.hasher.hash_one(o));
        h = h
            .wrapping_mul(31)
            .wrapping_add(c.as_ref().map(|c| self.hasher.hash_one(c)).unwrap_or(0));
        (h ^ (h >> 32)) as u32
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("size", &self.size()).finish()
    }
}

/// Pack a hash and a position into a bucket of the table.
fn bucket(hash: u32, pos: usize) -> u64 {
    debug_assert!(
        pos as u64 <= POSITION_MASK,
        "buffer can not hold more than 2^31 statements"
    );
    (u64::from(hash) << 32) | OCCUPIED | (pos as u64 & POSITION_MASK)
}

impl Table {
    fn new() -> Self {
        Table {
            blocks: Vec::new(),
            len: 0,
            buckets: vec![0; INITIAL_BUCKETS],
            mask: INITIAL_BUCKETS - 1,
        }
    }

    fn slots(&self, pos: usize) -> &[Option<Value>] {
        let offset = (pos % BLOCK_STATEMENTS) * 4;
        &self.blocks[pos / BLOCK_STATEMENTS][offset..offset + 4]
    }

    fn statement(&self, pos: usize) -> Option<Statement> {
        let [Some(s), Some(p), Some(o), c] = self.slots(pos) else {
            return None;
        };
        Some(Statement::new(s.clone(), p.clone(), o.clone(), c.clone()))
    }

    fn holds(&self, pos: usize, spo: &[Value; 3], c: &GraphName) -> bool {
        let slots = self.slots(pos);
        slots[0].as_ref() == Some(&spo[0])
            && slots[1].as_ref() == Some(&spo[1])
            && slots[2].as_ref() == Some(&spo[2])
            && slots[3] == *c
    }

    /// Insert the tuple if not already present; return whether it was inserted.
    fn insert(&mut self, spo: [Value; 3], c: GraphName, hash: u32) -> bool {
        let mut i = hash as usize & self.mask;
        loop {
            let bucket = self.buckets[i];
            if bucket == 0 {
                break;
            }
            if (bucket >> 32) as u32 == hash
                && self.holds((bucket & POSITION_MASK) as usize, &spo, &c)
            {
                return false;
            }
            i = (i + 1) & self.mask;
        }
        let pos = self.len;
        self.buckets[i] = bucket(hash, pos);
        if pos % BLOCK_STATEMENTS == 0 {
            self.blocks.push(Vec::with_capacity(BLOCK_SLOTS));
        }
        if let Some(block) = self.blocks.last_mut() {
            let [s, p, o] = spo;
            block.extend([Some(s), Some(p), Some(o), c]);
        }
        self.len += 1;
        if self.len * 2 > self.buckets.len() {
            self.grow();
        }
        true
    }

    fn grow(&mut self) {
        let capacity = self.buckets.len() * 2;
        let old = mem::replace(&mut self.buckets, vec![0; capacity]);
        self.mask = capacity - 1;
        for bucket in old.into_iter().filter(|b| *b != 0) {
            let mut i = (bucket >> 32) as usize & self.mask;
            while self.buckets[i] != 0 {
                i = (i + 1) & self.mask;
            }
            self.buckets[i] = bucket;
        }
    }
}

/// A batching front-end to a [`Buffer`].
///
/// Statements are accumulated privately, and merged into the buffer
/// when the batch is full, on [`flush`](Appender::flush), or when the appender is dropped.
pub struct Appender<'a> {
    buffer: &'a Buffer,
    pending: Vec<Pending>,
    added: usize,
}

impl Appender<'_> {
    /// Append one statement.
    pub fn append(&mut self, statement: Statement) {
        let (spo, c) = statement.into_parts();
        let hash = self.buffer.hash(&spo, &c);
        if self.pending.capacity() == 0 {
            self.pending.reserve_exact(BLOCK_STATEMENTS);
        }
        self.pending.push((spo, c, hash));
        if self.pending.len() >= BLOCK_STATEMENTS {
            self.merge();
        }
    }

    /// Merge pending statements into the buffer.
    ///
    /// Return the number of statements that were not already in the buffer,
    /// among all those appended since the previous call to `flush`.
    pub fn flush(&mut self) -> usize {
        self.merge();
        mem::take(&mut self.added)
    }

    fn merge(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut table = self.buffer.lock();
        for (spo, c, hash) in self.pending.drain(..) {
            if table.insert(spo, c, hash) {
                self.added += 1;
            }
        }
    }
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        self.merge();
    }
}
