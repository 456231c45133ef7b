//! Lock-free multi-process hash map.
//!
//! A [`SharedMap`] hashes keys with seeded Murmur3 into a power-of-two array
//! of 64-slot **buckets**, each holding a bitmap-gated strip of 15 index
//! cells. Concurrency is a two-level protocol:
//!
//! * the bucket **bitmap** and its generation are one DWCAS word — insertion
//!   publishes a cell bitmap-last, removal retires it bitmap-first, so a set
//!   bit always covers fully written cell words;
//! * each cell's `(data_slot, generation)` pair is itself a DWCAS word — the
//!   generation is handed to callers as the update **token**, and a reader
//!   that observes it change mid-scan restarts, which is what makes a get
//!   concurrent with an update return a whole value, never a torn one.
//!
//! Growth doubles the bucket array and rehashes incrementally: every thread
//! entering the map races to claim source buckets off a cursor until the
//! previous index is drained, then the old array is pushed onto the deferred
//! release list, which is only drained while the instance is quiescent.

use log::debug;
use rand::Rng;

use crate::arena::{self, hdr, Arena, NODE_SLOTS};
use crate::backoff::Backoff;
use crate::error::Error;
use crate::hash::murmur3_x64_128;
use crate::list;
use crate::pr::{self, DWord};
use crate::shm::{self, Region};
use crate::value::{self, byte_slots, Segment, ValueKind};

/// Map control-block slots past the common header.
pub(crate) mod mh {
    use crate::arena::hdr::BASE;

    pub const DEFER_HEAD: i64 = BASE;
    pub const DEFER_HD_CNT: i64 = BASE + 1;
    pub const DEFER_TAIL: i64 = BASE + 2;
    pub const DEFER_TL_CNT: i64 = BASE + 3;
    /// Active bucket array (slot, bucket count) pair.
    pub const CURRENT_IDX: i64 = BASE + 4;
    pub const CRNT_BKT_CNT: i64 = BASE + 5;
    /// Source bucket array during an incremental rehash.
    pub const PREV_IDX: i64 = BASE + 6;
    pub const PREV_BKT_CNT: i64 = BASE + 7;
    /// Per-instance hash seed.
    pub const SEED: i64 = BASE + 8;
    /// Byte cap that refuses growth when reached (0 = none).
    pub const MAX_SIZE: i64 = BASE + 9;
    /// Rotating eviction cursor; reserved, see the crate notes on the
    /// unimplemented eviction hook.
    pub const EVICT_BKT: i64 = BASE + 10;
    /// Size-class free-data stacks.
    pub const MEM_BKT_START: i64 = BASE + 12;
    pub const HDR_END: i64 = MEM_BKT_START + crate::arena::MEM_BKT_SLOTS;
}

// Bucket geometry.
const BUCKET_COUNT: i64 = 15;
const INDEX_ITEM: i64 = 4;
const BUCKET_SIZE: i64 = (BUCKET_COUNT + 1) * INDEX_ITEM;

// Bucket header offsets. Word 0 is the bitmap itself (with the
// insert-block sentinel in its high half).
const BTMP_CNTR: usize = 1;
/// Doubles as the rehash cursor on a superseded index.
const FILTER: usize = 2;
const BKT_ACCESSORS: i64 = 3;

// Index cell offsets.
const HASH: usize = 0;
const ITEM_LENGTH: usize = 1;
const DATA_SLOT: usize = 2;
const DATA_CNTR: usize = 3;

// Data cell offsets.
const TYPE_VEC: usize = 1;
const DATA_LENGTH: usize = 2;
const KEY_LENGTH: usize = 3;
const DATA_HDR: i64 = 4;

// Defer-list node payload offsets.
const SLOT_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 3;

/// Low half of a bucket header word is the live bitmap; the high half is
/// the insert-block sentinel raised during index expansion.
const IDX_MASK: i64 = 0xffff_ffff;
const IDX_BLOCK: i64 = !IDX_MASK;

const SHMP_TAG: &[u8; 4] = b"shmp";

/// A value read out of the map.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Value bytes (packed segments when `vcount > 1`).
    pub value: Vec<u8>,
    /// Cell generation; passed back to [`SharedMap::update`] as its
    /// optimistic-concurrency token.
    pub token: i64,
    /// Declared type of the value.
    pub kind: ValueKind,
    /// Number of typed segments in the value.
    pub vcount: u32,
}

impl Entry {
    /// Decompose the value into its typed segments.
    pub fn segments(&self) -> Result<Vec<Segment>, Error> {
        if self.vcount > 1 {
            value::unpack(&self.value, self.vcount)
        } else {
            Ok(vec![Segment::new(self.kind, self.value.clone())])
        }
    }
}

/// Shape of a value, without its data.
#[derive(Debug, Clone)]
pub struct EntryAttr {
    /// Declared type.
    pub kind: ValueKind,
    /// Value length in bytes.
    pub vlength: usize,
    /// Segment count.
    pub vcount: u32,
    /// Per-segment `(kind, byte length)` when the value is a vector.
    pub segments: Vec<(ValueKind, usize)>,
}

/// Outcome of one bucket scan.
enum Scan {
    /// Key present in cell `index` with this token.
    Hit { index: i64, token: i64 },
    /// Key absent; `empty` is the lowest free cell, 0 when the bucket is
    /// full.
    Miss { empty: i64 },
}

/// Handle on a shared map instance.
#[derive(Debug)]
pub struct SharedMap {
    arena: Arena,
    seed: u32,
}

/// RAII accessor guard: pins the arena and drains deferred memory on the
/// way in and out.
struct MapGuard<'a>(&'a SharedMap);

impl Drop for MapGuard<'_> {
    fn drop(&mut self) {
        self.0.clean_defer_list();
        self.0.arena.unguard();
    }
}

/// RAII pin on one bucket, blocking immediate release of its cells.
struct BucketGuard {
    p: *mut i64,
}

impl BucketGuard {
    fn new(arena: &Arena, bucket: i64) -> Result<BucketGuard, Error> {
        let p = arena.span(bucket + BKT_ACCESSORS, 1)?;
        pr::faa(p, 1);
        Ok(BucketGuard { p })
    }

    /// Move the pin to another bucket after a rehash relocated us.
    fn retarget(&mut self, arena: &Arena, bucket: i64) -> Result<(), Error> {
        let np = arena.span(bucket + BKT_ACCESSORS, 1)?;
        pr::faa(np, 1);
        pr::fas_sub(self.p, 1);
        self.p = np;
        Ok(())
    }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        pr::fas_sub(self.p, 1);
    }
}

impl SharedMap {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a map named `name`. A non-zero `max_size` caps the backing
    /// object at that many bytes (page multiple); at the cap, inserts that
    /// would need more room fail with [`Error::NoMem`].
    pub fn create(name: &str, max_size: usize) -> Result<SharedMap, Error> {
        if max_size != 0 && max_size % shm::PAGE_BYTES != 0 {
            return Err(Error::Arg);
        }

        let region = Region::create(name)?;
        let arena = Arena::new(region, mh::HDR_END, mh::MEM_BKT_START, 0);
        arena.format(SHMP_TAG)?;
        arena.prime_list(mh::DEFER_HEAD, mh::DEFER_HD_CNT, mh::DEFER_TAIL, mh::DEFER_TL_CNT)?;

        // Initial index: a single zeroed bucket.
        let index = arena.alloc_new_data(BUCKET_SIZE)?;
        pr::store(arena.span(index, 1)?, 0);
        arena.hwrite(mh::CURRENT_IDX, index);
        arena.hwrite(mh::CRNT_BKT_CNT, 1);
        arena.hwrite(mh::PREV_IDX, index);
        arena.hwrite(mh::PREV_BKT_CNT, 1);
        arena.hwrite(mh::MAX_SIZE, max_size as i64);
        arena.hwrite(mh::EVICT_BKT, 0);

        let seed: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        arena.hwrite(mh::SEED, i64::from(seed));

        debug!("created map {name} (cap {max_size} bytes)");
        Ok(SharedMap { arena, seed })
    }

    /// Open an existing map.
    pub fn open(name: &str) -> Result<SharedMap, Error> {
        let region = Region::open(name)?;
        let arena = Arena::new(region, mh::HDR_END, mh::MEM_BKT_START, 0);
        arena.check_magic(SHMP_TAG)?;
        let seed = arena.hread(mh::SEED) as u32;
        Ok(SharedMap { arena, seed })
    }

    /// Unlink the map from the shared-memory namespace.
    pub fn destroy(self) -> Result<(), Error> {
        self.arena.region().unlink()
    }

    /// True when `name` refers to a healthy map object.
    pub fn is_valid(name: &str) -> bool {
        shm::peek_magic(name, SHMP_TAG, arena::LAYOUT_VERSION)
    }

    fn guard(&self) -> MapGuard<'_> {
        self.arena.guard();
        self.clean_defer_list();
        MapGuard(self)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Insert `key`, failing with [`Error::Conflict`] when it is present.
    /// Returns the new cell's token.
    pub fn add(&self, key: &[u8], val: &[u8]) -> Result<i64, Error> {
        check_kv(key, val)?;
        let _g = self.guard();
        let (pair, size) = self.copy_kv_pair(key, val, ValueKind::Object, 1)?;
        self.install_unique(key, pair, size)
    }

    /// Insert a vector of typed segments under `key`.
    pub fn add_vector(&self, key: &[u8], segments: &[Segment], repr: ValueKind) -> Result<i64, Error> {
        let packed = check_segments(key, segments)?;
        let _g = self.guard();
        let (pair, size) = match packed {
            Some(bytes) => self.copy_kv_pair(key, &bytes, repr, segments.len() as u32)?,
            None => self.copy_kv_pair(key, &segments[0].bytes, segments[0].kind, 1)?,
        };
        self.install_unique(key, pair, size)
    }

    /// Upsert: insert when absent, replace when present. Returns the
    /// replaced entry, if any.
    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<Option<Entry>, Error> {
        check_kv(key, val)?;
        let _g = self.guard();
        let (pair, size) = self.copy_kv_pair(key, val, ValueKind::Object, 1)?;
        match self.install_upsert(key, pair, size) {
            Ok(prior) => Ok(prior),
            Err(e) => {
                let _ = self.arena.free_data(pair);
                Err(e)
            }
        }
    }

    /// Upsert a vector of typed segments.
    pub fn put_vector(
        &self,
        key: &[u8],
        segments: &[Segment],
        repr: ValueKind,
    ) -> Result<Option<Entry>, Error> {
        let packed = check_segments(key, segments)?;
        let _g = self.guard();
        let (pair, size) = match packed {
            Some(bytes) => self.copy_kv_pair(key, &bytes, repr, segments.len() as u32)?,
            None => self.copy_kv_pair(key, &segments[0].bytes, segments[0].kind, 1)?,
        };
        match self.install_upsert(key, pair, size) {
            Ok(prior) => Ok(prior),
            Err(e) => {
                let _ = self.arena.free_data(pair);
                Err(e)
            }
        }
    }

    /// Replace the value only while `token` (from a previous get/add) is
    /// still current; a stale token reports [`Error::Conflict`]. Returns the
    /// prior entry, re-stamped with the new token.
    pub fn update(&self, key: &[u8], val: &[u8], token: i64) -> Result<Entry, Error> {
        check_kv(key, val)?;
        let _g = self.guard();
        let (pair, size) = self.copy_kv_pair(key, val, ValueKind::Object, 1)?;
        match self.install_update(key, pair, size, token) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let _ = self.arena.free_data(pair);
                Err(e)
            }
        }
    }

    /// Token-checked replacement with a vector of typed segments.
    pub fn update_vector(
        &self,
        key: &[u8],
        segments: &[Segment],
        repr: ValueKind,
        token: i64,
    ) -> Result<Entry, Error> {
        let packed = check_segments(key, segments)?;
        let _g = self.guard();
        let (pair, size) = match packed {
            Some(bytes) => self.copy_kv_pair(key, &bytes, repr, segments.len() as u32)?,
            None => self.copy_kv_pair(key, &segments[0].bytes, segments[0].kind, 1)?,
        };
        match self.install_update(key, pair, size, token) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let _ = self.arena.free_data(pair);
                Err(e)
            }
        }
    }

    /// Look up `key` and copy its value out.
    pub fn get(&self, key: &[u8]) -> Result<Entry, Error> {
        if key.is_empty() {
            return Err(Error::Arg);
        }
        let _g = self.guard();
        self.find(key, |a, cell| copy_entry(a, cell))
    }

    /// Read `length` bytes of segment `index` starting at `offset`, without
    /// copying the rest of the value.
    pub fn get_partial(
        &self,
        key: &[u8],
        index: u32,
        offset: usize,
        length: usize,
    ) -> Result<Entry, Error> {
        if key.is_empty() {
            return Err(Error::Arg);
        }
        let _g = self.guard();
        self.find(key, |a, cell| copy_partial(a, cell, index, offset, length))
    }

    /// Read the shape of a value: type, length, and segment layout, with no
    /// data copy.
    pub fn get_attr(&self, key: &[u8]) -> Result<EntryAttr, Error> {
        if key.is_empty() {
            return Err(Error::Arg);
        }
        let _g = self.guard();
        self.find(key, |a, cell| copy_attr(a, cell))
    }

    /// Remove `key`, returning its final entry.
    pub fn remove(&self, key: &[u8]) -> Result<Entry, Error> {
        if key.is_empty() {
            return Err(Error::Arg);
        }
        let _g = self.guard();
        let a = &self.arena;
        let hash = self.cell_hash(key);
        let mut bucket = self.bucket_of(hash)?;
        let mut bg = BucketGuard::new(a, bucket)?;

        loop {
            if self.is_expanded() {
                self.reindex_indices()?;
                let nb = self.bucket_of(hash)?;
                if nb != bucket {
                    bg.retarget(a, nb)?;
                    bucket = nb;
                }
            }

            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            let counter = pr::load(unsafe { p.add(BTMP_CNTR) });
            let scan = self.scan(hash, key, bucket, bitmap)?;
            if counter != pr::load(unsafe { p.add(BTMP_CNTR) }) {
                continue;
            }
            let Scan::Hit { index, token: _ } = scan else {
                return Err(Error::NoMatch);
            };
            let cell = bucket + index * INDEX_ITEM;
            let entry = copy_entry(a, cell)?;

            // Retire bitmap-first, then scrub the cell.
            let before = DWord::new(bitmap & IDX_MASK, counter);
            let after = DWord::new((bitmap & IDX_MASK) & !(1 << index), counter + 1);
            if !pr::dwcas(p, before, after) {
                continue;
            }
            let cp = a.span(cell, INDEX_ITEM)?;
            let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
            pr::store(unsafe { cp.add(DATA_CNTR) }, 0);
            pr::store(unsafe { cp.add(DATA_SLOT) }, 0);
            pr::store(unsafe { cp.add(HASH) }, 0);
            pr::store(unsafe { cp.add(ITEM_LENGTH) }, 0);

            if a.valid_ref(pair) {
                self.release(bucket, pair)?;
            }
            self.arena.hfaa(hdr::COUNT, -1);
            return Ok(entry);
        }
    }

    /// Current entry count.
    pub fn count(&self) -> i64 {
        let _g = self.guard();
        self.arena.hread(hdr::COUNT)
    }

    /// Largest value yet observed, in bytes; a sizing hint for readers.
    pub fn buffer_size(&self) -> i64 {
        let _g = self.guard();
        self.arena.buffer_hint()
    }

    // ------------------------------------------------------------------
    // Hashing and bucket addressing
    // ------------------------------------------------------------------

    /// The 64-bit half of the digest that selects buckets; it is also what
    /// the cell stores, so a rehash can rebucket without the key bytes.
    /// Never zero.
    fn cell_hash(&self, key: &[u8]) -> i64 {
        let (_, h2) = murmur3_x64_128(key, self.seed);
        if h2 == 0 {
            !0
        } else {
            h2 as i64
        }
    }

    fn bucket_of(&self, hash: i64) -> Result<i64, Error> {
        let idx = self.arena.hpair(mh::CURRENT_IDX);
        let slot = (hash as u64 & (idx.high as u64 - 1)) as i64 * BUCKET_SIZE + idx.low;
        self.arena.span(slot, BUCKET_SIZE)?;
        Ok(slot)
    }

    fn is_expanded(&self) -> bool {
        self.arena.hread(mh::CURRENT_IDX) != self.arena.hread(mh::PREV_IDX)
    }

    fn at_size_limit(&self) -> bool {
        let cap = self.arena.hread(mh::MAX_SIZE);
        cap != 0 && self.arena.hread(hdr::SIZE) * pr::SLOT_BYTES as i64 >= cap
    }

    // ------------------------------------------------------------------
    // Cell and pair plumbing
    // ------------------------------------------------------------------

    /// Allocate and fill a k/v data cell. Returns `(slot, allocated size)`.
    fn copy_kv_pair(
        &self,
        key: &[u8],
        val: &[u8],
        kind: ValueKind,
        vcount: u32,
    ) -> Result<(i64, i64), Error> {
        let a = &self.arena;
        let kslots = byte_slots(key.len());
        let vslots = byte_slots(val.len());
        let space = DATA_HDR + kslots + vslots;
        a.update_buffer_size(vslots, 0);

        let pair = a.alloc_data(space)?;
        let p = a.span(pair, space)?;
        let size = pr::load(p);
        unsafe {
            pr::store_relaxed(
                p.add(TYPE_VEC),
                ((kind as i64) << 32) | i64::from(vcount),
            );
            pr::store_relaxed(p.add(DATA_LENGTH), val.len() as i64);
            pr::store_relaxed(p.add(KEY_LENGTH), key.len() as i64);
            arena::copy_in(p.add(DATA_HDR as usize), key);
            arena::copy_in(p.add((DATA_HDR + kslots) as usize), val);
        }
        Ok((pair, size))
    }

    /// Release a retired pair: immediately when this bucket has no other
    /// accessor, else onto the deferred list.
    fn release(&self, bucket: i64, pair: i64) -> Result<(), Error> {
        let a = &self.arena;
        let acc = a.span(bucket + BKT_ACCESSORS, 1)?;
        if pr::load(acc) > 1 {
            self.release_pair(pair)
        } else {
            a.free_data(pair)
        }
    }

    /// Push a pair onto the deferred release list.
    fn release_pair(&self, pair: i64) -> Result<(), Error> {
        let a = &self.arena;
        let node = a.alloc_node()?;
        let p = a.span(node, NODE_SLOTS)?;
        let size = pr::load(a.span(pair, 1)?);
        unsafe {
            pr::store_relaxed(p.add(SLOT_OFFSET), pair);
            pr::store_relaxed(p.add(SIZE_OFFSET), size);
        }
        list::add_end(a, node, mh::DEFER_TAIL)
    }

    /// Pop one deferred block; `(0, 0)` when none could be taken.
    fn defer_remove(&self) -> Result<(i64, i64), Error> {
        let a = &self.arena;
        let gen = a.hread(mh::DEFER_HD_CNT);
        let head = a.hread(mh::DEFER_HEAD);
        if head == a.hread(mh::DEFER_TAIL) {
            return Ok((0, 0));
        }
        if !a.valid_ref(head) {
            return Ok((0, 0));
        }
        let next = pr::load(a.span(head, 1)?);
        if !a.valid_ref(next) {
            return Ok((0, 0));
        }
        let np = a.span(next, NODE_SLOTS)?;
        let slot = pr::load(unsafe { np.add(SLOT_OFFSET) });
        let size = pr::load(unsafe { np.add(SIZE_OFFSET) });
        if slot == 0 {
            return Ok((0, 0));
        }
        if list::remove_front(a, head, gen, mh::DEFER_HEAD, mh::DEFER_TAIL)? == 0 {
            return Ok((0, 0));
        }
        a.free_node(head)?;
        Ok((slot, size))
    }

    /// Drain the deferred list while the instance is quiescent (I8).
    fn clean_defer_list(&self) {
        let a = &self.arena;
        while a.hread(mh::DEFER_HEAD) != a.hread(mh::DEFER_TAIL) {
            if a.shared_accessors() > 1 {
                return;
            }
            let Ok((slot, size)) = self.defer_remove() else {
                return;
            };
            if slot == 0 {
                continue;
            }
            if a.valid_ref(slot) && size > 0 {
                // Restore the size word the block must carry into the pool.
                if let Ok(p) = a.span(slot, 1) {
                    pr::store(p, size);
                    let _ = a.free_data(slot);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Bucket scan
    // ------------------------------------------------------------------

    /// Scan a bucket for `key`. Restarts internally whenever a cell's
    /// version moves underneath it.
    fn scan(&self, hash: i64, key: &[u8], bucket: i64, bitmap: i64) -> Result<Scan, Error> {
        let a = &self.arena;
        'scan: loop {
            let mut empty = 0i64;
            for i in 1..=BUCKET_COUNT {
                let mask = 1i64 << i;
                let cell = bucket + i * INDEX_ITEM;
                let cp = a.span(cell, INDEX_ITEM)?;

                if bitmap & mask == 0 {
                    if empty == 0 && cell_is_clear(cp) {
                        empty = i;
                    }
                    continue;
                }

                let token = pr::load(unsafe { cp.add(DATA_CNTR) });
                if token == 0 {
                    // Cell mid-update; start the bucket over.
                    continue 'scan;
                }
                if pr::load(unsafe { cp.add(HASH) }) != hash {
                    continue;
                }
                let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
                if !a.valid_ref(pair) {
                    continue 'scan;
                }
                let pp = a.span(pair, DATA_HDR)?;
                let total = pr::load(pp);
                if total == 0 {
                    continue 'scan;
                }
                let pp = a.span(pair, total)?;
                if pr::load(unsafe { pp.add(KEY_LENGTH) }) != key.len() as i64 {
                    continue;
                }
                let stored =
                    unsafe { core::slice::from_raw_parts(pp.add(DATA_HDR as usize).cast::<u8>(), key.len()) };
                if stored != key {
                    continue;
                }
                if token != pr::load(unsafe { cp.add(DATA_CNTR) }) {
                    continue 'scan;
                }
                return Ok(Scan::Hit { index: i, token });
            }
            return Ok(Scan::Miss { empty });
        }
    }

    /// Shared lookup driver: scan under a stable bitmap generation, then
    /// hand the hit cell to `read`.
    fn find<T>(
        &self,
        key: &[u8],
        read: impl Fn(&Arena, i64) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let a = &self.arena;
        let hash = self.cell_hash(key);
        let mut bucket = self.bucket_of(hash)?;
        let mut bg = BucketGuard::new(a, bucket)?;

        loop {
            if self.is_expanded() {
                // Drain the one source bucket this key depends on, then look
                // in the active index.
                let prev = a.hpair(mh::PREV_IDX);
                if prev.high > 0 {
                    let src = (hash as u64 & (prev.high as u64 - 1)) as i64 * BUCKET_SIZE + prev.low;
                    a.span(src, BUCKET_SIZE)?;
                    self.reindex_bucket(src)?;
                }
                let nb = self.bucket_of(hash)?;
                if nb != bucket {
                    bg.retarget(a, nb)?;
                    bucket = nb;
                }
            }

            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            let counter = pr::load(unsafe { p.add(BTMP_CNTR) });
            let scan = self.scan(hash, key, bucket, bitmap)?;
            if counter != pr::load(unsafe { p.add(BTMP_CNTR) }) {
                continue;
            }
            return match scan {
                Scan::Hit { index, .. } => read(a, bucket + index * INDEX_ITEM),
                Scan::Miss { .. } => Err(Error::NoMatch),
            };
        }
    }

    // ------------------------------------------------------------------
    // Install paths
    // ------------------------------------------------------------------

    /// Insert-if-absent. Frees the prepared pair on any failure.
    fn install_unique(&self, key: &[u8], pair: i64, size: i64) -> Result<i64, Error> {
        match self.hash_add(key, pair, size) {
            Ok(token) => {
                self.arena.hfaa(hdr::COUNT, 1);
                Ok(token)
            }
            Err(e) => {
                let _ = self.arena.free_data(pair);
                Err(e)
            }
        }
    }

    fn hash_add(&self, key: &[u8], pair: i64, size: i64) -> Result<i64, Error> {
        let a = &self.arena;
        let hash = self.cell_hash(key);
        let mut bucket = self.bucket_of(hash)?;
        let mut bg = BucketGuard::new(a, bucket)?;

        loop {
            if self.is_expanded() {
                self.reindex_indices()?;
                let nb = self.bucket_of(hash)?;
                if nb != bucket {
                    bg.retarget(a, nb)?;
                    bucket = nb;
                }
            }

            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            let counter = pr::load(unsafe { p.add(BTMP_CNTR) });
            match self.scan(hash, key, bucket, bitmap)? {
                Scan::Hit { .. } => return Err(Error::Conflict),
                Scan::Miss { empty } => {
                    if empty == 0 {
                        self.expand_hash_index()?;
                        continue;
                    }
                    if let Some(token) =
                        self.add_to_bucket(hash, pair, size, bucket, empty, bitmap, counter)?
                    {
                        return Ok(token);
                    }
                }
            }
        }
    }

    /// Upsert. Consumes the prepared pair either way.
    fn install_upsert(&self, key: &[u8], pair: i64, size: i64) -> Result<Option<Entry>, Error> {
        let a = &self.arena;
        let hash = self.cell_hash(key);
        let mut bucket = self.bucket_of(hash)?;
        let mut bg = BucketGuard::new(a, bucket)?;

        loop {
            if self.is_expanded() {
                self.reindex_indices()?;
                let nb = self.bucket_of(hash)?;
                if nb != bucket {
                    bg.retarget(a, nb)?;
                    bucket = nb;
                }
            }

            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            let counter = pr::load(unsafe { p.add(BTMP_CNTR) });
            match self.scan(hash, key, bucket, bitmap)? {
                Scan::Hit { index, token } => {
                    match self.swap_cell(bucket, index, token, pair, size)? {
                        Some(old) => return Ok(Some(old)),
                        None => continue,
                    }
                }
                Scan::Miss { empty } => {
                    if empty == 0 {
                        self.expand_hash_index()?;
                        continue;
                    }
                    if self
                        .add_to_bucket(hash, pair, size, bucket, empty, bitmap, counter)?
                        .is_some()
                    {
                        self.arena.hfaa(hdr::COUNT, 1);
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Token-checked update. The caller frees the pair on error.
    fn install_update(&self, key: &[u8], pair: i64, size: i64, token: i64) -> Result<Entry, Error> {
        let a = &self.arena;
        let hash = self.cell_hash(key);
        let mut bucket = self.bucket_of(hash)?;
        let mut bg = BucketGuard::new(a, bucket)?;

        loop {
            if self.is_expanded() {
                self.reindex_indices()?;
                let nb = self.bucket_of(hash)?;
                if nb != bucket {
                    bg.retarget(a, nb)?;
                    bucket = nb;
                }
            }

            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            match self.scan(hash, key, bucket, bitmap)? {
                Scan::Hit { index, token: current } => {
                    if current != token {
                        return Err(Error::Conflict);
                    }
                    return match self.swap_cell(bucket, index, token, pair, size)? {
                        Some(old) => Ok(old),
                        // The cell moved between scan and swap: the caller's
                        // token is stale by definition.
                        None => Err(Error::Conflict),
                    };
                }
                Scan::Miss { .. } => return Err(Error::NoMatch),
            }
        }
    }

    /// DWCAS a hit cell from `(old pair, token)` to `(new pair, fresh)`.
    /// Returns the prior entry re-stamped with the new token, or `None`
    /// when the compare failed.
    fn swap_cell(
        &self,
        bucket: i64,
        index: i64,
        token: i64,
        pair: i64,
        size: i64,
    ) -> Result<Option<Entry>, Error> {
        let a = &self.arena;
        let cell = bucket + index * INDEX_ITEM;
        let cp = a.span(cell, INDEX_ITEM)?;
        let old_pair = pr::load(unsafe { cp.add(DATA_SLOT) });
        if old_pair == 0 {
            return Ok(None);
        }
        // Copy the prior value first; a failed compare below discards it.
        let mut old = read_pair(a, old_pair, token)?;
        let fresh = a.id_gen();
        if !pr::dwcas(
            unsafe { cp.add(DATA_SLOT) },
            DWord::new(old_pair, token),
            DWord::new(pair, fresh),
        ) {
            return Ok(None);
        }
        pr::store(unsafe { cp.add(ITEM_LENGTH) }, size);
        old.token = fresh;
        self.release(bucket, old_pair)?;
        Ok(Some(old))
    }

    /// Publish a pair into cell `empty`: cell words first, bitmap last.
    /// `None` means a racing writer took the cell or moved the bitmap.
    #[allow(clippy::too_many_arguments)]
    fn add_to_bucket(
        &self,
        hash: i64,
        pair: i64,
        size: i64,
        bucket: i64,
        empty: i64,
        bitmap: i64,
        counter: i64,
    ) -> Result<Option<i64>, Error> {
        let a = &self.arena;
        let cell = bucket + empty * INDEX_ITEM;
        let cp = a.span(cell, INDEX_ITEM)?;

        let token = a.id_gen();
        if !pr::dwcas(
            unsafe { cp.add(DATA_SLOT) },
            DWord::new(0, 0),
            DWord::new(pair, token),
        ) {
            return Ok(None);
        }
        pr::store(unsafe { cp.add(HASH) }, hash);
        pr::store(unsafe { cp.add(ITEM_LENGTH) }, size);

        let p = a.span(bucket, BUCKET_SIZE)?;
        let before = DWord::new(bitmap & IDX_MASK, counter);
        let after = DWord::new((bitmap & IDX_MASK) | (1 << empty), counter + 1);
        if !pr::dwcas(p, before, after) {
            // Undo the cell so the bit stays honest (I6).
            pr::store(unsafe { cp.add(HASH) }, 0);
            pr::store(unsafe { cp.add(ITEM_LENGTH) }, 0);
            pr::store(unsafe { cp.add(DATA_SLOT) }, 0);
            pr::store(unsafe { cp.add(DATA_CNTR) }, 0);
            return Ok(None);
        }

        // Fold the pair size into the bucket's coarse size filter.
        let fp = unsafe { p.add(FILTER) };
        let mut filter = pr::load(fp);
        while filter & size != size && !pr::cas(fp, filter, filter | size) {
            filter = pr::load(fp);
        }
        Ok(Some(token))
    }

    // ------------------------------------------------------------------
    // Index expansion and incremental rehash
    // ------------------------------------------------------------------

    /// Double the bucket array. Refuses with [`Error::NoMem`] at the size
    /// cap rather than looping (the eviction hook is intentionally absent).
    fn expand_hash_index(&self) -> Result<(), Error> {
        if self.is_expanded() {
            return Ok(());
        }
        if self.at_size_limit() {
            return Err(Error::NoMem);
        }
        self.allocate_new_index()?;
        self.reindex_indices()?;
        self.release_prev_index()
    }

    fn allocate_new_index(&self) -> Result<(), Error> {
        let a = &self.arena;
        let observed = a.hpair(mh::CURRENT_IDX);
        if observed.low != a.hread(mh::PREV_IDX) {
            return Ok(());
        }

        // Block further inserts into the old index's first bucket; racing
        // adds fail their bitmap compare and re-enter through the rehash.
        let hp = a.span(observed.low, 1)?;
        let word = pr::load(hp);
        if word & IDX_BLOCK == 0 {
            pr::cas(hp, word, word | IDX_BLOCK);
        }

        let new_cnt = observed.high * 2;
        // Index arrays always come from the bump allocator: the block is
        // fresh zeroed memory and its size is exactly count * BUCKET_SIZE,
        // which the release path recomputes.
        let block = a.alloc_new_data(new_cnt * BUCKET_SIZE)?;
        pr::store(a.span(block, 1)?, 0);

        if a.hdwcas(mh::CURRENT_IDX, observed, DWord::new(block, new_cnt)) {
            // Fresh cursor for the claim race over the old index.
            let fp = unsafe { a.span(observed.low, INDEX_ITEM)?.add(FILTER) };
            pr::store(fp, 0);
            debug!("hash index doubled to {new_cnt} buckets");
        } else {
            // Lost the install race; recycle the block.
            let p = a.span(block, 1)?;
            pr::store(p, new_cnt * BUCKET_SIZE);
            a.free_data(block)?;
        }
        Ok(())
    }

    /// Drain every source bucket of the previous index, racing other
    /// threads for claims and then helping finish stragglers.
    fn reindex_indices(&self) -> Result<(), Error> {
        let a = &self.arena;
        let prev = a.hpair(mh::PREV_IDX);
        if prev.low == a.hread(mh::CURRENT_IDX) {
            return Ok(());
        }
        let buckets = prev.high;

        // Claim pass: the cursor hands each bucket to exactly one thread.
        loop {
            let cp = unsafe { a.span(prev.low, INDEX_ITEM)?.add(FILTER) };
            let i = pr::load(cp);
            if i >= buckets {
                break;
            }
            if !pr::cas(cp, i, i + 1) {
                continue;
            }
            let bucket = prev.low + i * BUCKET_SIZE;
            a.span(bucket, BUCKET_SIZE)?;
            self.reindex_bucket(bucket)?;
        }

        // Help pass: finish any bucket a claimed thread has not drained.
        for i in 0..buckets {
            let bucket = prev.low + i * BUCKET_SIZE;
            let p = a.span(bucket, BUCKET_SIZE)?;
            if pr::load(p) == 1 {
                continue;
            }
            self.reindex_bucket(bucket)?;
        }
        Ok(())
    }

    /// Move every entry of one source bucket into the active index.
    fn reindex_bucket(&self, bucket: i64) -> Result<(), Error> {
        let a = &self.arena;

        // First pass: claim each live bit by clearing it so newcomers
        // cannot see stale bits, then reinsert its cell.
        for i in 1..=BUCKET_COUNT {
            let mask = 1i64 << i;
            let p = a.span(bucket, BUCKET_SIZE)?;
            let word = pr::load(p);
            if word & mask == 0 {
                continue;
            }
            let cnt = pr::load(unsafe { p.add(BTMP_CNTR) });
            if !pr::dwcas(p, DWord::new(word, cnt), DWord::new(word & !mask, cnt + 1)) {
                continue;
            }
            self.reindex_pair(bucket + i * INDEX_ITEM)?;
        }

        // Second pass: sweep cells a blocked thread left half-moved.
        for i in 1..=BUCKET_COUNT {
            let cell = bucket + i * INDEX_ITEM;
            let cp = a.span(cell, INDEX_ITEM)?;
            if pr::load(unsafe { cp.add(DATA_SLOT) }) == 0 {
                continue;
            }
            self.reindex_pair(cell)?;
        }

        // Mark the bucket fully drained.
        let p = a.span(bucket, BUCKET_SIZE)?;
        let cnt = pr::load(unsafe { p.add(BTMP_CNTR) });
        if cnt == 1 {
            return Ok(());
        }
        let word = pr::load(p);
        if word & IDX_MASK == 0 {
            pr::dwcas(p, DWord::new(word, cnt), DWord::new(1, cnt + 1));
        }
        Ok(())
    }

    /// Reinsert one claimed cell into the active index, then scrub it.
    fn reindex_pair(&self, cell: i64) -> Result<(), Error> {
        let a = &self.arena;
        let cp = a.span(cell, INDEX_ITEM)?;
        let hash = pr::load(unsafe { cp.add(HASH) });
        let length = pr::load(unsafe { cp.add(ITEM_LENGTH) });
        let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
        let counter = pr::load(unsafe { cp.add(DATA_CNTR) });
        if hash == 0 || length == 0 || pair == 0 || counter == 0 {
            return Ok(());
        }

        let mut backoff = Backoff::new();
        loop {
            let bucket = self.bucket_of(hash)?;
            let p = a.span(bucket, BUCKET_SIZE)?;
            let bitmap = pr::load(p);
            let cnt = pr::load(unsafe { p.add(BTMP_CNTR) });

            match scan_for_slot(a, pair, bucket, bitmap)? {
                // Another helper already moved this cell.
                None => break,
                Some(0) => {
                    // Target bucket momentarily full; a concurrent writer
                    // holds cells it must publish or surrender.
                    backoff.spin();
                    continue;
                }
                Some(empty) => {
                    if self
                        .add_to_bucket(hash, pair, length, bucket, empty, bitmap, cnt)?
                        .is_some()
                    {
                        break;
                    }
                }
            }
        }

        pr::store(unsafe { cp.add(DATA_SLOT) }, 0);
        pr::store(unsafe { cp.add(DATA_CNTR) }, 0);
        pr::store(unsafe { cp.add(HASH) }, 0);
        pr::store(unsafe { cp.add(ITEM_LENGTH) }, 0);
        Ok(())
    }

    /// Retire the drained source index onto the deferred list and advance
    /// `PREV_IDX` to match the active index.
    fn release_prev_index(&self) -> Result<(), Error> {
        let a = &self.arena;
        let prev = a.hpair(mh::PREV_IDX);
        let current = a.hpair(mh::CURRENT_IDX);
        if prev.low == current.low {
            return Ok(());
        }
        if !a.hdwcas(mh::PREV_IDX, prev, current) {
            return Ok(());
        }

        let node = a.alloc_node()?;
        let p = a.span(node, NODE_SLOTS)?;
        unsafe {
            pr::store_relaxed(p.add(SLOT_OFFSET), prev.low);
            pr::store_relaxed(p.add(SIZE_OFFSET), prev.high * BUCKET_SIZE);
        }
        list::add_end(a, node, mh::DEFER_TAIL)
    }
}

// The arena owns the raw pointers; all shared access is atomic.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

fn check_kv(key: &[u8], val: &[u8]) -> Result<(), Error> {
    if key.is_empty() || val.is_empty() {
        return Err(Error::Arg);
    }
    Ok(())
}

/// Validate vector arguments; `Some(packed)` when the segments need the
/// packed wire form.
fn check_segments(key: &[u8], segments: &[Segment]) -> Result<Option<Vec<u8>>, Error> {
    if key.is_empty() || segments.is_empty() || segments.iter().any(|s| s.bytes.is_empty()) {
        return Err(Error::Arg);
    }
    if segments.len() == 1 {
        return Ok(None);
    }
    Ok(Some(value::pack(segments)))
}

fn cell_is_clear(cp: *mut i64) -> bool {
    pr::load(cp) == 0
        && pr::load(unsafe { cp.add(ITEM_LENGTH) }) == 0
        && pr::load(unsafe { cp.add(DATA_SLOT) }) == 0
        && pr::load(unsafe { cp.add(DATA_CNTR) }) == 0
}

/// Scan used by rehash: `None` when `pair` is already indexed here,
/// otherwise the lowest free cell (0 = full).
fn scan_for_slot(a: &Arena, pair: i64, bucket: i64, bitmap: i64) -> Result<Option<i64>, Error> {
    let mut empty = 0i64;
    for i in 1..=BUCKET_COUNT {
        let mask = 1i64 << i;
        let cell = bucket + i * INDEX_ITEM;
        let cp = a.span(cell, INDEX_ITEM)?;
        if bitmap & mask == 0 {
            if empty == 0 && pr::load(unsafe { cp.add(DATA_SLOT) }) == 0 {
                empty = i;
            }
            continue;
        }
        if pr::load(unsafe { cp.add(DATA_SLOT) }) == pair {
            return Ok(None);
        }
    }
    Ok(Some(empty))
}

/// Materialize the entry a cell references.
fn copy_entry(a: &Arena, cell: i64) -> Result<Entry, Error> {
    let cp = a.span(cell, INDEX_ITEM)?;
    let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
    let token = pr::load(unsafe { cp.add(DATA_CNTR) });
    read_pair(a, pair, token)
}

/// Copy a k/v pair's value out of the arena.
fn read_pair(a: &Arena, pair: i64, token: i64) -> Result<Entry, Error> {
    if !a.valid_ref(pair) {
        return Err(Error::NoMatch);
    }
    let p = a.span(pair, DATA_HDR)?;
    let total = pr::load(p);
    if total < DATA_HDR {
        return Err(Error::State);
    }
    let p = a.span(pair, total)?;
    let type_vec = pr::load(unsafe { p.add(TYPE_VEC) });
    let vlen = pr::load(unsafe { p.add(DATA_LENGTH) }) as usize;
    let klen = pr::load(unsafe { p.add(KEY_LENGTH) }) as usize;
    let kslots = byte_slots(klen);

    let mut buf = Vec::new();
    unsafe { arena::copy_out(p.add((DATA_HDR + kslots) as usize), vlen, &mut buf) };
    Ok(Entry {
        value: buf,
        token,
        kind: ValueKind::from_code(type_vec >> 32)?,
        vcount: (type_vec & 0xffff_ffff) as u32,
    })
}

/// Copy one byte range of one segment.
fn copy_partial(
    a: &Arena,
    cell: i64,
    index: u32,
    offset: usize,
    length: usize,
) -> Result<Entry, Error> {
    let cp = a.span(cell, INDEX_ITEM)?;
    let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
    let token = pr::load(unsafe { cp.add(DATA_CNTR) });
    if !a.valid_ref(pair) {
        return Err(Error::NoMatch);
    }
    let p = a.span(pair, DATA_HDR)?;
    let total = pr::load(p);
    if total < DATA_HDR {
        return Err(Error::State);
    }
    let p = a.span(pair, total)?;
    let type_vec = pr::load(unsafe { p.add(TYPE_VEC) });
    let vcount = (type_vec & 0xffff_ffff) as u32;
    let vlen = pr::load(unsafe { p.add(DATA_LENGTH) }) as usize;
    let klen = pr::load(unsafe { p.add(KEY_LENGTH) }) as usize;
    let kslots = byte_slots(klen);
    if index >= vcount.max(1) {
        return Err(Error::Arg);
    }

    let value_base = unsafe { p.add((DATA_HDR + kslots) as usize).cast::<u8>() };
    let (kind, seg_base, seg_len) = if vcount <= 1 {
        (ValueKind::from_code(type_vec >> 32)?, value_base, vlen)
    } else {
        // Walk the packed segments to the requested one.
        let mut at = 0usize;
        let mut found = None;
        for n in 0..vcount {
            let head = unsafe { seg_word(value_base, at) };
            let len = unsafe { seg_word(value_base, at + 8) } as usize;
            at += 16;
            if n == index {
                found = Some((ValueKind::from_code(head)?, at, len));
                break;
            }
            at += byte_slots(len) as usize * pr::SLOT_BYTES;
        }
        let (kind, data_at, len) = found.ok_or(Error::Arg)?;
        (kind, unsafe { value_base.add(data_at) }, len)
    };

    if offset >= seg_len {
        return Err(Error::Arg);
    }
    let take = length.min(seg_len - offset);
    let mut buf = Vec::with_capacity(take);
    unsafe {
        core::ptr::copy_nonoverlapping(seg_base.add(offset), buf.as_mut_ptr(), take);
        buf.set_len(take);
    }
    Ok(Entry {
        value: buf,
        token,
        kind,
        vcount: 1,
    })
}

unsafe fn seg_word(base: *const u8, at: usize) -> i64 {
    let mut w = [0u8; 8];
    core::ptr::copy_nonoverlapping(base.add(at), w.as_mut_ptr(), 8);
    i64::from_le_bytes(w)
}

/// Read shape only.
fn copy_attr(a: &Arena, cell: i64) -> Result<EntryAttr, Error> {
    let cp = a.span(cell, INDEX_ITEM)?;
    let pair = pr::load(unsafe { cp.add(DATA_SLOT) });
    if !a.valid_ref(pair) {
        return Err(Error::NoMatch);
    }
    let p = a.span(pair, DATA_HDR)?;
    let total = pr::load(p);
    if total < DATA_HDR {
        return Err(Error::State);
    }
    let p = a.span(pair, total)?;
    let type_vec = pr::load(unsafe { p.add(TYPE_VEC) });
    let vcount = (type_vec & 0xffff_ffff) as u32;
    let vlen = pr::load(unsafe { p.add(DATA_LENGTH) }) as usize;
    let klen = pr::load(unsafe { p.add(KEY_LENGTH) }) as usize;
    let kind = ValueKind::from_code(type_vec >> 32)?;

    let mut segments = Vec::new();
    if vcount > 1 {
        let base = unsafe { p.add((DATA_HDR + byte_slots(klen)) as usize).cast::<u8>() };
        let mut at = 0usize;
        for _ in 0..vcount {
            let head = unsafe { seg_word(base, at) };
            let len = unsafe { seg_word(base, at + 8) } as usize;
            at += 16 + byte_slots(len) as usize * pr::SLOT_BYTES;
            segments.push((ValueKind::from_code(head)?, len));
        }
    }
    Ok(EntryAttr {
        kind,
        vlength: vlen,
        vcount,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_name;

    fn fresh(tag: &str) -> (String, SharedMap) {
        let name = unique_name(tag);
        let map = SharedMap::create(&name, 0).unwrap();
        (name, map)
    }

    #[test]
    fn test_add_get_remove_round_trip() {
        let (_, m) = fresh("m-basic");
        m.add(b"alpha", b"one").unwrap();
        m.add(b"beta", b"two").unwrap();
        assert_eq!(m.count(), 2);

        assert_eq!(m.get(b"alpha").unwrap().value, b"one");
        assert_eq!(m.get(b"beta").unwrap().value, b"two");
        assert_eq!(m.get(b"gamma").unwrap_err(), Error::NoMatch);

        let gone = m.remove(b"alpha").unwrap();
        assert_eq!(gone.value, b"one");
        assert_eq!(m.get(b"alpha").unwrap_err(), Error::NoMatch);
        assert_eq!(m.count(), 1);
        m.destroy().unwrap();
    }

    #[test]
    fn test_add_conflict_on_present_key() {
        let (_, m) = fresh("m-dup");
        m.add(b"k", b"v1").unwrap();
        assert_eq!(m.add(b"k", b"v2").unwrap_err(), Error::Conflict);
        assert_eq!(m.get(b"k").unwrap().value, b"v1");
        assert_eq!(m.count(), 1);
        m.destroy().unwrap();
    }

    #[test]
    fn test_arg_validation() {
        let (_, m) = fresh("m-arg");
        assert_eq!(m.add(b"", b"v").unwrap_err(), Error::Arg);
        assert_eq!(m.add(b"k", b"").unwrap_err(), Error::Arg);
        assert_eq!(m.get(b"").unwrap_err(), Error::Arg);
        assert_eq!(m.remove(b"").unwrap_err(), Error::Arg);
        assert_eq!(
            SharedMap::create(&unique_name("m-odd"), 1000).unwrap_err(),
            Error::Arg
        );
        m.destroy().unwrap();
    }

    #[test]
    fn test_put_upsert() {
        let (_, m) = fresh("m-put");
        assert!(m.put(b"k", b"v1").unwrap().is_none());
        assert_eq!(m.count(), 1);
        let old = m.put(b"k", b"v2").unwrap().unwrap();
        assert_eq!(old.value, b"v1");
        assert_eq!(m.count(), 1);
        assert_eq!(m.get(b"k").unwrap().value, b"v2");
        m.destroy().unwrap();
    }

    #[test]
    fn test_update_token_protocol() {
        let (_, m) = fresh("m-upd");
        let t1 = m.add(b"k", b"v1").unwrap();

        // Stale token is refused.
        assert_eq!(m.update(b"k", b"v3", t1 - 1).unwrap_err(), Error::Conflict);
        assert_eq!(m.get(b"k").unwrap().value, b"v1");

        // Current token wins and hands back the prior value.
        let prior = m.update(b"k", b"v3", t1).unwrap();
        assert_eq!(prior.value, b"v1");
        assert_eq!(m.get(b"k").unwrap().value, b"v3");

        // The token returned by get chains into the next update.
        let t2 = m.get(b"k").unwrap().token;
        m.update(b"k", b"v4", t2).unwrap();
        assert_eq!(m.get(b"k").unwrap().value, b"v4");

        assert_eq!(m.update(b"missing", b"v", 1).unwrap_err(), Error::NoMatch);
        m.destroy().unwrap();
    }

    #[test]
    fn test_bucket_overflow_expands_index() {
        let (_, m) = fresh("m-grow");
        // One initial bucket holds 15 cells; the 16th insert forces the
        // index to double and rehash.
        for i in 0..16u32 {
            let key = format!("key-{i}");
            m.add(key.as_bytes(), &i.to_le_bytes()).unwrap();
        }
        assert_eq!(m.count(), 16);
        for i in 0..16u32 {
            let key = format!("key-{i}");
            assert_eq!(m.get(key.as_bytes()).unwrap().value, i.to_le_bytes());
        }
        m.destroy().unwrap();
    }

    #[test]
    fn test_many_keys_many_doublings() {
        let (_, m) = fresh("m-many");
        for i in 0..300u32 {
            let key = format!("k{i}");
            let val = format!("value-{i}");
            m.add(key.as_bytes(), val.as_bytes()).unwrap();
        }
        assert_eq!(m.count(), 300);
        for i in 0..300u32 {
            let key = format!("k{i}");
            let val = format!("value-{i}");
            assert_eq!(m.get(key.as_bytes()).unwrap().value, val.as_bytes());
        }
        // Spot-check removal keeps the rest reachable (P3).
        m.remove(b"k7").unwrap();
        assert_eq!(m.get(b"k7").unwrap_err(), Error::NoMatch);
        assert_eq!(m.get(b"k8").unwrap().value, b"value-8");
        assert_eq!(m.count(), 299);
        m.destroy().unwrap();
    }

    #[test]
    fn test_vector_values() {
        let (_, m) = fresh("m-vec");
        let segs = vec![
            Segment::new(ValueKind::Utf8, "north".as_bytes()),
            Segment::new(ValueKind::Integer, 7i64.to_le_bytes().to_vec()),
        ];
        m.add_vector(b"k", &segs, ValueKind::Tuple).unwrap();

        let entry = m.get(b"k").unwrap();
        assert_eq!(entry.vcount, 2);
        assert_eq!(entry.kind, ValueKind::Tuple);
        assert_eq!(entry.segments().unwrap(), segs);

        let attr = m.get_attr(b"k").unwrap();
        assert_eq!(attr.vcount, 2);
        assert_eq!(attr.segments, vec![(ValueKind::Utf8, 5), (ValueKind::Integer, 8)]);
        m.destroy().unwrap();
    }

    #[test]
    fn test_vector_upsert_and_update() {
        let (_, m) = fresh("m-vup");
        let segs1 = vec![
            Segment::new(ValueKind::Ascii, "one".as_bytes()),
            Segment::new(ValueKind::Ascii, "two".as_bytes()),
        ];
        assert!(m.put_vector(b"k", &segs1, ValueKind::Tuple).unwrap().is_none());

        let token = m.get(b"k").unwrap().token;
        let segs2 = vec![
            Segment::new(ValueKind::Ascii, "three".as_bytes()),
            Segment::new(ValueKind::Ascii, "four".as_bytes()),
        ];
        let prior = m.update_vector(b"k", &segs2, ValueKind::Tuple, token).unwrap();
        assert_eq!(prior.segments().unwrap(), segs1);
        assert_eq!(m.get(b"k").unwrap().segments().unwrap(), segs2);

        assert_eq!(
            m.update_vector(b"k", &segs1, ValueKind::Tuple, token).unwrap_err(),
            Error::Conflict
        );
        m.destroy().unwrap();
    }

    #[test]
    fn test_get_partial() {
        let (_, m) = fresh("m-part");
        m.add(b"plain", b"abcdefgh").unwrap();
        let part = m.get_partial(b"plain", 0, 2, 3).unwrap();
        assert_eq!(part.value, b"cde");
        // Length clipped to the value end.
        let tail = m.get_partial(b"plain", 0, 6, 100).unwrap();
        assert_eq!(tail.value, b"gh");
        assert_eq!(m.get_partial(b"plain", 0, 99, 1).unwrap_err(), Error::Arg);
        assert_eq!(m.get_partial(b"plain", 2, 0, 1).unwrap_err(), Error::Arg);

        let segs = vec![
            Segment::new(ValueKind::Utf8, "first".as_bytes()),
            Segment::new(ValueKind::Utf8, "second".as_bytes()),
        ];
        m.add_vector(b"vec", &segs, ValueKind::Tuple).unwrap();
        let part = m.get_partial(b"vec", 1, 0, 6).unwrap();
        assert_eq!(part.value, b"second");
        assert_eq!(part.kind, ValueKind::Utf8);
        m.destroy().unwrap();
    }

    #[test]
    fn test_get_attr_plain() {
        let (_, m) = fresh("m-attr");
        m.add(b"k", b"payload").unwrap();
        let attr = m.get_attr(b"k").unwrap();
        assert_eq!(attr.kind, ValueKind::Object);
        assert_eq!(attr.vlength, 7);
        assert_eq!(attr.vcount, 1);
        assert!(attr.segments.is_empty());
        m.destroy().unwrap();
    }

    #[test]
    fn test_open_sees_existing_entries() {
        let (name, m) = fresh("m-open");
        m.add(b"k", b"v").unwrap();

        let other = SharedMap::open(&name).unwrap();
        assert_eq!(other.get(b"k").unwrap().value, b"v");
        other.add(b"k2", b"v2").unwrap();
        assert_eq!(m.get(b"k2").unwrap().value, b"v2");

        drop(other);
        m.destroy().unwrap();
    }

    #[test]
    fn test_is_valid_and_magic() {
        let name = unique_name("m-valid");
        assert!(!SharedMap::is_valid(&name));
        let m = SharedMap::create(&name, 0).unwrap();
        assert!(SharedMap::is_valid(&name));
        // A queue cannot be opened as a map.
        assert_eq!(
            crate::queue::SharedQueue::open(&name, crate::queue::Mode::ReadWrite).unwrap_err(),
            Error::State
        );
        m.destroy().unwrap();
    }

    #[test]
    fn test_unique_add_under_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (_, m) = fresh("m-race");
        let m = Arc::new(m);
        let wins = Arc::new(AtomicUsize::new(0));

        // P4: of eight concurrent adds of one key, exactly one may succeed.
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || match m.add(b"contested", b"v") {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(Error::Conflict) => {}
                    Err(e) => panic!("unexpected status: {e}"),
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(m.count(), 1);
        match Arc::try_unwrap(m) {
            Ok(m) => m.destroy().unwrap(),
            Err(_) => panic!("map still shared"),
        }
    }

    #[test]
    fn test_concurrent_distinct_keys() {
        use std::sync::Arc;

        let (_, m) = fresh("m-par");
        let m = Arc::new(m);
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let key = format!("t{t}-k{i}");
                        m.add(key.as_bytes(), key.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.count(), 200);
        for t in 0..4u32 {
            for i in 0..50u32 {
                let key = format!("t{t}-k{i}");
                assert_eq!(m.get(key.as_bytes()).unwrap().value, key.as_bytes());
            }
        }
        match Arc::try_unwrap(m) {
            Ok(m) => m.destroy().unwrap(),
            Err(_) => panic!("map still shared"),
        }
    }

    #[test]
    fn test_get_during_update_never_torn() {
        use std::sync::Arc;

        let (_, m) = fresh("m-torn");
        m.put(b"k", &[b'a'; 64]).unwrap();
        let m = Arc::new(m);

        let writer = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for round in 0..200u8 {
                    let fill = if round % 2 == 0 { b'a' } else { b'b' };
                    m.put(b"k", &[fill; 64]).unwrap();
                }
            })
        };
        let reader = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for _ in 0..400 {
                    let got = m.get(b"k").unwrap().value;
                    // P5: a whole pre- or post-update value, never a mix.
                    assert_eq!(got.len(), 64);
                    assert!(got.iter().all(|&b| b == got[0]), "torn read: {got:?}");
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        match Arc::try_unwrap(m) {
            Ok(m) => m.destroy().unwrap(),
            Err(_) => panic!("map still shared"),
        }
    }

    #[test]
    fn test_size_cap_reports_nomem() {
        let name = unique_name("m-cap");
        let m = SharedMap::create(&name, shm::PAGE_BYTES).unwrap();
        // The cap equals the initial page, so the first insert that needs
        // the file to grow must refuse.
        let big = vec![1u8; 3000];
        let mut hit_cap = false;
        for i in 0..64u32 {
            match m.add(format!("cap-{i}").as_bytes(), &big) {
                Ok(_) => {}
                Err(Error::NoMem) => {
                    hit_cap = true;
                    break;
                }
                Err(e) => panic!("unexpected status: {e}"),
            }
        }
        assert!(hit_cap);
        m.destroy().unwrap();
    }
}
