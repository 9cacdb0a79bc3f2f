//! In-memory session table with sliding expiry

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Length of a session id in characters.
pub const SESSION_ID_LEN: usize = 32;

/// Sessions idle longer than this are expired on their next lookup.
pub const SESSION_TTL: Duration = Duration::from_secs(1800);

const BUCKET_COUNT: usize = 1024;

#[derive(Debug)]
struct Entry {
    id: String,
    user_id: i64,
    last_accessed: Instant,
}

#[derive(Debug)]
struct Inner {
    buckets: Vec<Vec<Entry>>,
    rng: StdRng,
}

/// Maps session ids to user ids.
///
/// Entries live in a fixed bucket vector indexed by a DJB2 hash of the id.
/// One mutex guards the whole table; contention is negligible at the
/// session counts a single host serves. Expiry is a sliding window: every
/// successful lookup refreshes `last_accessed`, and an expired entry is
/// unlinked by the lookup that discovers it.
#[derive(Debug)]
pub struct SessionTable {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl SessionTable {
    /// Creates a table with the default TTL.
    ///
    /// The id generator is seeded from the operating system's entropy
    /// source once, here.
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    /// Creates a table with a custom TTL. Used by tests to exercise expiry.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
                rng: StdRng::from_entropy(),
            }),
            ttl,
        }
    }

    /// Creates a session for `user_id` and returns its id.
    ///
    /// Ids are 32 characters drawn from the 62 alphanumerics; collisions
    /// are birthday-bounded and ignorable at realistic table sizes.
    pub fn create(&self, user_id: i64) -> String {
        let mut inner = self.inner.lock().unwrap();

        let id: String = (0..SESSION_ID_LEN)
            .map(|_| char::from(inner.rng.sample(Alphanumeric)))
            .collect();

        let bucket = bucket_of(&id);
        inner.buckets[bucket].push(Entry {
            id: id.clone(),
            user_id,
            last_accessed: Instant::now(),
        });

        debug!("session created for user {user_id} in bucket {bucket}");
        id
    }

    /// Resolves `id` to its user, refreshing the sliding window.
    ///
    /// An entry past its TTL is removed and `None` is returned, exactly as
    /// if it had never existed.
    pub fn lookup(&self, id: &str) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let chain = &mut inner.buckets[bucket_of(id)];
        let pos = chain.iter().position(|e| e.id == id)?;

        if now.duration_since(chain[pos].last_accessed) > self.ttl {
            chain.swap_remove(pos);
            debug!("session expired: {id}");
            return None;
        }

        chain[pos].last_accessed = now;
        Some(chain[pos].user_id)
    }

    /// Removes `id` if present. Idempotent.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let chain = &mut inner.buckets[bucket_of(id)];
        if let Some(pos) = chain.iter().position(|e| e.id == id) {
            chain.swap_remove(pos);
        }
    }

    /// Drops every session. Called at shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for chain in &mut inner.buckets {
            chain.clear();
        }
    }

    /// Number of live (possibly expired but not yet collected) sessions.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.buckets.iter().map(Vec::len).sum()
    }

    /// Whether the table holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

// DJB2: hash * 33 + byte, as the classic formulation.
fn bucket_of(id: &str) -> usize {
    let mut hash: u64 = 5381;
    for &b in id.as_bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(b));
    }
    (hash % BUCKET_COUNT as u64) as usize
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::{SessionTable, SESSION_ID_LEN};

    #[test]
    fn create_returns_alphanumeric_id_of_fixed_length() {
        let table = SessionTable::new();
        let id = table.create(7);
        assert_eq!(SESSION_ID_LEN, id.len());
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn lookup_resolves_created_session() {
        let table = SessionTable::new();
        let id = table.create(42);
        assert_eq!(Some(42), table.lookup(&id));
        assert_eq!(None, table.lookup("nosuchsession"));
    }

    #[test]
    fn lookup_expires_and_unlinks_stale_entries() {
        let table = SessionTable::with_ttl(Duration::from_millis(10));
        let id = table.create(1);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(None, table.lookup(&id));
        assert_eq!(0, table.len());
    }

    #[test]
    fn lookup_slides_the_expiry_window() {
        let table = SessionTable::with_ttl(Duration::from_millis(60));
        let id = table.create(1);

        // Each touch lands inside the window and must extend it.
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(30));
            assert_eq!(Some(1), table.lookup(&id));
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let table = SessionTable::new();
        let id = table.create(5);
        table.remove(&id);
        table.remove(&id);
        assert_eq!(None, table.lookup(&id));
    }

    #[test]
    fn clear_empties_the_table() {
        let table = SessionTable::new();
        for user in 0..16 {
            table.create(user);
        }
        assert_eq!(16, table.len());
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn distinct_sessions_do_not_collide() {
        let table = SessionTable::new();
        let a = table.create(1);
        let b = table.create(2);
        assert_ne!(a, b);
        assert_eq!(Some(1), table.lookup(&a));
        assert_eq!(Some(2), table.lookup(&b));
    }
}
