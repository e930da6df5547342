//! Fuses shell pre-exec and post-exec hook calls into paired
//! `(command, exit-code)` records without any shared identifier being
//! available at the pre-exec point (spec §4.1).
//!
//! The distance function and scan order are pinned to the original
//! implementation (`examples/original_source/metashell/keyService.go`); the
//! TTY-partition invariant (I3) is enforced by treating cross-TTY candidates
//! as absent rather than merely "far" — the source's literal behavior
//! (picking the least-bad cross-TTY match when nothing else exists) would
//! violate the spec's own I3 invariant, so this implementation follows the
//! invariant rather than the source's distance-only argmin.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Mutex;

/// The intrinsic identity of one command entry: `(tty, command, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVector {
    pub tty: String,
    pub command: String,
    pub timestamp: i64,
}

impl CommandVector {
    pub fn new(tty: impl Into<String>, command: impl Into<String>, timestamp: i64) -> Self {
        Self {
            tty: tty.into(),
            command: command.into(),
            timestamp,
        }
    }

    /// A time-prefixed content hash: `"{timestamp}-{md5_hex(tty + command)}"`.
    /// Matches `vector.key()` in the original implementation exactly.
    fn key(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.tty.as_bytes());
        hasher.update(self.command.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("{}-{}", self.timestamp, hex)
    }
}

/// Opaque, collision-resistant printable string issued for one
/// [`CommandVector`]. Never constructed directly by callers outside this
/// crate other than via [`KeyService::register`].
pub type CommandKey = String;

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m]
}

/// `dist(a, b) = +∞ if a.tty != b.tty; else sqrt(dt^2 + dc^2)` (spec §4.1).
fn distance(a: &CommandVector, b: &CommandVector) -> f64 {
    if a.tty != b.tty {
        return f64::INFINITY;
    }
    let dt = (a.timestamp - b.timestamp).unsigned_abs() as f64;
    let dc = levenshtein(&a.command, &b.command) as f64;
    (dt * dt + dc * dc).sqrt()
}

struct Entry {
    key: CommandKey,
    vector: CommandVector,
}

#[derive(Default)]
struct Inner {
    assigned: HashMap<CommandKey, usize>,
    series: Vec<Entry>,
}

/// Correlates pre-exec and post-exec shell hook calls (spec §4.1).
///
/// A single exclusive lock guards the whole service (spec §5); reads do not
/// need to be lock-free since contention is bounded by outstanding commands
/// on the user's shells.
pub struct KeyService {
    inner: Mutex<Inner>,
}

impl Default for KeyService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyService {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Assigns a key for `v`, inserting `(key, v)` into `assigned` and
    /// appending `v` to `series`. Never fails.
    pub fn register(&self, vector: CommandVector) -> CommandKey {
        let key = vector.key();
        let mut inner = self.inner.lock().expect("key service lock poisoned");
        let index = inner.series.len();
        inner.series.push(Entry {
            key: key.clone(),
            vector,
        });
        inner.assigned.insert(key.clone(), index);
        key
    }

    /// Finds the outstanding vector closest to `query` under the distance
    /// function above, scanning newest-to-oldest and keeping the argmin;
    /// ties prefer the closer timestamp, and among those the vector
    /// encountered first in the newest-to-oldest scan (I5). Candidates on a
    /// different TTY are never considered (I3). Returns `""` if no
    /// same-TTY candidate exists, including on an empty service (I4).
    ///
    /// Does not mutate state.
    pub fn lookup(&self, query: &CommandVector) -> CommandKey {
        let inner = self.inner.lock().expect("key service lock poisoned");
        let mut best: Option<(&Entry, f64)> = None;

        for entry in inner.series.iter().rev() {
            if entry.vector.tty != query.tty {
                continue;
            }
            let d = distance(&entry.vector, query);
            match &best {
                None => best = Some((entry, d)),
                Some((best_entry, best_d)) => {
                    if d < *best_d {
                        best = Some((entry, d));
                    } else if d == *best_d {
                        let dt = (entry.vector.timestamp - query.timestamp).unsigned_abs();
                        let best_dt = (best_entry.vector.timestamp - query.timestamp).unsigned_abs();
                        if dt < best_dt {
                            best = Some((entry, d));
                        }
                    }
                }
            }
        }

        best.map(|(entry, _)| entry.key.clone()).unwrap_or_default()
    }

    /// Removes the mapping and series entry for `key`, if present, and
    /// returns the original vector (I1).
    pub fn redeem(&self, key: &str) -> Option<CommandVector> {
        let mut inner = self.inner.lock().expect("key service lock poisoned");
        let index = inner.assigned.remove(key)?;
        let removed = inner.series.remove(index).vector;

        // Removing a middle element shifted every later index down by one;
        // fix up the map rather than leaving it pointing at the wrong slot.
        for idx in inner.assigned.values_mut() {
            if *idx > index {
                *idx -= 1;
            }
        }

        Some(removed)
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.assigned.len(), inner.series.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_round_trips_and_shrinks_the_service() {
        let svc = KeyService::new();
        let v = CommandVector::new("/dev/pts/3", "ls -l", 1000);
        let key = svc.register(v.clone());

        assert_eq!(svc.len(), (1, 1));
        let redeemed = svc.redeem(&key).expect("vector should be present");
        assert_eq!(redeemed, v);
        assert_eq!(svc.len(), (0, 0));
        assert!(svc.redeem(&key).is_none());
    }

    #[test]
    fn lookup_never_crosses_tty_boundary() {
        let svc = KeyService::new();
        svc.register(CommandVector::new("/dev/pts/3", "x", 1000));

        let query = CommandVector::new("/dev/pts/4", "x", 1000);
        assert_eq!(svc.lookup(&query), "");
    }

    #[test]
    fn lookup_on_empty_service_is_empty_string() {
        let svc = KeyService::new();
        let query = CommandVector::new("/dev/pts/3", "anything", 1);
        assert_eq!(svc.lookup(&query), "");
    }

    #[test]
    fn levenshtein_match_beats_timestamp_distance() {
        let svc = KeyService::new();
        let v1 = CommandVector::new("/dev/pts/3", "echo hi", 1000);
        let v2 = CommandVector::new("/dev/pts/3", "echo hey", 1005);
        let k1 = svc.register(v1);
        let k2 = svc.register(v2);

        let query = CommandVector::new("/dev/pts/3", "echo hey", 1005);
        assert_eq!(svc.lookup(&query), k2);
        assert_ne!(svc.lookup(&query), k1);
    }

    #[test]
    fn distance_tie_break_prefers_the_newest_scanned_candidate() {
        let svc = KeyService::new();
        // Identical command text on both sides of the query timestamp gives
        // an exact tie on edit distance (0) and on |Δt| (50 each); the
        // newest-to-oldest scan visits the more recent vector first, and it
        // is not strictly beaten, so it keeps the win.
        svc.register(CommandVector::new("/dev/pts/1", "echo hi", 1000));
        let key_newer = svc.register(CommandVector::new("/dev/pts/1", "echo hi", 1100));

        let query = CommandVector::new("/dev/pts/1", "echo hi", 1050);
        assert_eq!(svc.lookup(&query), key_newer);
    }

    #[test]
    fn register_then_lookup_then_redeem_happy_path() {
        let svc = KeyService::new();
        let v1 = CommandVector::new("/dev/pts/3", "ls -l", 1000);
        let key = svc.register(v1.clone());

        let found = svc.lookup(&CommandVector::new("/dev/pts/3", "ls -l", 1000));
        assert_eq!(found, key);

        let redeemed = svc.redeem(&found).unwrap();
        assert_eq!(redeemed, v1);
    }

    #[test]
    fn redeeming_a_middle_entry_keeps_remaining_lookups_correct() {
        let svc = KeyService::new();
        let k1 = svc.register(CommandVector::new("/dev/pts/3", "a", 1));
        let k2 = svc.register(CommandVector::new("/dev/pts/3", "bbbbb", 2));
        let k3 = svc.register(CommandVector::new("/dev/pts/3", "ccccccccc", 3));

        svc.redeem(&k2).unwrap();

        assert_eq!(
            svc.lookup(&CommandVector::new("/dev/pts/3", "a", 1)),
            k1
        );
        assert_eq!(
            svc.lookup(&CommandVector::new("/dev/pts/3", "ccccccccc", 3)),
            k3
        );
    }
}
