#![forbid(unsafe_code)]
//! Directory child lists.
//!
//! Each directory keeps its entries keyed by a stable offset. Offsets are
//! handed out from a per-directory cursor that starts at 2 (positions 0 and
//! 1 are `.` and `..`) and only ever grows, so an offset is never reused
//! and readdir can resume from any position it returned.

use pfs_alloc::SlotId;
use pfs_error::{PfsError, Result, pfs_assert};
use pfs_types::{FileType, InodeNumber, NAME_MAX, PAGE_SIZE_U64};
use serde::Serialize;
use std::collections::BTreeMap;

/// Readdir position of `.`.
pub const POS_DOT: u64 = 0;
/// Readdir position of `..`.
pub const POS_DOTDOT: u64 = 1;
/// Initial value of the offset cursor.
pub const FIRST_CURSOR: u64 = 2;

/// Reject names the engine cannot store.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(PfsError::InvalidArgument("empty name".to_owned()));
    }
    if name.len() > NAME_MAX {
        return Err(PfsError::NameTooLong);
    }
    Ok(())
}

/// One named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: InodeNumber,
    pub kind: FileType,
    pub offset: u64,
    pub slot: SlotId,
}

/// Entry handed to a readdir emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaddirEntry<'a> {
    pub name: &'a [u8],
    pub ino: InodeNumber,
    pub kind: FileType,
    /// Position to resume from after this entry.
    pub next_pos: u64,
}

/// Where a readdir pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaddirOutcome {
    pub pos: u64,
    /// The emitter refused an entry; more remain from `pos`.
    pub more: bool,
}

#[derive(Debug, Clone)]
pub struct DirChildren {
    entries: BTreeMap<u64, DirEntry>,
    cursor: u64,
}

impl Default for DirChildren {
    fn default() -> Self {
        Self::new()
    }
}

impl DirChildren {
    #[must_use]
    pub fn new() -> Self {
        Self::with_cursor(FIRST_CURSOR)
    }

    /// Child list resuming from a persisted cursor.
    #[must_use]
    pub fn with_cursor(cursor: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            cursor: cursor.max(FIRST_CURSOR),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Append a child at the next offset and return that offset.
    ///
    /// The caller has already checked the name and allocated `slot`.
    pub fn insert(&mut self, name: &[u8], ino: InodeNumber, kind: FileType, slot: SlotId) -> u64 {
        let offset = self.cursor * PAGE_SIZE_U64;
        self.cursor += 1;
        pfs_assert!(
            self.entries
                .last_key_value()
                .is_none_or(|(last, _)| *last < offset),
            "directory offsets must increase"
        );
        self.entries.insert(
            offset,
            DirEntry {
                name: name.to_vec(),
                ino,
                kind,
                offset,
                slot,
            },
        );
        offset
    }

    /// Linear scan by exact name.
    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&DirEntry> {
        self.entries.values().find(|e| e.name == name)
    }

    /// Unlink the child called `name`.
    pub fn remove(&mut self, name: &[u8]) -> Option<DirEntry> {
        let offset = self.lookup(name)?.offset;
        self.entries.remove(&offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    /// Emit entries from `pos` until the emitter refuses one or the list ends.
    ///
    /// A refused entry is not consumed: the returned position points at it.
    pub fn readdir<F>(
        &self,
        pos: u64,
        self_ino: InodeNumber,
        parent_ino: InodeNumber,
        mut emit: F,
    ) -> ReaddirOutcome
    where
        F: FnMut(&ReaddirEntry<'_>) -> bool,
    {
        let mut pos = pos;
        let dots = [
            (POS_DOT, b".".as_slice(), self_ino),
            (POS_DOTDOT, b"..".as_slice(), parent_ino),
        ];
        for (at, name, ino) in dots {
            if pos != at {
                continue;
            }
            let entry = ReaddirEntry {
                name,
                ino,
                kind: FileType::Directory,
                next_pos: at + 1,
            };
            if !emit(&entry) {
                return ReaddirOutcome { pos, more: true };
            }
            pos = entry.next_pos;
        }

        for child in self.entries.range(pos..).map(|(_, e)| e) {
            let entry = ReaddirEntry {
                name: &child.name,
                ino: child.ino,
                kind: child.kind,
                next_pos: child.offset + 1,
            };
            if !emit(&entry) {
                return ReaddirOutcome { pos, more: true };
            }
            pos = entry.next_pos;
        }
        ReaddirOutcome { pos, more: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::PageNumber;
    use proptest::prelude::*;

    fn slot(i: u16) -> SlotId {
        SlotId {
            page: PageNumber(100),
            index: i,
        }
    }

    fn names_from(dir: &DirChildren, pos: u64, budget: usize) -> (Vec<Vec<u8>>, ReaddirOutcome) {
        let mut out = Vec::new();
        let outcome = dir.readdir(pos, InodeNumber(5), InodeNumber(1), |e| {
            if out.len() == budget {
                return false;
            }
            out.push(e.name.to_vec());
            true
        });
        (out, outcome)
    }

    #[test]
    fn name_validation() {
        assert!(validate_name(b"ok").is_ok());
        assert!(matches!(
            validate_name(b""),
            Err(PfsError::InvalidArgument(_))
        ));
        assert!(validate_name(&[b'a'; NAME_MAX]).is_ok());
        assert!(matches!(
            validate_name(&[b'a'; NAME_MAX + 1]),
            Err(PfsError::NameTooLong)
        ));
    }

    #[test]
    fn offsets_start_at_two_pages_and_grow() {
        let mut dir = DirChildren::new();
        let a = dir.insert(b"a", InodeNumber(2), FileType::RegularFile, slot(0));
        let b = dir.insert(b"b", InodeNumber(3), FileType::Directory, slot(1));
        assert_eq!(a, 2 * PAGE_SIZE_U64);
        assert_eq!(b, 3 * PAGE_SIZE_U64);
        assert_eq!(dir.cursor(), 4);
    }

    #[test]
    fn removed_offsets_are_not_reused() {
        let mut dir = DirChildren::new();
        let a = dir.insert(b"a", InodeNumber(2), FileType::RegularFile, slot(0));
        assert_eq!(dir.remove(b"a").map(|e| e.offset), Some(a));
        let again = dir.insert(b"a", InodeNumber(2), FileType::RegularFile, slot(0));
        assert!(again > a);
        assert!(dir.remove(b"missing").is_none());
    }

    #[test]
    fn readdir_emits_dots_then_children() {
        let mut dir = DirChildren::new();
        dir.insert(b"x", InodeNumber(7), FileType::Symlink, slot(0));
        let mut seen = Vec::new();
        let outcome = dir.readdir(0, InodeNumber(5), InodeNumber(1), |e| {
            seen.push((e.name.to_vec(), e.ino, e.kind));
            true
        });
        assert!(!outcome.more);
        assert_eq!(
            seen,
            vec![
                (b".".to_vec(), InodeNumber(5), FileType::Directory),
                (b"..".to_vec(), InodeNumber(1), FileType::Directory),
                (b"x".to_vec(), InodeNumber(7), FileType::Symlink),
            ]
        );
        assert_eq!(outcome.pos, 2 * PAGE_SIZE_U64 + 1);
    }

    #[test]
    fn refused_entry_is_emitted_again() {
        let mut dir = DirChildren::new();
        dir.insert(b"a", InodeNumber(2), FileType::RegularFile, slot(0));
        dir.insert(b"b", InodeNumber(3), FileType::RegularFile, slot(1));

        let (first, outcome) = names_from(&dir, 0, 3);
        assert_eq!(first, vec![b".".to_vec(), b"..".to_vec(), b"a".to_vec()]);
        assert!(outcome.more);

        let (rest, outcome) = names_from(&dir, outcome.pos, 10);
        assert_eq!(rest, vec![b"b".to_vec()]);
        assert!(!outcome.more);
    }

    #[test]
    fn emitter_refusing_dot_stops_at_zero() {
        let dir = DirChildren::new();
        let (names, outcome) = names_from(&dir, 0, 0);
        assert!(names.is_empty());
        assert_eq!(outcome, ReaddirOutcome { pos: 0, more: true });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn resumed_readdir_yields_exactly_unseen_entries(
            count in 0_usize..40,
            removals in proptest::collection::vec(0_usize..40, 0..20),
            budget in 1_usize..6,
        ) {
            let mut dir = DirChildren::new();
            for i in 0..count {
                let name = format!("n{i}");
                let index = u16::try_from(i).unwrap_or(u16::MAX);
                dir.insert(name.as_bytes(), InodeNumber(10 + i as u64), FileType::RegularFile, slot(index));
            }
            for r in removals {
                dir.remove(format!("n{r}").as_bytes());
            }

            let mut expected: Vec<Vec<u8>> = vec![b".".to_vec(), b"..".to_vec()];
            expected.extend(dir.iter().map(|e| e.name.clone()));

            let mut all = Vec::new();
            let mut pos = 0;
            loop {
                let (chunk, outcome) = names_from(&dir, pos, budget);
                all.extend(chunk);
                pos = outcome.pos;
                if !outcome.more {
                    break;
                }
            }
            prop_assert_eq!(all, expected);
        }

        #[test]
        fn offsets_never_collide(ops in proptest::collection::vec(any::<bool>(), 1..60)) {
            let mut dir = DirChildren::new();
            let mut seen = std::collections::HashSet::new();
            let mut live = Vec::new();
            for (i, add) in ops.into_iter().enumerate() {
                if add || live.is_empty() {
                    let name = format!("e{i}");
                    let off = dir.insert(name.as_bytes(), InodeNumber(2), FileType::Fifo, slot(0));
                    prop_assert!(seen.insert(off));
                    live.push(name);
                } else {
                    let name = live.remove(0);
                    prop_assert!(dir.remove(name.as_bytes()).is_some());
                }
            }
        }
    }
}
