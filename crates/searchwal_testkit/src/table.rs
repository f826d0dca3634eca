//! A toy full-text table whose rows and index live in index files.
//!
//! The table stands in for the external search engine: every change it
//! makes goes through a [`TransactionContext`], so it is logged, applied at
//! commit and replayed on standbys like a real index.
//!
//! ## Layout
//!
//! ```text
//! heap:  | "THP1" | next row id (u64) | entry* |
//! index: | "TIX1" | entry* |
//!
//! heap entry:  | live (u8) | row id (u64) | len (u16) | text |
//! index entry: | live (u8) | row id (u64) | len (u8)  | key  |
//! ```
//!
//! All integers are little-endian. Index keys are tokens cut to
//! [`KEY_LEN`] bytes, so an index lookup may return rows that do not
//! match; every indexed query rechecks candidates against the heap.

use searchwal_core::{CoreError, CoreResult, FileId, TransactionContext};
use searchwal_storage::{DirectorySegmentStore, InMemorySegmentStore, SegmentStore};
use std::collections::{BTreeMap, BTreeSet};

const HEAP_MAGIC: &[u8; 4] = b"THP1";
const INDEX_MAGIC: &[u8; 4] = b"TIX1";
const HEAP_HEADER: u64 = 12;
const INDEX_HEADER: u64 = 4;
const NEXT_ID_OFFSET: u64 = 4;

/// Bytes of a token kept in an index key.
pub const KEY_LEN: usize = 8;

/// Read access to a table's files, either inside a transaction or straight
/// from a store.
pub trait Snapshot {
    /// Loads a whole file, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn load(&self, file: FileId) -> CoreResult<Option<Vec<u8>>>;
}

impl Snapshot for TransactionContext {
    fn load(&self, file: FileId) -> CoreResult<Option<Vec<u8>>> {
        self.read_file(file)
    }
}

impl Snapshot for dyn SegmentStore + '_ {
    fn load(&self, file: FileId) -> CoreResult<Option<Vec<u8>>> {
        Ok(SegmentStore::read_file(self, file)?)
    }
}

impl Snapshot for InMemorySegmentStore {
    fn load(&self, file: FileId) -> CoreResult<Option<Vec<u8>>> {
        Ok(SegmentStore::read_file(self, file)?)
    }
}

impl Snapshot for DirectorySegmentStore {
    fn load(&self, file: FileId) -> CoreResult<Option<Vec<u8>>> {
        Ok(SegmentStore::read_file(self, file)?)
    }
}

/// A live row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row ID, never reused.
    pub id: u64,
    /// Row text.
    pub text: String,
}

#[derive(Debug)]
struct HeapEntry {
    offset: u64,
    live: bool,
    row: Row,
}

#[derive(Debug)]
struct IndexEntry {
    offset: u64,
    live: bool,
    row: u64,
    key: Vec<u8>,
}

/// Splits text into lowercase alphanumeric tokens.
#[must_use]
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Cuts a token to its index key.
#[must_use]
pub fn index_key(token: &str) -> Vec<u8> {
    let bytes = token.as_bytes();
    bytes[..bytes.len().min(KEY_LEN)].to_vec()
}

fn matches(text: &str, query: &BTreeSet<String>) -> bool {
    let tokens = tokenize(text);
    query.iter().all(|q| tokens.contains(q))
}

fn malformed(what: &str, offset: usize) -> CoreError {
    CoreError::invalid_operation(format!("malformed {what} at offset {offset}"))
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize, what: &str) -> CoreResult<&'a [u8]> {
    let slice = bytes
        .get(*pos..*pos + n)
        .ok_or_else(|| malformed(what, *pos))?;
    *pos += n;
    Ok(slice)
}

fn read_u64(bytes: &[u8], pos: &mut usize, what: &str) -> CoreResult<u64> {
    let raw = take(bytes, pos, 8, what)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn heap_header(next_id: u64) -> Vec<u8> {
    let mut out = HEAP_MAGIC.to_vec();
    out.extend_from_slice(&next_id.to_le_bytes());
    out
}

fn encode_heap_entry(out: &mut Vec<u8>, live: bool, row: &Row) -> CoreResult<()> {
    let text = row.text.as_bytes();
    let len = u16::try_from(text.len()).map_err(|_| {
        CoreError::invalid_operation(format!("row text of {} bytes is too long", text.len()))
    })?;
    out.push(u8::from(live));
    out.extend_from_slice(&row.id.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(text);
    Ok(())
}

fn encode_index_entry(out: &mut Vec<u8>, live: bool, row: u64, key: &[u8]) {
    out.push(u8::from(live));
    out.extend_from_slice(&row.to_le_bytes());
    // Keys are at most KEY_LEN bytes.
    out.push(key.len() as u8);
    out.extend_from_slice(key);
}

fn parse_heap(bytes: &[u8]) -> CoreResult<(u64, Vec<HeapEntry>)> {
    let mut pos = 0;
    if take(bytes, &mut pos, 4, "heap header")? != HEAP_MAGIC {
        return Err(malformed("heap header", 0));
    }
    let next_id = read_u64(bytes, &mut pos, "heap header")?;

    let mut entries = Vec::new();
    while pos < bytes.len() {
        let offset = pos as u64;
        let live = take(bytes, &mut pos, 1, "heap entry")?[0] != 0;
        let id = read_u64(bytes, &mut pos, "heap entry")?;
        let len = take(bytes, &mut pos, 2, "heap entry")?;
        let len = u16::from_le_bytes([len[0], len[1]]) as usize;
        let text = take(bytes, &mut pos, len, "heap entry")?;
        let text = String::from_utf8(text.to_vec()).map_err(|_| malformed("heap text", pos))?;
        entries.push(HeapEntry {
            offset,
            live,
            row: Row { id, text },
        });
    }
    Ok((next_id, entries))
}

fn parse_index(bytes: &[u8]) -> CoreResult<Vec<IndexEntry>> {
    let mut pos = 0;
    if take(bytes, &mut pos, 4, "index header")? != INDEX_MAGIC {
        return Err(malformed("index header", 0));
    }

    let mut entries = Vec::new();
    while pos < bytes.len() {
        let offset = pos as u64;
        let live = take(bytes, &mut pos, 1, "index entry")?[0] != 0;
        let row = read_u64(bytes, &mut pos, "index entry")?;
        let len = take(bytes, &mut pos, 1, "index entry")?[0] as usize;
        let key = take(bytes, &mut pos, len, "index entry")?.to_vec();
        entries.push(IndexEntry {
            offset,
            live,
            row,
            key,
        });
    }
    Ok(entries)
}

/// A table of text rows with an optional lossy token index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchTable {
    heap: FileId,
    index: FileId,
}

impl Default for SearchTable {
    fn default() -> Self {
        Self::new(FileId::new(1), FileId::new(2))
    }
}

impl SearchTable {
    /// Creates a table handle over the given files.
    #[must_use]
    pub const fn new(heap: FileId, index: FileId) -> Self {
        Self { heap, index }
    }

    /// Returns the heap file.
    #[must_use]
    pub const fn heap_file(&self) -> FileId {
        self.heap
    }

    /// Returns the index file.
    #[must_use]
    pub const fn index_file(&self) -> FileId {
        self.index
    }

    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table already exists or logging fails.
    pub fn create(&self, tx: &mut TransactionContext) -> CoreResult<()> {
        if tx.file_len(self.heap)?.is_some() {
            return Err(CoreError::invalid_operation("table already exists"));
        }
        tx.allocate_segment(self.heap, 0)?;
        tx.write_range(self.heap, 0, &heap_header(1))?;
        Ok(())
    }

    fn load_heap<S: Snapshot + ?Sized>(&self, snapshot: &S) -> CoreResult<(u64, Vec<HeapEntry>)> {
        let bytes = snapshot
            .load(self.heap)?
            .ok_or_else(|| CoreError::invalid_operation("table does not exist"))?;
        parse_heap(&bytes)
    }

    fn load_index<S: Snapshot + ?Sized>(&self, snapshot: &S) -> CoreResult<Option<Vec<IndexEntry>>> {
        snapshot
            .load(self.index)?
            .map(|bytes| parse_index(&bytes))
            .transpose()
    }

    /// Returns whether the table has an index.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn has_index<S: Snapshot + ?Sized>(&self, snapshot: &S) -> CoreResult<bool> {
        Ok(snapshot.load(self.index)?.is_some())
    }

    /// Inserts a row and indexes it if the table has an index.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or logging fails.
    pub fn insert(&self, tx: &mut TransactionContext, text: &str) -> CoreResult<u64> {
        let (id, _) = self.load_heap(&*tx)?;
        let end = tx.file_len(self.heap)?.unwrap_or(HEAP_HEADER);

        let mut entry = Vec::new();
        encode_heap_entry(
            &mut entry,
            true,
            &Row {
                id,
                text: text.to_owned(),
            },
        )?;
        tx.write_range(self.heap, end, &entry)?;
        tx.write_range(self.heap, NEXT_ID_OFFSET, &(id + 1).to_le_bytes())?;

        if let Some(end) = tx.file_len(self.index)? {
            let mut postings = Vec::new();
            for token in tokenize(text) {
                encode_index_entry(&mut postings, true, id, &index_key(&token));
            }
            if !postings.is_empty() {
                tx.write_range(self.index, end, &postings)?;
            }
        }
        Ok(id)
    }

    /// Builds the index over every live row.
    ///
    /// # Errors
    ///
    /// Returns an error if the index already exists.
    pub fn create_index(&self, tx: &mut TransactionContext) -> CoreResult<()> {
        if self.has_index(&*tx)? {
            return Err(CoreError::invalid_operation("index already exists"));
        }
        let (_, rows) = self.load_heap(&*tx)?;

        let mut layout = INDEX_MAGIC.to_vec();
        for entry in rows.iter().filter(|e| e.live) {
            for token in tokenize(&entry.row.text) {
                encode_index_entry(&mut layout, true, entry.row.id, &index_key(&token));
            }
        }
        tx.allocate_segment(self.index, 0)?;
        tx.write_range(self.index, 0, &layout)?;
        Ok(())
    }

    /// Drops the index.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no index.
    pub fn drop_index(&self, tx: &mut TransactionContext) -> CoreResult<()> {
        if !self.has_index(&*tx)? {
            return Err(CoreError::invalid_operation("no index to drop"));
        }
        tx.remove_file(self.index)?;
        Ok(())
    }

    /// Marks every live row matching `query` dead, along with its index
    /// entries. Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or logging fails.
    pub fn delete_matching(&self, tx: &mut TransactionContext, query: &str) -> CoreResult<usize> {
        let query = tokenize(query);
        let (_, rows) = self.load_heap(&*tx)?;
        let doomed: Vec<&HeapEntry> = rows
            .iter()
            .filter(|e| e.live && matches(&e.row.text, &query))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        for entry in &doomed {
            tx.write_range(self.heap, entry.offset, &[0])?;
        }
        if let Some(index) = self.load_index(&*tx)? {
            let ids: BTreeSet<u64> = doomed.iter().map(|e| e.row.id).collect();
            for entry in index.iter().filter(|e| e.live && ids.contains(&e.row)) {
                tx.write_range(self.index, entry.offset, &[0])?;
            }
        }
        Ok(doomed.len())
    }

    /// Rewrites the heap and the index without dead entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or logging fails.
    pub fn vacuum(&self, tx: &mut TransactionContext) -> CoreResult<()> {
        let (next_id, rows) = self.load_heap(&*tx)?;
        let mut heap = heap_header(next_id);
        for entry in rows.iter().filter(|e| e.live) {
            encode_heap_entry(&mut heap, true, &entry.row)?;
        }
        tx.compaction_rewrite(self.heap, &heap)?;

        if let Some(index) = self.load_index(&*tx)? {
            let mut layout = INDEX_MAGIC.to_vec();
            for entry in index.iter().filter(|e| e.live) {
                encode_index_entry(&mut layout, true, entry.row, &entry.key);
            }
            tx.compaction_rewrite(self.index, &layout)?;
        }
        Ok(())
    }

    /// Removes every row. Row IDs keep counting from where they were.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or logging fails.
    pub fn truncate(&self, tx: &mut TransactionContext) -> CoreResult<()> {
        self.load_heap(&*tx)?;
        tx.truncate_file(self.heap, HEAP_HEADER)?;
        if self.has_index(&*tx)? {
            tx.truncate_file(self.index, INDEX_HEADER)?;
        }
        Ok(())
    }

    /// Returns every live row in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or is malformed.
    pub fn rows<S: Snapshot + ?Sized>(&self, snapshot: &S) -> CoreResult<Vec<Row>> {
        let (_, entries) = self.load_heap(snapshot)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.live)
            .map(|e| e.row)
            .collect())
    }

    /// Returns the texts of live rows containing every token of `query`,
    /// found by reading the whole heap. Results are sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or is malformed.
    pub fn seq_scan<S: Snapshot + ?Sized>(&self, snapshot: &S, query: &str) -> CoreResult<Vec<String>> {
        let query = tokenize(query);
        let mut found: Vec<String> = self
            .rows(snapshot)?
            .into_iter()
            .filter(|row| matches(&row.text, &query))
            .map(|row| row.text)
            .collect();
        found.sort();
        Ok(found)
    }

    /// Returns the row IDs the index offers for `query`, a superset of the
    /// matching rows. `None` if there is no index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is malformed.
    pub fn candidates<S: Snapshot + ?Sized>(
        &self,
        snapshot: &S,
        query: &str,
    ) -> CoreResult<Option<BTreeSet<u64>>> {
        let Some(index) = self.load_index(snapshot)? else {
            return Ok(None);
        };
        let mut by_key: BTreeMap<&[u8], BTreeSet<u64>> = BTreeMap::new();
        let mut all = BTreeSet::new();
        for entry in index.iter().filter(|e| e.live) {
            by_key.entry(entry.key.as_slice()).or_default().insert(entry.row);
            all.insert(entry.row);
        }

        let mut result: Option<BTreeSet<u64>> = None;
        for token in tokenize(query) {
            let rows = by_key
                .get(index_key(&token).as_slice())
                .cloned()
                .unwrap_or_default();
            result = Some(match result {
                Some(acc) => acc.intersection(&rows).copied().collect(),
                None => rows,
            });
        }
        Ok(Some(result.unwrap_or(all)))
    }

    /// Answers `query` through the index, rechecking every candidate
    /// against the heap. `None` if there is no index.
    ///
    /// Returns the same rows as [`SearchTable::seq_scan`], except that a
    /// row without tokens is never found by an empty query.
    ///
    /// # Errors
    ///
    /// Returns an error if the table or index is malformed.
    pub fn index_scan<S: Snapshot + ?Sized>(
        &self,
        snapshot: &S,
        query: &str,
    ) -> CoreResult<Option<Vec<String>>> {
        let Some(candidates) = self.candidates(snapshot, query)? else {
            return Ok(None);
        };
        let tokens = tokenize(query);
        let mut found: Vec<String> = self
            .rows(snapshot)?
            .into_iter()
            .filter(|row| candidates.contains(&row.id) && matches(&row.text, &tokens))
            .map(|row| row.text)
            .collect();
        found.sort();
        Ok(Some(found))
    }
}
