//! Append-only, tick-segmented execution log
//!
//! [`ExecutionLog`] is the single writer: it buffers records for the open
//! tick and seals them into immutable segments. [`LogReader`] is a cheap,
//! cloneable handle that only ever sees sealed segments, so readers never
//! observe the in-flight buffer.
//!
//! Durability ordering when a root is configured:
//! 1. Write the segment file atomically (temp file, fsync, rename)
//! 2. Append and fsync the segment header to `meta/segments.index`
//!
//! A tick is sealed iff its header line exists. Recovery drops anything
//! written after the last complete header.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::ops::{Bound, ControlFlow, RangeBounds};
use std::sync::Arc;

use super::error::{LogError, LogResult};
use super::record::{
    EntityId, ExecutionRecord, GENESIS_DIGEST, RecordPosition, SegmentHeader, Tick,
    compute_segment_digest,
};
use super::storage::{Storage, init_storage};
use super::views::LogView;
use crate::grammar::Command;

/// A sealed tick: its header and records in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Seal metadata
    pub header: SegmentHeader,
    /// Records in append order
    pub records: Vec<ExecutionRecord>,
}

impl Segment {
    /// Tick of this segment
    pub fn tick(&self) -> Tick {
        self.header.tick
    }
}

/// Read-only view over sealed segments.
#[derive(Debug, Clone, Default)]
pub struct LogReader {
    segments: Arc<RwLock<Vec<Arc<Segment>>>>,
}

impl LogReader {
    /// Number of sealed ticks (ticks `0..len` are sealed).
    pub fn sealed_len(&self) -> u64 {
        self.segments.read().len() as u64
    }

    /// Most recently sealed tick, if any.
    pub fn sealed_head(&self) -> Option<Tick> {
        self.segments.read().last().map(|segment| segment.tick())
    }

    /// Digest of the most recently sealed segment.
    pub fn head_digest(&self) -> String {
        self.segments
            .read()
            .last()
            .map(|segment| segment.header.digest.clone())
            .unwrap_or_else(|| GENESIS_DIGEST.to_string())
    }

    /// Read a sealed segment.
    pub fn read_segment(&self, tick: Tick) -> LogResult<Arc<Segment>> {
        let index = usize::try_from(tick).map_err(|_| LogError::SegmentNotFound(tick))?;
        self.segments
            .read()
            .get(index)
            .cloned()
            .ok_or(LogError::SegmentNotFound(tick))
    }

    /// Look up a single sealed record.
    pub fn record_at(&self, position: RecordPosition) -> Option<ExecutionRecord> {
        let segment = self.read_segment(position.tick).ok()?;
        segment.records.get(position.index).cloned()
    }

    /// Fold every sealed record in `range` in tick order, then record order.
    pub fn replay<A, F>(&self, range: impl RangeBounds<Tick>, acc: A, mut fold: F) -> A
    where
        F: FnMut(A, &ExecutionRecord) -> A,
    {
        self.replay_indexed(range, acc, |acc, _, record| fold(acc, record))
    }

    /// Like [`replay`](Self::replay) but also passes each record's position.
    pub fn replay_indexed<A, F>(&self, range: impl RangeBounds<Tick>, mut acc: A, mut fold: F) -> A
    where
        F: FnMut(A, RecordPosition, &ExecutionRecord) -> A,
    {
        for segment in self.snapshot(range) {
            for (index, record) in segment.records.iter().enumerate() {
                acc = fold(acc, RecordPosition::new(segment.tick(), index), record);
            }
        }
        acc
    }

    /// Build a derived view from scratch over `range`.
    pub fn fold_view<V>(&self, range: impl RangeBounds<Tick>) -> V
    where
        V: LogView + Default,
    {
        self.replay(range, V::default(), |view, record| view.apply(record))
    }

    /// Iterate sealed records strictly after `position`.
    pub fn iter_after(&self, position: RecordPosition) -> Records {
        let mut records = Records::new(self.snapshot(position.tick..));
        records.skip_through(position);
        records
    }

    /// Visit sealed records after `position` up to and including tick
    /// `until`, by reference, until `visit` breaks.
    pub fn scan_after<F>(&self, position: RecordPosition, until: Tick, mut visit: F)
    where
        F: FnMut(&ExecutionRecord) -> ControlFlow<()>,
    {
        for segment in self.snapshot(position.tick..=until) {
            let skip = if segment.tick() == position.tick {
                position.index.saturating_add(1)
            } else {
                0
            };
            for record in segment.records.iter().skip(skip) {
                if visit(record).is_break() {
                    return;
                }
            }
        }
    }

    /// Iterate all sealed records.
    pub fn iter_all(&self) -> Records {
        Records::new(self.snapshot(..))
    }

    /// Clone the segment handles in `range` so iteration holds no lock.
    fn snapshot(&self, range: impl RangeBounds<Tick>) -> Vec<Arc<Segment>> {
        let segments = self.segments.read();
        let len = segments.len();
        let start = match range.start_bound() {
            Bound::Included(&tick) => clamp(tick, len),
            Bound::Excluded(&tick) => clamp(tick.saturating_add(1), len),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&tick) => clamp(tick.saturating_add(1), len),
            Bound::Excluded(&tick) => clamp(tick, len),
            Bound::Unbounded => len,
        };
        if start >= end {
            return Vec::new();
        }
        segments[start..end].to_vec()
    }

    fn push(&self, segment: Segment) {
        self.segments.write().push(Arc::new(segment));
    }
}

fn clamp(tick: Tick, len: usize) -> usize {
    usize::try_from(tick).map_or(len, |tick| tick.min(len))
}

/// Iterator over sealed records and their positions.
pub struct Records {
    segments: Vec<Arc<Segment>>,
    segment: usize,
    index: usize,
}

impl Records {
    fn new(segments: Vec<Arc<Segment>>) -> Self {
        Self {
            segments,
            segment: 0,
            index: 0,
        }
    }

    fn skip_through(&mut self, position: RecordPosition) {
        if let Some(first) = self.segments.first() {
            if first.tick() == position.tick {
                self.index = position.index.saturating_add(1);
            }
        }
    }
}

impl Iterator for Records {
    type Item = (RecordPosition, ExecutionRecord);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segments.get(self.segment)?;
            if let Some(record) = segment.records.get(self.index) {
                let position = RecordPosition::new(segment.tick(), self.index);
                self.index += 1;
                return Some((position, record.clone()));
            }
            self.segment += 1;
            self.index = 0;
        }
    }
}

/// Single-writer execution log.
pub struct ExecutionLog {
    storage: Option<Storage>,
    reader: LogReader,
    open_tick: Tick,
    buffer: Vec<ExecutionRecord>,
}

impl ExecutionLog {
    /// Create a log that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            reader: LogReader::default(),
            open_tick: 0,
            buffer: Vec::new(),
        }
    }

    /// Open (or create) a persistent log, recovering from a crash if needed.
    pub fn open(storage: Storage) -> LogResult<Self> {
        init_storage(storage.root()).map_err(storage_error)?;

        let headers = read_headers(&storage)?;
        let reader = LogReader::default();
        let mut prev_digest = GENESIS_DIGEST.to_string();

        for (expected, header) in (0..).zip(headers) {
            if header.tick != expected {
                return Err(LogError::Gap {
                    expected,
                    found: header.tick,
                });
            }
            let segment = load_segment(&storage, header, &prev_digest)?;
            prev_digest = segment.header.digest.clone();
            reader.push(segment);
        }

        let open_tick = reader.sealed_len();
        remove_unsealed_segments(&storage, open_tick)?;

        tracing::info!(
            sealed = open_tick,
            root = %storage.root().display(),
            "Execution log opened"
        );

        Ok(Self {
            storage: Some(storage),
            reader,
            open_tick,
            buffer: Vec::new(),
        })
    }

    /// Tick currently accepting appends.
    pub fn open_tick(&self) -> Tick {
        self.open_tick
    }

    /// Records buffered for the open tick.
    pub fn pending(&self) -> &[ExecutionRecord] {
        &self.buffer
    }

    /// Handle for reading sealed segments.
    pub fn reader(&self) -> LogReader {
        self.reader.clone()
    }

    /// Buffer a record into the open tick.
    pub fn append(
        &mut self,
        tick: Tick,
        executor: EntityId,
        command: Command,
        output: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> LogResult<RecordPosition> {
        self.append_record(ExecutionRecord::new(tick, executor, command, output, timestamp))
    }

    /// Buffer a prepared record into the open tick.
    pub fn append_record(&mut self, record: ExecutionRecord) -> LogResult<RecordPosition> {
        if record.tick < self.open_tick {
            return Err(LogError::SealedTick {
                tick: record.tick,
                open: self.open_tick,
            });
        }
        if record.tick > self.open_tick {
            return Err(LogError::FutureTick {
                tick: record.tick,
                open: self.open_tick,
            });
        }

        let position = RecordPosition::new(self.open_tick, self.buffer.len());
        self.buffer.push(record);
        Ok(position)
    }

    /// Seal the open tick and open the next one.
    ///
    /// On error the open buffer is left untouched and the tick stays open.
    pub fn seal_tick(&mut self, sealed_at: DateTime<Utc>) -> LogResult<SegmentHeader> {
        let lines = self
            .buffer
            .iter()
            .map(|record| {
                record
                    .encode_line()
                    .map_err(|e| LogError::Encoding(e.to_string()))
            })
            .collect::<LogResult<Vec<_>>>()?;

        let prev_digest = self.reader.head_digest();
        let header = SegmentHeader {
            tick: self.open_tick,
            records: lines.len(),
            sealed_at,
            digest: compute_segment_digest(&prev_digest, self.open_tick, &lines),
            prev_digest,
        };

        if let Some(storage) = &self.storage {
            persist_segment(storage, &header, &lines)?;
        }

        let records = std::mem::take(&mut self.buffer);
        self.reader.push(Segment {
            header: header.clone(),
            records,
        });
        self.open_tick += 1;

        tracing::debug!(
            tick = header.tick,
            records = header.records,
            digest = %header.digest,
            "Tick sealed"
        );

        Ok(header)
    }
}

fn storage_error(err: anyhow::Error) -> LogError {
    LogError::Storage(format!("{err:#}"))
}

fn persist_segment(storage: &Storage, header: &SegmentHeader, lines: &[String]) -> LogResult<()> {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }

    storage
        .write_atomic(&storage.segment_path(header.tick), body.as_bytes())
        .map_err(storage_error)?;

    let header_line =
        serde_json::to_string(header).map_err(|e| LogError::Encoding(e.to_string()))?;
    storage
        .append_line(&storage.segment_index_path(), &header_line)
        .map_err(storage_error)
}

/// Read the header index, repairing a torn final line.
fn read_headers(storage: &Storage) -> LogResult<Vec<SegmentHeader>> {
    let path = storage.segment_index_path();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = storage.read_file(&path).map_err(storage_error)?;
    let text = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = text.split_terminator('\n').collect();

    let mut headers = Vec::with_capacity(lines.len());
    let mut repaired = !text.is_empty() && !text.ends_with('\n');

    for (number, line) in lines.iter().enumerate() {
        match serde_json::from_str::<SegmentHeader>(line) {
            Ok(header) => headers.push(header),
            Err(err) if number + 1 == lines.len() => {
                tracing::warn!(error = %err, "Dropping torn segment header");
                repaired = true;
            }
            Err(err) => {
                return Err(LogError::Corrupted {
                    tick: headers.len() as Tick,
                    detail: format!("unreadable header: {err}"),
                });
            }
        }
    }

    if repaired {
        let mut body = String::new();
        for header in &headers {
            let line =
                serde_json::to_string(header).map_err(|e| LogError::Encoding(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }
        storage
            .write_atomic(&path, body.as_bytes())
            .map_err(storage_error)?;
        tracing::info!(headers = headers.len(), "Rewrote segment index");
    }

    Ok(headers)
}

/// Load a sealed segment and verify it against its header.
fn load_segment(storage: &Storage, header: SegmentHeader, prev_digest: &str) -> LogResult<Segment> {
    let tick = header.tick;
    let corrupted = |detail: String| LogError::Corrupted { tick, detail };

    if header.prev_digest != prev_digest {
        return Err(corrupted("digest chain broken".to_string()));
    }

    let path = storage.segment_path(tick);
    if !path.exists() {
        return Err(corrupted("segment file missing".to_string()));
    }
    let data = storage.read_file(&path).map_err(storage_error)?;
    let text = String::from_utf8(data).map_err(|e| corrupted(e.to_string()))?;
    let lines: Vec<String> = text.lines().map(str::to_string).collect();

    if lines.len() != header.records {
        return Err(corrupted(format!(
            "expected {} records, found {}",
            header.records,
            lines.len()
        )));
    }
    if compute_segment_digest(prev_digest, tick, &lines) != header.digest {
        return Err(corrupted("digest mismatch".to_string()));
    }

    let records = lines
        .iter()
        .map(|line| ExecutionRecord::decode_line(line).map_err(|e| LogError::Decoding(e.to_string())))
        .collect::<LogResult<Vec<_>>>()?;

    if let Some(stray) = records.iter().find(|record| record.tick != tick) {
        return Err(corrupted(format!("record from tick {} in segment", stray.tick)));
    }

    Ok(Segment { header, records })
}

/// Delete segment files written after the last sealed header.
fn remove_unsealed_segments(storage: &Storage, open_tick: Tick) -> LogResult<()> {
    for path in storage.list_dir(&storage.log_dir()).map_err(storage_error)? {
        let stale = match Storage::segment_tick(&path) {
            Some(tick) => tick >= open_tick,
            None => path.extension().is_some_and(|ext| ext == "tmp"),
        };
        if stale {
            tracing::warn!(path = %path.display(), "Removing unsealed segment file");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::parse;
    use tempfile::TempDir;

    fn alice() -> EntityId {
        EntityId::parse("alice").unwrap()
    }

    fn append_say(log: &mut ExecutionLog, text: &str) -> RecordPosition {
        let tick = log.open_tick();
        let command = parse(&format!("\\say {text} ---")).unwrap();
        log.append(tick, alice(), command, "ok", Utc::now()).unwrap()
    }

    #[test]
    fn test_append_and_seal() {
        let mut log = ExecutionLog::in_memory();
        assert_eq!(append_say(&mut log, "one"), RecordPosition::new(0, 0));
        assert_eq!(append_say(&mut log, "two"), RecordPosition::new(0, 1));

        let reader = log.reader();
        assert_eq!(reader.sealed_len(), 0);
        assert!(reader.read_segment(0).is_err());

        let header = log.seal_tick(Utc::now()).unwrap();
        assert_eq!(header.tick, 0);
        assert_eq!(header.records, 2);
        assert_eq!(header.prev_digest, GENESIS_DIGEST);
        assert_eq!(log.open_tick(), 1);
        assert!(log.pending().is_empty());

        let segment = reader.read_segment(0).unwrap();
        assert_eq!(segment.records.len(), 2);
        assert_eq!(segment.records[1].command.text(), "two");
    }

    #[test]
    fn test_sealed_tick_rejects_append() {
        let mut log = ExecutionLog::in_memory();
        log.seal_tick(Utc::now()).unwrap();

        let command = parse(r"\say late ---").unwrap();
        let err = log.append(0, alice(), command.clone(), "ok", Utc::now()).unwrap_err();
        assert!(matches!(err, LogError::SealedTick { tick: 0, open: 1 }));

        let err = log.append(5, alice(), command, "ok", Utc::now()).unwrap_err();
        assert!(matches!(err, LogError::FutureTick { tick: 5, open: 1 }));
    }

    #[test]
    fn test_replay_order_and_range() {
        let mut log = ExecutionLog::in_memory();
        for tick in 0..3 {
            append_say(&mut log, &format!("t{tick}a"));
            append_say(&mut log, &format!("t{tick}b"));
            log.seal_tick(Utc::now()).unwrap();
        }
        let reader = log.reader();

        let all = reader.replay(.., Vec::new(), |mut acc, record| {
            acc.push(record.command.text());
            acc
        });
        assert_eq!(all, vec!["t0a", "t0b", "t1a", "t1b", "t2a", "t2b"]);

        let tail = reader.replay(1..=1, 0, |count, _| count + 1);
        assert_eq!(tail, 2);

        let after: Vec<_> = reader
            .iter_after(RecordPosition::new(1, 0))
            .map(|(position, _)| position)
            .collect();
        assert_eq!(
            after,
            vec![
                RecordPosition::new(1, 1),
                RecordPosition::new(2, 0),
                RecordPosition::new(2, 1)
            ]
        );
    }

    #[test]
    fn test_scan_after_stops_at_bound_and_on_break() {
        let mut log = ExecutionLog::in_memory();
        for tick in 0..4 {
            append_say(&mut log, &format!("t{tick}a"));
            append_say(&mut log, &format!("t{tick}b"));
            log.seal_tick(Utc::now()).unwrap();
        }
        let reader = log.reader();

        let mut seen = Vec::new();
        reader.scan_after(RecordPosition::new(0, 1), 2, |record| {
            seen.push(record.command.text());
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec!["t1a", "t1b", "t2a", "t2b"]);

        let mut seen = Vec::new();
        reader.scan_after(RecordPosition::new(1, 0), 3, |record| {
            seen.push(record.command.text());
            if seen.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen, vec!["t1b", "t2a"]);

        let mut visited = 0;
        reader.scan_after(RecordPosition::new(3, 0), 2, |_| {
            visited += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(visited, 0);
    }

    #[test]
    fn test_persist_and_reopen() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let digest = {
            let mut log = ExecutionLog::open(storage.clone()).unwrap();
            append_say(&mut log, "hello");
            log.seal_tick(Utc::now()).unwrap();
            log.seal_tick(Utc::now()).unwrap();
            append_say(&mut log, "buffered only");
            log.reader().head_digest()
        };

        let log = ExecutionLog::open(storage).unwrap();
        assert_eq!(log.open_tick(), 2);
        assert_eq!(log.reader().head_digest(), digest);
        assert_eq!(log.reader().read_segment(0).unwrap().records.len(), 1);
        assert!(log.reader().read_segment(1).unwrap().records.is_empty());
    }

    #[test]
    fn test_torn_header_and_orphan_segment_are_repaired() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        {
            let mut log = ExecutionLog::open(storage.clone()).unwrap();
            append_say(&mut log, "kept");
            log.seal_tick(Utc::now()).unwrap();
        }

        // Crash after the segment file landed but mid-way through its header.
        std::fs::write(storage.segment_path(1), "garbage\n").unwrap();
        storage
            .append_line(&storage.segment_index_path(), "{\"tick\":1,\"rec")
            .unwrap();

        let log = ExecutionLog::open(storage.clone()).unwrap();
        assert_eq!(log.open_tick(), 1);
        assert!(!storage.segment_path(1).exists());

        let index = std::fs::read_to_string(storage.segment_index_path()).unwrap();
        assert_eq!(index.lines().count(), 1);
    }

    #[test]
    fn test_tampered_segment_is_detected() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        {
            let mut log = ExecutionLog::open(storage.clone()).unwrap();
            append_say(&mut log, "original");
            log.seal_tick(Utc::now()).unwrap();
        }

        let path = storage.segment_path(0);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("original", "rewritten")).unwrap();

        let err = ExecutionLog::open(storage).err().unwrap();
        assert!(matches!(err, LogError::Corrupted { tick: 0, .. }));
    }
}
