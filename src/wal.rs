use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read `buf.len()` bytes. `Ok(false)` on a clean or truncated end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry. `Ok(None)` ends replay: end of file, a torn write,
/// a CRC mismatch or an undecodable payload.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        tracing::warn!("WAL entry failed CRC check, stopping replay");
        return Ok(None);
    }

    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only Write-Ahead Log, one per store.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated last entry (crash mid-write) is discarded on replay.
///
/// Appends are staged in memory until `flush_sync`. A failed batch is dropped
/// with `discard_pending`, which also cuts the file back to its last synced length.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_appends: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Set when a truncate after a failed batch did not go through.
    dirty_tail: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_appends: 0,
            synced_len,
            dirty_tail: false,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// Append and fsync a single event. Production code batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event without writing it. Call `flush_sync()` after the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mark = self.pending.len();
        if let Err(e) = encode_event(&mut self.pending, event) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Write the staged batch and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.dirty_tail {
            self.truncate_to_synced()?;
        }
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            // Half the batch reaches the file before the device gives up.
            let half = self.pending.len() / 2;
            self.file.write_all(&self.pending[..half])?;
            return Err(io::Error::other("injected WAL flush failure"));
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()?;
        self.synced_len += self.pending.len() as u64;
        self.pending.clear();
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop the staged batch and remove any part of it that reached the file.
    /// If the truncate fails it is retried before the next write.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.appends_since_compact -= self.pending_appends;
        self.pending_appends = 0;
        self.truncate_to_synced()
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        self.dirty_tail = true;
        self.file.set_len(self.synced_len)?;
        self.file.sync_all()?;
        self.dirty_tail = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_appends = 0;
        self.dirty_tail = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning every valid event up to the first
    /// damaged one. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_next(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChairKey, Span};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("strandkorb_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn location(id: u32) -> Event {
        Event::LocationCreated { id, name: format!("Strand {id}") }
    }

    fn reservation(id: u64) -> Event {
        Event::ReservationCreated {
            id,
            user_id: 17,
            key: ChairKey::new(1, 5),
            span: Span::new(1000, 2000),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let events = vec![location(1), reservation(1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&location(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![location(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&reservation(3)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&location(1)).unwrap();
        for i in 0..20u32 {
            wal.append(&Event::UsageRecorded {
                key: ChairKey::new(1, 5),
                reservation_id: 1,
                hours: f64::from(i),
            })
            .unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&[location(1)]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        wal.append(&reservation(4)).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![location(1), reservation(4)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_visible_after_flush() {
        let path = tmp_path("buffered.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (1..=5).map(reservation).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discarded_batch_leaves_no_trace() {
        let path = tmp_path("discard.wal");
        let _ = fs::remove_file(&path);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&location(1)).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&reservation(7)).unwrap();
        wal.fail_next_flush();
        assert!(wal.flush_sync().is_err());
        assert!(fs::metadata(&path).unwrap().len() > synced);

        wal.discard_pending().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&reservation(8)).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![location(1), reservation(8)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_continues_after_existing_entries() {
        let path = tmp_path("reopen.wal");
        let _ = fs::remove_file(&path);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&location(1)).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&reservation(2)).unwrap();
        wal.discard_pending().unwrap();
        wal.append(&reservation(3)).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![location(1), reservation(3)]);
        let _ = fs::remove_file(&path);
    }
}
