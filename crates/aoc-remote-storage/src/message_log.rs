//! Per-project append-only message log.
//!
//! Messages are stored as JSON lines in segment files under the project's `logs`
//! directory. Exactly one segment is open for writing; it is sealed and replaced
//! when it reaches the byte ceiling, the message-count ceiling, or when local
//! midnight has passed since it was opened. Segment names embed their creation
//! time, so lexical order is creation order.

use crate::StorageError;
use aoc_remote_core::TimestampedMessage;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_SEGMENT_MAX_MESSAGES: usize = 10_000;

const SEGMENT_PREFIX: &str = "messages-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const SEGMENT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.6f";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub max_messages: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            max_messages: DEFAULT_SEGMENT_MAX_MESSAGES,
        }
    }
}

struct ActiveSegment {
    path: PathBuf,
    file: File,
    bytes: u64,
    messages: usize,
    rotate_at: DateTime<Local>,
}

pub struct MessageLog {
    dir: PathBuf,
    policy: RotationPolicy,
    active: Option<ActiveSegment>,
    seq: u32,
}

impl MessageLog {
    /// Creates a handle without touching the filesystem. The directory and the
    /// first segment are created by the first append.
    pub fn new(dir: impl Into<PathBuf>, policy: RotationPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            active: None,
            seq: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    pub fn append(&mut self, message: &TimestampedMessage) -> Result<(), StorageError> {
        self.append_at(message, Local::now())
    }

    /// Appends using `now` for rotation decisions.
    pub fn append_at(
        &mut self,
        message: &TimestampedMessage,
        now: DateTime<Local>,
    ) -> Result<(), StorageError> {
        if self.active.is_none() {
            let segment = self.open_segment(now)?;
            self.active = Some(segment);
        }
        if self.should_rotate(now) {
            self.rotate(now)?;
        }

        let mut line = serde_json::to_vec(message)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        line.push(b'\n');

        let Some(active) = self.active.as_mut() else {
            return Err(StorageError::Io(std::io::Error::other(
                "no active segment after open",
            )));
        };
        active.file.write_all(&line)?;
        active.file.sync_data()?;
        active.bytes += line.len() as u64;
        active.messages += 1;
        Ok(())
    }

    /// Messages with a timestamp strictly after `since`, oldest first, across
    /// every sealed segment and the open one. Unparseable lines are skipped.
    pub fn messages_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimestampedMessage>, StorageError> {
        let mut messages = Vec::new();
        for path in list_segments(&self.dir)? {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            scan_lines(BufReader::new(file), |line_num, line| {
                if is_blank(line) {
                    return;
                }
                match serde_json::from_slice::<TimestampedMessage>(line) {
                    Ok(message) if message.timestamp > since => messages.push(message),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            event = "segment_line_skipped",
                            path = %path.display(),
                            line = line_num,
                            error = %err
                        );
                    }
                }
            })?;
        }
        messages.sort_by_key(|message| message.timestamp);
        Ok(messages)
    }

    pub fn all_messages(&self) -> Result<Vec<TimestampedMessage>, StorageError> {
        self.messages_since(DateTime::<Utc>::MIN_UTC)
    }

    /// Segment files in creation order, including the open one.
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>, StorageError> {
        list_segments(&self.dir)
    }

    pub fn active_segment(&self) -> Option<&Path> {
        self.active.as_ref().map(|segment| segment.path.as_path())
    }

    pub fn active_message_count(&self) -> usize {
        self.active.as_ref().map_or(0, |segment| segment.messages)
    }

    /// Flushes and releases the open segment. An empty segment is deleted.
    pub fn close(&mut self) -> Result<(), StorageError> {
        match self.active.take() {
            Some(segment) => seal_segment(segment),
            None => Ok(()),
        }
    }

    fn should_rotate(&self, now: DateTime<Local>) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if active.messages == 0 {
            return false;
        }
        active.bytes >= self.policy.max_bytes
            || active.messages >= self.policy.max_messages
            || now >= active.rotate_at
    }

    fn rotate(&mut self, now: DateTime<Local>) -> Result<(), StorageError> {
        if let Some(previous) = self.active.take() {
            let sealed = previous.path.clone();
            let messages = previous.messages;
            let bytes = previous.bytes;
            seal_segment(previous)?;
            info!(
                event = "segment_rotated",
                dir = %self.dir.display(),
                sealed = %sealed.display(),
                messages,
                bytes
            );
        }
        let segment = self.create_segment(now)?;
        self.active = Some(segment);
        Ok(())
    }

    fn open_segment(&mut self, now: DateTime<Local>) -> Result<ActiveSegment, StorageError> {
        fs::create_dir_all(&self.dir)?;
        if let Some(resumed) = self.resume_segment(now)? {
            debug!(
                event = "segment_resumed",
                path = %resumed.path.display(),
                messages = resumed.messages,
                bytes = resumed.bytes
            );
            return Ok(resumed);
        }
        self.create_segment(now)
    }

    /// Reopens the newest segment when it was created today and still has room.
    /// A torn final line left by a crash is cut off first so the next append
    /// starts on a fresh line.
    fn resume_segment(&self, now: DateTime<Local>) -> Result<Option<ActiveSegment>, StorageError> {
        let segments = list_segments(&self.dir)?;
        let Some(latest) = segments.last() else {
            return Ok(None);
        };
        let Some(created) = segment_created_at(latest) else {
            return Ok(None);
        };
        if created.date_naive() != now.date_naive() {
            return Ok(None);
        }

        let mut messages = 0;
        let bytes = scan_lines(BufReader::new(File::open(latest)?), |_, line| {
            if !is_blank(line) {
                messages += 1;
            }
        })?;
        let on_disk = fs::metadata(latest)?.len();
        if bytes < on_disk {
            let file = OpenOptions::new().write(true).open(latest)?;
            file.set_len(bytes)?;
            file.sync_all()?;
            warn!(
                event = "segment_tail_truncated",
                path = %latest.display(),
                dropped_bytes = on_disk - bytes
            );
        }
        if bytes >= self.policy.max_bytes || messages >= self.policy.max_messages {
            return Ok(None);
        }

        let file = OpenOptions::new().append(true).open(latest)?;
        Ok(Some(ActiveSegment {
            path: latest.clone(),
            file,
            bytes,
            messages,
            rotate_at: next_local_midnight(created),
        }))
    }

    fn create_segment(&mut self, now: DateTime<Local>) -> Result<ActiveSegment, StorageError> {
        fs::create_dir_all(&self.dir)?;
        loop {
            self.seq = self.seq.wrapping_add(1);
            let name = format!(
                "{SEGMENT_PREFIX}{}-{:04}{SEGMENT_SUFFIX}",
                now.format(SEGMENT_TIME_FORMAT),
                self.seq
            );
            let path = self.dir.join(name);
            let file = match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            };
            return Ok(ActiveSegment {
                path,
                file,
                bytes: 0,
                messages: 0,
                rotate_at: next_local_midnight(now),
            });
        }
    }
}

impl Drop for MessageLog {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(event = "segment_close_error", dir = %self.dir.display(), error = %err);
        }
    }
}

fn seal_segment(segment: ActiveSegment) -> Result<(), StorageError> {
    let ActiveSegment {
        path,
        file,
        messages,
        ..
    } = segment;
    file.sync_all()?;
    drop(file);
    if messages == 0 {
        match fs::remove_file(&path) {
            Ok(()) => debug!(event = "empty_segment_removed", path = %path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX) {
            segments.push(entry.path());
        }
    }
    segments.sort();
    Ok(segments)
}

fn segment_created_at(path: &Path) -> Option<DateTime<Local>> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    let (stamp, _seq) = stem.rsplit_once('-')?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S%.f").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Feeds every line (without its newline) and its 1-based number to `visit`,
/// including an unterminated final line. Returns the offset just past the last
/// newline-terminated line.
fn scan_lines<R: BufRead>(
    mut reader: R,
    mut visit: impl FnMut(usize, &[u8]),
) -> Result<u64, StorageError> {
    let mut buf = Vec::new();
    let mut complete = 0u64;
    let mut line_num = 0;
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line_num += 1;
        match buf.strip_suffix(b"\n") {
            Some(line) => {
                complete += read as u64;
                visit(line_num, line);
            }
            None => {
                visit(line_num, &buf);
                break;
            }
        }
    }
    Ok(complete)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or_else(|| now + Duration::hours(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_remote_core::MessageDirection;
    use serde_json::json;
    use tempfile::TempDir;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, s)
            .single()
            .expect("unambiguous local time")
    }

    fn msg(at: DateTime<Local>, direction: MessageDirection, text: &str) -> TimestampedMessage {
        TimestampedMessage::at(at.with_timezone(&Utc), direction, json!({ "text": text }))
    }

    fn texts(messages: &[TimestampedMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m.message["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn no_files_until_first_append() {
        let temp = TempDir::new().expect("temp dir");
        let dir = temp.path().join("p-1").join("logs");
        let mut log = MessageLog::new(&dir, RotationPolicy::default());
        assert!(!dir.exists());
        assert!(log.all_messages().expect("read").is_empty());
        log.close().expect("close");
        assert!(!dir.exists());
    }

    #[test]
    fn history_scenario_returns_strictly_newer_in_order() {
        let temp = TempDir::new().expect("temp dir");
        let mut log = MessageLog::new(temp.path().join("logs"), RotationPolicy::default());
        let t0 = local(2026, 3, 1, 10, 0, 0);
        let t1 = local(2026, 3, 1, 10, 0, 5);
        log.append_at(&msg(t0, MessageDirection::Client, "hi"), t0)
            .expect("append hi");
        log.append_at(&msg(t1, MessageDirection::Claude, "hello"), t1)
            .expect("append hello");

        let before = (t0 - Duration::seconds(1)).with_timezone(&Utc);
        let all = log.messages_since(before).expect("since t0-1s");
        assert_eq!(texts(&all), vec!["hi", "hello"]);
        assert_eq!(all[0].direction, MessageDirection::Client);
        assert_eq!(all[1].direction, MessageDirection::Claude);

        let none = log
            .messages_since(t1.with_timezone(&Utc))
            .expect("since t1");
        assert!(none.is_empty());
    }

    #[test]
    fn rotates_on_message_count_ceiling() {
        let temp = TempDir::new().expect("temp dir");
        let policy = RotationPolicy {
            max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            max_messages: 3,
        };
        let mut log = MessageLog::new(temp.path().join("logs"), policy);
        let base = local(2026, 3, 1, 9, 0, 0);
        for i in 0..7 {
            let at = base + Duration::seconds(i);
            log.append_at(&msg(at, MessageDirection::Client, &format!("m{i}")), at)
                .expect("append");
            assert!(log.active_message_count() <= policy.max_messages);
        }

        let segments = log.segment_paths().expect("segments");
        assert_eq!(segments.len(), 3);
        assert_eq!(log.active_message_count(), 1);
        let all = log.all_messages().expect("read all");
        assert_eq!(
            texts(&all),
            vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6"]
        );
    }

    #[test]
    fn rotates_on_byte_ceiling() {
        let temp = TempDir::new().expect("temp dir");
        let policy = RotationPolicy {
            max_bytes: 120,
            max_messages: DEFAULT_SEGMENT_MAX_MESSAGES,
        };
        let mut log = MessageLog::new(temp.path().join("logs"), policy);
        let base = local(2026, 3, 1, 9, 0, 0);
        let padding = "x".repeat(80);
        for i in 0..4 {
            let at = base + Duration::seconds(i);
            log.append_at(&msg(at, MessageDirection::Claude, &padding), at)
                .expect("append");
        }
        // Each line is larger than the ceiling, so every append after the first rotates.
        assert_eq!(log.segment_paths().expect("segments").len(), 4);
        assert_eq!(log.active_message_count(), 1);
    }

    #[test]
    fn crossing_local_midnight_rotates_before_next_append() {
        let temp = TempDir::new().expect("temp dir");
        let mut log = MessageLog::new(temp.path().join("logs"), RotationPolicy::default());
        let late = local(2026, 3, 1, 23, 59, 0);
        let early = local(2026, 3, 2, 0, 0, 30);

        log.append_at(&msg(late, MessageDirection::Client, "late"), late)
            .expect("append late");
        let first = log.active_segment().expect("active").to_path_buf();
        log.append_at(&msg(early, MessageDirection::Claude, "early"), early)
            .expect("append early");
        let second = log.active_segment().expect("active").to_path_buf();

        assert_ne!(first, second);
        assert_eq!(log.segment_paths().expect("segments"), vec![first, second]);
        assert_eq!(log.active_message_count(), 1);
    }

    #[test]
    fn closing_empty_segment_leaves_no_file() {
        let temp = TempDir::new().expect("temp dir");
        let dir = temp.path().join("logs");
        let mut log = MessageLog::new(&dir, RotationPolicy::default());
        let now = local(2026, 3, 1, 12, 0, 0);
        let segment = log.create_segment(now).expect("create segment");
        log.active = Some(segment);
        assert_eq!(log.segment_paths().expect("segments").len(), 1);

        log.close().expect("close");
        assert!(log.segment_paths().expect("segments").is_empty());
    }

    #[test]
    fn reads_span_segments_and_sort_out_of_order_writes() {
        let temp = TempDir::new().expect("temp dir");
        let policy = RotationPolicy {
            max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            max_messages: 2,
        };
        let mut log = MessageLog::new(temp.path().join("logs"), policy);
        let base = local(2026, 3, 1, 8, 0, 0);
        let order = [3, 1, 4, 0, 2];
        for (i, offset) in order.iter().enumerate() {
            let stamp = base + Duration::seconds(*offset);
            let now = base + Duration::seconds(i as i64);
            log.append_at(
                &msg(stamp, MessageDirection::Claude, &format!("t{offset}")),
                now,
            )
            .expect("append");
        }
        assert_eq!(log.segment_paths().expect("segments").len(), 3);

        let since = (base + Duration::seconds(1)).with_timezone(&Utc);
        let newer = log.messages_since(since).expect("since");
        assert_eq!(texts(&newer), vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let temp = TempDir::new().expect("temp dir");
        let dir = temp.path().join("logs");
        let mut log = MessageLog::new(&dir, RotationPolicy::default());
        let now = local(2026, 3, 1, 12, 0, 0);
        log.append_at(&msg(now, MessageDirection::Client, "good"), now)
            .expect("append");
        let path = log.active_segment().expect("active").to_path_buf();
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            file.write_all(b"{\"timestamp\": broken\n\n").expect("write garbage");
        }
        let later = now + Duration::seconds(1);
        log.append_at(&msg(later, MessageDirection::Claude, "after"), later)
            .expect("append after");

        let all = log.all_messages().expect("read");
        assert_eq!(texts(&all), vec!["good", "after"]);
    }

    #[test]
    fn invalid_utf8_line_does_not_hide_later_lines() {
        let temp = TempDir::new().expect("temp dir");
        let mut log = MessageLog::new(temp.path().join("logs"), RotationPolicy::default());
        let now = local(2026, 3, 1, 12, 0, 0);
        log.append_at(&msg(now, MessageDirection::Client, "before"), now)
            .expect("append before");
        let path = log.active_segment().expect("active").to_path_buf();
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            file.write_all(b"\xff\xfe garbage\n").expect("write bytes");
        }
        let later = now + Duration::seconds(1);
        log.append_at(&msg(later, MessageDirection::Claude, "after"), later)
            .expect("append after");

        assert_eq!(texts(&log.all_messages().expect("read")), vec!["before", "after"]);
    }

    #[test]
    fn torn_tail_is_cut_before_resuming() {
        let temp = TempDir::new().expect("temp dir");
        let dir = temp.path().join("logs");
        let morning = local(2026, 3, 1, 9, 0, 0);
        let noon = local(2026, 3, 1, 12, 0, 0);
        let path = {
            let mut log = MessageLog::new(&dir, RotationPolicy::default());
            log.append_at(&msg(morning, MessageDirection::Client, "first"), morning)
                .expect("append first");
            log.active_segment().expect("active").to_path_buf()
        };
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open");
            file.write_all(b"{\"timestamp\":\"2026-03-01T").expect("torn write");
        }

        let mut log = MessageLog::new(&dir, RotationPolicy::default());
        log.append_at(&msg(noon, MessageDirection::Claude, "after_restart"), noon)
            .expect("append after restart");
        assert_eq!(log.active_segment(), Some(path.as_path()));
        assert_eq!(log.active_message_count(), 2);
        assert_eq!(
            texts(&log.all_messages().expect("read")),
            vec!["first", "after_restart"]
        );
        let content = fs::read(&path).expect("read segment");
        assert_eq!(content.iter().filter(|byte| **byte == b'\n').count(), 2);
    }

    #[test]
    fn reopened_log_resumes_same_day_segment() {
        let temp = TempDir::new().expect("temp dir");
        let dir = temp.path().join("logs");
        let morning = local(2026, 3, 1, 9, 0, 0);
        let noon = local(2026, 3, 1, 12, 0, 0);
        let next_day = local(2026, 3, 2, 9, 0, 0);

        {
            let mut log = MessageLog::new(&dir, RotationPolicy::default());
            log.append_at(&msg(morning, MessageDirection::Client, "a"), morning)
                .expect("append a");
        }
        {
            let mut log = MessageLog::new(&dir, RotationPolicy::default());
            log.append_at(&msg(noon, MessageDirection::Claude, "b"), noon)
                .expect("append b");
            assert_eq!(log.active_message_count(), 2);
            assert_eq!(log.segment_paths().expect("segments").len(), 1);
        }
        let mut log = MessageLog::new(&dir, RotationPolicy::default());
        log.append_at(&msg(next_day, MessageDirection::Client, "c"), next_day)
            .expect("append c");
        assert_eq!(log.active_message_count(), 1);
        assert_eq!(log.segment_paths().expect("segments").len(), 2);
        assert_eq!(texts(&log.all_messages().expect("read")), vec!["a", "b", "c"]);
    }

    #[test]
    fn segment_names_parse_back_to_creation_time() {
        let created = local(2026, 3, 1, 7, 30, 15);
        let path = PathBuf::from(format!(
            "{SEGMENT_PREFIX}{}-0007{SEGMENT_SUFFIX}",
            created.format(SEGMENT_TIME_FORMAT)
        ));
        assert_eq!(segment_created_at(&path), Some(created));
        assert_eq!(
            next_local_midnight(created),
            local(2026, 3, 2, 0, 0, 0)
        );
    }
}
