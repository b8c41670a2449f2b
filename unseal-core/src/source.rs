use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use crate::{DecryptError, InputSource};

/// Upper bound on how much of the stream a probe may pull into the replay
/// buffer. Covers the encrypted-session-key packet run at the head of any
/// realistic message; exceeding it means the input is not one we can handle.
pub const PROBE_WINDOW_LIMIT: usize = 64 * 1024;

type BoxedReader = Box<dyn Read + Send + Sync>;

enum Origin {
    Bytes(Vec<u8>),
    File(PathBuf),
    Stream,
}

/// An opened input with peek-then-replay semantics.
///
/// Detection reads through [`OpenedSource::probe`], which records every byte
/// pulled from the underlying stream. Probing may be repeated; each probe
/// starts over at the front of the recorded bytes. [`OpenedSource::into_reader`]
/// re-prepends the record, so the executor sees the stream byte-for-byte as it
/// originally was. Bytes consumed while probing are never lost.
pub struct OpenedSource {
    buffered: Vec<u8>,
    inner: BoxedReader,
    origin: Origin,
}

impl OpenedSource {
    /// Opens the input, failing with `NotFound` if a path does not resolve to
    /// a regular file and `StorageUnavailable` if the medium refuses access.
    pub fn open(source: InputSource) -> Result<Self, DecryptError> {
        match source {
            InputSource::Bytes(bytes) => Ok(OpenedSource {
                buffered: Vec::new(),
                inner: Box::new(Cursor::new(bytes.clone())),
                origin: Origin::Bytes(bytes),
            }),
            InputSource::FilePath(path) => {
                let file = open_regular_file(&path)?;
                Ok(OpenedSource {
                    buffered: Vec::new(),
                    inner: Box::new(file),
                    origin: Origin::File(path),
                })
            }
            InputSource::Reader(reader) => Ok(OpenedSource {
                buffered: Vec::new(),
                inner: reader,
                origin: Origin::Stream,
            }),
        }
    }

    /// Starts (or restarts) a bounded lookahead over the stream head.
    pub fn probe(&mut self) -> Probe<'_> {
        Probe { source: self, pos: 0 }
    }

    /// Hands the stream to the executor: the recorded probe window followed by
    /// the untouched remainder.
    pub fn into_reader(self) -> SourceReader {
        SourceReader {
            inner: Cursor::new(self.buffered).chain(self.inner),
        }
    }

    /// Whether the input can be opened again for a retry with a new
    /// credential. Opaque host streams cannot.
    pub fn reopenable(&self) -> bool {
        !matches!(self.origin, Origin::Stream)
    }

    /// Reopens the input from its origin, discarding probe state.
    pub fn reopen(&self) -> Result<OpenedSource, DecryptError> {
        match &self.origin {
            Origin::Bytes(bytes) => OpenedSource::open(InputSource::Bytes(bytes.clone())),
            Origin::File(path) => OpenedSource::open(InputSource::FilePath(path.clone())),
            Origin::Stream => Err(DecryptError::Internal(
                "stream source cannot be reopened".to_string(),
            )),
        }
    }

    /// The originating file path, if the input came from one.
    pub fn origin_path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::File(path) => Some(path),
            _ => None,
        }
    }
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let origin = match &self.origin {
            Origin::Bytes(bytes) => format!("bytes({})", bytes.len()),
            Origin::File(path) => format!("file({})", path.display()),
            Origin::Stream => "stream".to_string(),
        };
        f.debug_struct("OpenedSource")
            .field("origin", &origin)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

fn open_regular_file(path: &Path) -> Result<fs::File, DecryptError> {
    let meta = fs::metadata(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => DecryptError::NotFound(path.display().to_string()),
        _ => DecryptError::StorageUnavailable(format!("{}: {err}", path.display())),
    })?;
    if !meta.is_file() {
        return Err(DecryptError::NotFound(format!(
            "{}: not a regular file",
            path.display()
        )));
    }
    fs::File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => DecryptError::NotFound(path.display().to_string()),
        _ => DecryptError::StorageUnavailable(format!("{}: {err}", path.display())),
    })
}

/// A recording reader over the head of an [`OpenedSource`].
pub struct Probe<'a> {
    source: &'a mut OpenedSource,
    pos: usize,
}

impl Read for Probe<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Serve from the record first, then pull more from the stream.
        if self.pos < self.source.buffered.len() {
            let available = &self.source.buffered[self.pos..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.pos += n;
            return Ok(n);
        }
        if self.source.buffered.len() >= PROBE_WINDOW_LIMIT {
            return Err(io::Error::other("probe window exhausted"));
        }
        let room = PROBE_WINDOW_LIMIT - self.source.buffered.len();
        let want = buf.len().min(room);
        let n = self.source.inner.read(&mut buf[..want])?;
        self.source.buffered.extend_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// The replayed stream handed to the executor.
pub struct SourceReader {
    inner: io::Chain<Cursor<Vec<u8>>, BoxedReader>,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(mut reader: impl Read) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).expect("read");
        out
    }

    #[test]
    fn probe_then_replay_is_lossless() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let mut opened =
            OpenedSource::open(InputSource::Reader(Box::new(Cursor::new(payload.clone()))))
                .expect("open");

        let mut head = [0u8; 100];
        opened.probe().read_exact(&mut head).expect("probe");
        assert_eq!(&head[..], &payload[..100]);

        assert_eq!(read_all(opened.into_reader()), payload);
    }

    #[test]
    fn repeated_probes_rewind_to_start() {
        let payload = b"0123456789abcdef".to_vec();
        let mut opened = OpenedSource::open(InputSource::Bytes(payload.clone())).expect("open");

        let mut first = [0u8; 8];
        opened.probe().read_exact(&mut first).expect("first probe");
        let mut second = [0u8; 12];
        opened.probe().read_exact(&mut second).expect("second probe");

        assert_eq!(&first[..], &payload[..8]);
        assert_eq!(&second[..], &payload[..12]);
        assert_eq!(read_all(opened.into_reader()), payload);
    }

    #[test]
    fn probe_window_is_bounded() {
        let payload = vec![0x55u8; PROBE_WINDOW_LIMIT + 1024];
        let mut opened = OpenedSource::open(InputSource::Bytes(payload.clone())).expect("open");

        let mut sink = Vec::new();
        let err = opened.probe().read_to_end(&mut sink).expect_err("bounded");
        assert_eq!(err.to_string(), "probe window exhausted");

        // The executor still sees the whole stream.
        assert_eq!(read_all(opened.into_reader()), payload);
    }

    #[test]
    fn file_source_opens_and_replays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.pgp");
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(b"file payload").expect("write");
        drop(file);

        let mut opened = OpenedSource::open(InputSource::FilePath(path.clone())).expect("open");
        let mut head = [0u8; 4];
        opened.probe().read_exact(&mut head).expect("probe");
        assert_eq!(&head[..], b"file");
        assert_eq!(opened.origin_path(), Some(path.as_path()));
        assert_eq!(read_all(opened.into_reader()), b"file payload");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = OpenedSource::open(InputSource::FilePath(dir.path().join("absent.pgp")))
            .expect_err("missing");
        assert!(matches!(err, DecryptError::NotFound(_)));
    }

    #[test]
    fn directory_is_not_a_regular_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = OpenedSource::open(InputSource::FilePath(dir.path().to_path_buf()))
            .expect_err("directory");
        assert!(matches!(err, DecryptError::NotFound(_)));
    }

    #[test]
    fn reopen_restores_a_fresh_stream() {
        let payload = b"reopen me".to_vec();
        let mut opened = OpenedSource::open(InputSource::Bytes(payload.clone())).expect("open");
        let mut head = [0u8; 6];
        opened.probe().read_exact(&mut head).expect("probe");

        let reopened = opened.reopen().expect("reopen");
        assert_eq!(read_all(reopened.into_reader()), payload);

        let stream =
            OpenedSource::open(InputSource::Reader(Box::new(Cursor::new(payload)))).expect("open");
        assert!(!stream.reopenable());
        assert!(stream.reopen().is_err());
    }
}
