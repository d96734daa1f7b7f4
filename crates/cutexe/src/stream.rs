//! Output capture, stream combining and line splitting

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

/// Read size for child output pipes
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Bytes a tape holds before the capture stops reading from the child
pub const TAPE_HIGH_WATER: usize = 256 * 1024;

/// A chunk of raw output bytes
pub type Chunk = Vec<u8>;

#[derive(Debug, Default)]
struct TapeState {
    chunks: VecDeque<Chunk>,
    /// Sequence number of `chunks[0]`
    base: u64,
    retained: usize,
    finished: bool,
    /// Next sequence number for each attached reader
    cursors: HashMap<u64, u64>,
    next_reader: u64,
}

impl TapeState {
    fn end(&self) -> u64 {
        self.base + self.chunks.len() as u64
    }

    /// Drop chunks every attached reader has consumed. Returns whether any
    /// were dropped.
    fn release(&mut self) -> bool {
        let Some(floor) = self.cursors.values().min().copied() else {
            return false;
        };
        let mut released = false;
        while self.base < floor {
            let Some(chunk) = self.chunks.pop_front() else {
                break;
            };
            self.retained -= chunk.len();
            self.base += 1;
            released = true;
        }
        released
    }
}

/// Bounded capture of one output stream, shared by several readers.
///
/// Each reader gets every chunk still held when it attaches, then advances
/// independently. A chunk is dropped once all attached readers have consumed
/// it; with no reader attached, chunks are held until one arrives. The
/// producer waits while more than [`TAPE_HIGH_WATER`] bytes are held, which
/// propagates backpressure to the child.
#[derive(Debug, Clone)]
pub struct OutputTape {
    state: Arc<watch::Sender<TapeState>>,
}

impl OutputTape {
    /// Create an empty, open tape
    pub fn new() -> Self {
        let (state, _) = watch::channel(TapeState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// A tape that is already finished and empty
    pub fn closed() -> Self {
        let tape = Self::new();
        tape.finish();
        tape
    }

    /// Append a chunk. Ignored once the tape is finished.
    pub fn push(&self, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        self.state.send_if_modified(move |state| {
            if state.finished {
                return false;
            }
            state.retained += chunk.len();
            state.chunks.push_back(chunk);
            true
        });
    }

    /// Wait until the tape holds less than [`TAPE_HIGH_WATER`] bytes
    pub async fn reserve(&self) {
        let mut rx = self.state.subscribe();
        // only errors if the sender is dropped, and `self` owns it
        let _ = rx
            .wait_for(|state| state.finished || state.retained < TAPE_HIGH_WATER)
            .await;
    }

    /// Mark end-of-stream
    pub fn finish(&self) {
        self.state.send_if_modified(|state| {
            if state.finished {
                return false;
            }
            state.finished = true;
            true
        });
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Bytes currently held
    pub fn retained(&self) -> usize {
        self.state.borrow().retained
    }

    /// Attach a reader now and stream chunks until the tape is finished.
    ///
    /// The reader holds its place from this call on, even before the stream
    /// is first polled. Dropping the stream detaches it.
    pub fn reader(&self) -> impl Stream<Item = Chunk> + Send + 'static {
        let mut cursor = TapeCursor::attach(self.clone());
        async_stream::stream! {
            while let Some(chunk) = cursor.next_chunk().await {
                yield chunk;
            }
        }
    }

    /// Wait for end-of-stream and return all bytes still unread
    pub async fn drain(&self) -> Vec<u8> {
        self.reader().concat().await
    }
}

impl Default for OutputTape {
    fn default() -> Self {
        Self::new()
    }
}

struct TapeCursor {
    tape: OutputTape,
    id: u64,
}

impl TapeCursor {
    fn attach(tape: OutputTape) -> Self {
        let mut id = 0;
        tape.state.send_modify(|state| {
            id = state.next_reader;
            state.next_reader += 1;
            let base = state.base;
            state.cursors.insert(id, base);
        });
        Self { tape, id }
    }

    async fn next_chunk(&mut self) -> Option<Chunk> {
        let mut rx = self.tape.state.subscribe();
        loop {
            let _ = rx.borrow_and_update();

            let mut next = None;
            let mut finished = false;
            let id = self.id;
            self.tape.state.send_if_modified(|state| {
                let Some(pos) = state.cursors.get(&id).copied() else {
                    finished = true;
                    return false;
                };
                if pos >= state.end() {
                    finished = state.finished;
                    return false;
                }
                next = state.chunks.get((pos - state.base) as usize).cloned();
                state.cursors.insert(id, pos + 1);
                // wake the producer only when space was freed
                state.release()
            });

            if next.is_some() {
                return next;
            }
            if finished || rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl Drop for TapeCursor {
    fn drop(&mut self) {
        let id = self.id;
        self.tape.state.send_if_modified(|state| {
            state.cursors.remove(&id);
            state.release()
        });
    }
}

/// Copy `reader` into `tape` until EOF, pausing while the tape is full.
///
/// The tape is not finished here so the caller can record a read error first.
pub(crate) async fn record<R>(mut reader: R, tape: &OutputTape) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        tape.reserve().await;
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tape.push(buf[..n].to_vec());
    }
}

/// Merge several streams into one.
///
/// Items are forwarded in the order they become ready; each source keeps its
/// own order, and the merged stream ends once every source has ended.
pub fn combine_streams<S, T>(sources: Vec<S>) -> impl Stream<Item = T> + Send + 'static
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    stream::select_all(sources.into_iter().map(StreamExt::boxed))
}

/// Split a byte stream into text lines.
///
/// Splits on `\n`, drops a trailing `\r`, decodes lossily and emits a final
/// unterminated line when the source ends.
pub fn split_lines<S>(source: S) -> impl Stream<Item = String> + Send + 'static
where
    S: Stream<Item = Chunk> + Send + 'static,
{
    async_stream::stream! {
        let mut source = Box::pin(source);
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = source.next().await {
            pending.extend_from_slice(&chunk);

            let mut start = 0;
            while let Some(offset) = pending[start..].iter().position(|b| *b == b'\n') {
                let end = start + offset;
                let line = decode_line(&pending[start..end]);
                start = end + 1;
                yield line;
            }
            pending.drain(..start);
        }

        if !pending.is_empty() {
            yield decode_line(&pending);
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Chunk> + Send + 'static {
        let owned: Vec<Chunk> = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
        stream::iter(owned)
    }

    async fn lines_of(parts: &[&str]) -> Vec<String> {
        split_lines(chunks(parts)).collect().await
    }

    #[tokio::test]
    async fn test_split_lines_basic() {
        assert_eq!(lines_of(&["foo\nbar\n"]).await, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn test_split_lines_final_partial_line() {
        assert_eq!(lines_of(&["foo\nba", "r"]).await, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn test_split_lines_across_chunks_and_crlf() {
        assert_eq!(
            lines_of(&["fo", "o\r", "\nbar\r\n", "\n"]).await,
            vec!["foo", "bar", ""]
        );
    }

    #[tokio::test]
    async fn test_split_lines_empty_source() {
        assert!(lines_of(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_combine_single_stream() {
        let combined: Vec<Chunk> = combine_streams(vec![chunks(&["foo", "bar"])])
            .collect()
            .await;
        assert_eq!(combined, vec![b"foo".to_vec(), b"bar".to_vec()]);
    }

    #[tokio::test]
    async fn test_combine_preserves_per_source_order() {
        let first = stream::iter(vec![("a", 0), ("a", 1), ("a", 2)]);
        let second = stream::iter(vec![("b", 0), ("b", 1)]);
        let combined: Vec<(&str, i32)> = combine_streams(vec![first, second]).collect().await;

        assert_eq!(combined.len(), 5);
        for source in ["a", "b"] {
            let order: Vec<i32> = combined
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, n)| *n)
                .collect();
            assert!(order.windows(2).all(|w| w[0] < w[1]), "{source}: {order:?}");
        }
    }

    #[tokio::test]
    async fn test_tape_readers_are_independent() {
        let tape = OutputTape::new();
        tape.push(b"foo".to_vec());

        let first = tape.reader();
        let second = tape.reader();
        tape.push(b"bar".to_vec());
        tape.push(Vec::new());
        tape.finish();
        tape.push(b"ignored".to_vec());

        let expected = vec![b"foo".to_vec(), b"bar".to_vec()];
        assert_eq!(first.collect::<Vec<_>>().await, expected);
        assert_eq!(second.collect::<Vec<_>>().await, expected);
    }

    #[tokio::test]
    async fn test_tape_holds_chunks_until_a_reader_attaches() {
        let tape = OutputTape::new();
        tape.push(b"early".to_vec());
        tape.finish();

        assert_eq!(tape.retained(), 5);
        assert_eq!(tape.drain().await, b"early".to_vec());
        assert_eq!(tape.retained(), 0);
        assert!(tape.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_tape_releases_chunks_read_by_every_reader() {
        let tape = OutputTape::new();
        let fast = tape.reader();
        let slow = tape.reader();
        tape.push(b"one".to_vec());
        tape.push(b"two".to_vec());
        tape.finish();

        let fast: Vec<Chunk> = fast.collect().await;
        assert_eq!(fast.len(), 2);
        assert_eq!(tape.retained(), 6);

        let mut slow = Box::pin(slow);
        assert_eq!(slow.next().await, Some(b"one".to_vec()));
        assert_eq!(tape.retained(), 3);
        drop(slow);
        assert_eq!(tape.retained(), 3);
        assert_eq!(tape.drain().await, b"two".to_vec());
    }

    #[tokio::test]
    async fn test_record_pauses_when_tape_is_full() {
        let tape = OutputTape::new();
        let (mut writer, reader) = tokio::io::duplex(READ_CHUNK_SIZE);
        let recording = {
            let tape = tape.clone();
            tokio::spawn(async move { record(reader, &tape).await })
        };
        let producing = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let block = vec![b'y'; 4096];
            for _ in 0..(4 * TAPE_HIGH_WATER / block.len()) {
                writer.write_all(&block).await.unwrap();
            }
        });

        while tape.retained() < TAPE_HIGH_WATER {
            tokio::task::yield_now().await;
        }
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(tape.retained() < TAPE_HIGH_WATER + READ_CHUNK_SIZE);
        assert!(!producing.is_finished());

        let total = {
            let tape = tape.clone();
            tokio::spawn(async move { tape.drain().await })
        };
        producing.await.unwrap();
        recording.await.unwrap().unwrap();
        tape.finish();
        assert_eq!(total.await.unwrap().len(), 4 * TAPE_HIGH_WATER);
        assert_eq!(tape.retained(), 0);
    }

    #[tokio::test]
    async fn test_record_copies_until_eof() {
        let tape = OutputTape::new();
        record(&b"hello\nworld"[..], &tape).await.unwrap();
        assert!(!tape.is_finished());
        tape.finish();
        assert_eq!(tape.drain().await, b"hello\nworld".to_vec());
    }

    #[tokio::test]
    async fn test_closed_tape_is_empty() {
        let tape = OutputTape::closed();
        assert!(tape.is_finished());
        assert!(tape.drain().await.is_empty());
    }
}
