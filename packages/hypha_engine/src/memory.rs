//! In-process reference engine: an append-only multiwriter log.
//!
//! Stands in for the external replication engine so the relay, the CLI, and
//! the tests can run without linking one. Entries are signed by their
//! writer; authorisation travels in-band as grant entries appended by an
//! already-authorised writer, so replicas learn new writers the same way
//! they learn data.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hypha_identity::{PublicKey, SigningKey};

use crate::framing::{Frame, read_frame, write_frame};
use crate::{
    Engine, EngineError, EngineHandle, ExtensionLane, LogEntry, ReplicationStream, StreamOptions,
    EPHEMERAL_EXTENSION,
};

/// Buffer size of the internal duplex pipe backing each stream.
const STREAM_PIPE_BYTES: usize = 64 * 1024;

/// Capacity of each extension-lane direction.
const EXTENSION_LANE_CAPACITY: usize = 64;

/// Capacity of the live fan-out and watcher channels.
const FANOUT_CAPACITY: usize = 1024;

/// Entry value shape that authorises a new writer.
const GRANT_TYPE: &str = "grant";

pub struct MemoryEngine;

impl MemoryEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    type Handle = MemoryHandle;

    fn open_session(
        &self,
        read_key: PublicKey,
        write_key: Option<SigningKey>,
    ) -> Result<Arc<MemoryHandle>, EngineError> {
        if let Some(wk) = &write_key {
            if wk.public_key() != read_key {
                return Err(EngineError::SessionCreation(
                    "write key does not match read key".into(),
                ));
            }
        }
        Ok(Arc::new(MemoryHandle::new(read_key, write_key)))
    }
}

/// One entry fanned out to open streams, tagged with the stream it arrived
/// on so that stream does not echo it back.
#[derive(Clone, Debug)]
struct LiveEntry {
    entry: LogEntry,
    source: Option<u64>,
}

struct LogState {
    authorised: HashSet<PublicKey>,
    next_seq: HashMap<PublicKey, u64>,
    seen: HashSet<(PublicKey, u64)>,
    entries: Vec<LogEntry>,
}

struct Inner {
    read_key: PublicKey,
    write_key: Option<SigningKey>,
    state: Mutex<LogState>,
    live_tx: broadcast::Sender<LiveEntry>,
    watch_tx: broadcast::Sender<LogEntry>,
    ready_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    next_stream_id: AtomicU64,
}

pub struct MemoryHandle {
    inner: Arc<Inner>,
}

impl MemoryHandle {
    fn new(read_key: PublicKey, write_key: Option<SigningKey>) -> Self {
        let mut authorised = HashSet::new();
        authorised.insert(read_key);

        let (live_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let (watch_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        // The in-memory log has nothing to load, so it is ready at once.
        let (ready_tx, _) = watch::channel(true);

        Self {
            inner: Arc::new(Inner {
                read_key,
                write_key,
                state: Mutex::new(LogState {
                    authorised,
                    next_seq: HashMap::new(),
                    seen: HashSet::new(),
                    entries: Vec::new(),
                }),
                live_tx,
                watch_tx,
                ready_tx,
                cancel: CancellationToken::new(),
                next_stream_id: AtomicU64::new(1),
            }),
        }
    }

    /// Append a value signed by this handle's write key.
    pub fn append(&self, value: serde_json::Value) -> Result<LogEntry, EngineError> {
        let write_key = self
            .inner
            .write_key
            .clone()
            .ok_or(EngineError::NotWritable)?;
        self.append_as(&write_key, value)
    }

    /// Append a value signed by an arbitrary writer key (a granted device's
    /// local key). The writer must already be authorised.
    pub fn append_as(
        &self,
        signer: &SigningKey,
        value: serde_json::Value,
    ) -> Result<LogEntry, EngineError> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }
        let writer = signer.public_key();

        let entry = {
            let mut state = self.inner.state.lock().expect("log state poisoned");
            if !state.authorised.contains(&writer) {
                return Err(EngineError::NotAuthorised(writer));
            }
            let seq = *state.next_seq.get(&writer).unwrap_or(&0);
            let signature = signer.sign(&LogEntry::signing_bytes(&writer, seq, &value));
            let entry = LogEntry {
                writer,
                seq,
                value,
                signature,
            };
            state.seen.insert((writer, seq));
            state.next_seq.insert(writer, seq + 1);
            if let Some(grantee) = grant_target(&entry.value) {
                state.authorised.insert(grantee);
            }
            state.entries.push(entry.clone());
            entry
        };

        let _ = self.inner.live_tx.send(LiveEntry {
            entry: entry.clone(),
            source: None,
        });
        let _ = self.inner.watch_tx.send(entry.clone());
        Ok(entry)
    }

    /// Subscribe to entries as they are applied, local and remote alike.
    pub fn watch(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.watch_tx.subscribe()
    }

    /// Snapshot of the log contents.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.state.lock().expect("log state poisoned").entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("log state poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_authorised(&self, writer: &PublicKey) -> bool {
        self.inner
            .state
            .lock()
            .expect("log state poisoned")
            .authorised
            .contains(writer)
    }
}

impl EngineHandle for MemoryHandle {
    fn read_key(&self) -> PublicKey {
        self.inner.read_key
    }

    fn is_writable(&self) -> bool {
        self.inner.write_key.is_some()
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    fn replicate(&self, options: StreamOptions) -> Result<ReplicationStream, EngineError> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }

        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (caller_io, engine_io) = tokio::io::duplex(STREAM_PIPE_BYTES);

        let (extensions, ext_out_rx, ext_in_tx) = if options.has_extension(EPHEMERAL_EXTENSION) {
            let (out_tx, out_rx) = mpsc::channel(EXTENSION_LANE_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(EXTENSION_LANE_CAPACITY);
            (
                Some(ExtensionLane {
                    tx: out_tx,
                    rx: in_rx,
                }),
                Some(out_rx),
                Some(in_tx),
            )
        } else {
            (None, None, None)
        };

        let inner = self.inner.clone();
        tokio::spawn(stream_task(
            inner, stream_id, engine_io, options, ext_out_rx, ext_in_tx,
        ));

        Ok(ReplicationStream {
            io: Box::new(caller_io),
            extensions,
        })
    }

    fn grant_writer(&self, writer: PublicKey) -> Result<(), EngineError> {
        if self.is_authorised(&writer) {
            return Ok(());
        }
        self.append(serde_json::json!({
            "type": GRANT_TYPE,
            "writer": writer.to_hex(),
        }))?;
        Ok(())
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        let _ = self.inner.ready_tx.send(false);
    }
}

/// Apply an entry received from a peer. Duplicates and entries from
/// unauthorised or forged writers are dropped without killing the stream.
fn apply_remote(inner: &Inner, entry: LogEntry, source: u64) {
    if entry.verify().is_err() {
        warn!(
            writer = %entry.writer.fingerprint(),
            seq = entry.seq,
            "dropping entry with bad signature"
        );
        return;
    }

    {
        let mut state = inner.state.lock().expect("log state poisoned");
        if state.seen.contains(&(entry.writer, entry.seq)) {
            return;
        }
        if !state.authorised.contains(&entry.writer) {
            // TODO: buffer entries from not-yet-authorised writers until the
            // grant entry arrives, instead of relying on delivery order.
            warn!(
                writer = %entry.writer.fingerprint(),
                "dropping entry from unauthorised writer"
            );
            return;
        }
        state.seen.insert((entry.writer, entry.seq));
        let next = state.next_seq.get(&entry.writer).copied().unwrap_or(0);
        state.next_seq.insert(entry.writer, next.max(entry.seq + 1));
        if let Some(grantee) = grant_target(&entry.value) {
            state.authorised.insert(grantee);
        }
        state.entries.push(entry.clone());
    }

    let _ = inner.live_tx.send(LiveEntry {
        entry: entry.clone(),
        source: Some(source),
    });
    let _ = inner.watch_tx.send(entry);
}

fn grant_target(value: &serde_json::Value) -> Option<PublicKey> {
    if value.get("type")?.as_str()? != GRANT_TYPE {
        return None;
    }
    PublicKey::from_hex(value.get("writer")?.as_str()?).ok()
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Engine side of one replication stream: a write half (snapshot, then live
/// entries and outbound extension payloads) and a read half (inbound
/// frames), torn down together when either ends or the handle closes.
///
/// The halves are separate tasks because `read_frame` spans several awaits
/// and must not share a select loop with the writers.
async fn stream_task(
    inner: Arc<Inner>,
    stream_id: u64,
    io: tokio::io::DuplexStream,
    options: StreamOptions,
    ext_out_rx: Option<mpsc::Receiver<Vec<u8>>>,
    ext_in_tx: Option<mpsc::Sender<Vec<u8>>>,
) {
    let (rd, wr) = tokio::io::split(io);

    let mut write_handle = tokio::spawn(write_loop(
        inner.clone(),
        stream_id,
        wr,
        options,
        ext_out_rx,
    ));
    let mut read_handle = tokio::spawn(read_loop(inner.clone(), stream_id, rd, ext_in_tx));

    tokio::select! {
        _ = inner.cancel.cancelled() => {}
        _ = &mut write_handle => {}
        _ = &mut read_handle => {}
    }
    write_handle.abort();
    read_handle.abort();
}

async fn write_loop(
    inner: Arc<Inner>,
    stream_id: u64,
    mut wr: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    options: StreamOptions,
    mut ext_out_rx: Option<mpsc::Receiver<Vec<u8>>>,
) {
    // Subscribe before snapshotting so nothing falls in the gap; the remote
    // deduplicates by (writer, seq) if an entry shows up in both.
    let mut live_rx = inner.live_tx.subscribe();
    let snapshot = inner.state.lock().expect("log state poisoned").entries.clone();
    for entry in snapshot {
        if write_frame(&mut wr, &Frame::Entry(entry)).await.is_err() {
            return;
        }
    }
    if !options.live {
        let _ = wr.shutdown().await;
        return;
    }

    loop {
        tokio::select! {
            live = live_rx.recv() => match live {
                Ok(live) => {
                    if live.source != Some(stream_id)
                        && write_frame(&mut wr, &Frame::Entry(live.entry)).await.is_err()
                    {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(stream_id, lagged = n, "replication stream lagged behind log fan-out");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },

            payload = recv_opt(&mut ext_out_rx) => match payload {
                Some(payload) => {
                    if write_frame(&mut wr, &Frame::Extension(payload)).await.is_err() {
                        return;
                    }
                }
                // Extension sender dropped; stop polling the lane.
                None => ext_out_rx = None,
            },
        }
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    stream_id: u64,
    mut rd: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    ext_in_tx: Option<mpsc::Sender<Vec<u8>>>,
) {
    loop {
        match read_frame(&mut rd).await {
            Ok(Some(Frame::Entry(entry))) => apply_remote(&inner, entry, stream_id),
            Ok(Some(Frame::Extension(payload))) => {
                if let Some(tx) = &ext_in_tx {
                    // Bounded: a slow consumer suspends this stream.
                    if tx.send(payload).await.is_err() {
                        debug!(stream_id, "extension receiver dropped, discarding payload");
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(stream_id, error = %e, "replication stream ended");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn origin_pair() -> (PublicKey, SigningKey) {
        let sk = SigningKey::from_bytes([1u8; 32]);
        (sk.public_key(), sk)
    }

    fn open_writable() -> Arc<MemoryHandle> {
        let (read_key, write_key) = origin_pair();
        MemoryEngine::new()
            .open_session(read_key, Some(write_key))
            .unwrap()
    }

    fn open_replica() -> Arc<MemoryHandle> {
        let (read_key, _) = origin_pair();
        MemoryEngine::new().open_session(read_key, None).unwrap()
    }

    /// Splice two replication streams together, as the relay's bridge would.
    fn splice(a: ReplicationStream, b: ReplicationStream) {
        let mut a_io = a.io;
        let mut b_io = b.io;
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut a_io, &mut b_io).await;
        });
    }

    #[test]
    fn mismatched_write_key_rejected() {
        let (read_key, _) = origin_pair();
        let other = SigningKey::from_bytes([2u8; 32]);
        assert!(matches!(
            MemoryEngine::new().open_session(read_key, Some(other)),
            Err(EngineError::SessionCreation(_))
        ));
    }

    #[tokio::test]
    async fn append_and_watch() {
        let handle = open_writable();
        let mut watch = handle.watch();
        let entry = handle.append(serde_json::json!({"k": 1})).unwrap();
        assert_eq!(entry.seq, 0);
        let seen = timeout(TEST_TIMEOUT, watch.recv()).await.unwrap().unwrap();
        assert_eq!(seen, entry);
    }

    #[tokio::test]
    async fn replica_handle_cannot_append() {
        let handle = open_replica();
        assert!(matches!(
            handle.append(serde_json::json!(1)),
            Err(EngineError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn unauthorised_writer_rejected_until_granted() {
        let handle = open_writable();
        let device = SigningKey::from_bytes([7u8; 32]);

        assert!(matches!(
            handle.append_as(&device, serde_json::json!(1)),
            Err(EngineError::NotAuthorised(_))
        ));

        handle.grant_writer(device.public_key()).unwrap();
        handle.append_as(&device, serde_json::json!(1)).unwrap();
    }

    #[tokio::test]
    async fn entries_replicate_across_spliced_streams() {
        let origin = open_writable();
        let replica = open_replica();

        splice(
            origin.replicate(StreamOptions::default()).unwrap(),
            replica.replicate(StreamOptions::default()).unwrap(),
        );

        let mut watch = replica.watch();
        let entry = origin.append(serde_json::json!({"greeting": "hello"})).unwrap();

        let received = timeout(TEST_TIMEOUT, watch.recv()).await.unwrap().unwrap();
        assert_eq!(received, entry);
        assert_eq!(replica.entries(), vec![entry]);
    }

    #[tokio::test]
    async fn snapshot_replays_existing_entries() {
        let origin = open_writable();
        origin.append(serde_json::json!(1)).unwrap();
        origin.append(serde_json::json!(2)).unwrap();

        let replica = open_replica();
        let mut watch = replica.watch();
        splice(
            origin.replicate(StreamOptions::default()).unwrap(),
            replica.replicate(StreamOptions::default()).unwrap(),
        );

        timeout(TEST_TIMEOUT, watch.recv()).await.unwrap().unwrap();
        timeout(TEST_TIMEOUT, watch.recv()).await.unwrap().unwrap();
        assert_eq!(replica.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_entries_applied_once() {
        let origin = open_writable();
        let replica = open_replica();

        // Two independent paths between the same pair of handles.
        splice(
            origin.replicate(StreamOptions::default()).unwrap(),
            replica.replicate(StreamOptions::default()).unwrap(),
        );
        splice(
            origin.replicate(StreamOptions::default()).unwrap(),
            replica.replicate(StreamOptions::default()).unwrap(),
        );

        origin.append(serde_json::json!({"n": 1})).unwrap();

        // Give both paths time to deliver.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(replica.len(), 1);
    }

    #[tokio::test]
    async fn grant_propagates_to_replicas() {
        let origin = open_writable();
        let replica = open_replica();
        let device = SigningKey::from_bytes([7u8; 32]);

        splice(
            origin.replicate(StreamOptions::default()).unwrap(),
            replica.replicate(StreamOptions::default()).unwrap(),
        );

        let mut watch = replica.watch();
        origin.grant_writer(device.public_key()).unwrap();
        timeout(TEST_TIMEOUT, watch.recv()).await.unwrap().unwrap();

        assert!(replica.is_authorised(&device.public_key()));
    }

    #[tokio::test]
    async fn extension_payloads_pass_through_opaquely() {
        let origin = open_writable();
        let replica = open_replica();

        let mut a = origin.replicate(StreamOptions::live_with_ephemeral()).unwrap();
        let mut b = replica.replicate(StreamOptions::live_with_ephemeral()).unwrap();
        let a_lane = a.extensions.take().unwrap();
        let mut b_rx = b.extensions.take().unwrap().rx;
        splice(a, b);

        let payload = b"not json at all \xff".to_vec();
        a_lane.tx.send(payload.clone()).await.unwrap();

        let received = timeout(TEST_TIMEOUT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, payload);
        // The lane is a side channel; the log itself is untouched.
        assert!(replica.is_empty());
    }

    #[tokio::test]
    async fn streams_without_extension_have_no_lane() {
        let origin = open_writable();
        let stream = origin.replicate(StreamOptions::default()).unwrap();
        assert!(stream.extensions.is_none());
    }

    #[tokio::test]
    async fn closed_handle_refuses_streams_and_appends() {
        let handle = open_writable();
        handle.close();
        assert!(matches!(
            handle.replicate(StreamOptions::default()),
            Err(EngineError::Closed)
        ));
        assert!(matches!(
            handle.append(serde_json::json!(1)),
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn forged_entry_dropped() {
        let replica = open_replica();

        // Hand a forged entry (bad signature) straight to apply_remote.
        let (read_key, write_key) = origin_pair();
        let value = serde_json::json!({"evil": true});
        let mut entry = LogEntry {
            writer: read_key,
            seq: 0,
            value: value.clone(),
            signature: write_key.sign(b"something else"),
        };
        apply_remote(&replica.inner, entry.clone(), 1);
        assert!(replica.is_empty());

        // The same entry properly signed applies fine.
        entry.signature = write_key.sign(&LogEntry::signing_bytes(&read_key, 0, &value));
        apply_remote(&replica.inner, entry, 1);
        assert_eq!(replica.len(), 1);
    }
}
