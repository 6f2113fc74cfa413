//! Per-session state machine.
//!
//! A session turns an ordered run of fragments into an assembled payload and
//! dispatches the post-assembly actions against an [`InferenceBackend`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::action::Step;
use super::message::{Fragment, Response};
use super::reassembler::ChunkBuffer;
use crate::error::{OffloadError, Result};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No fragments received yet
    Empty,
    /// Fragments buffered, not yet assembled
    Accumulating,
    /// Payload concatenated, ready for inference
    Assembled,
    /// Terminated by END
    Done,
}

/// Output of a model run, already encoded for the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceOutput {
    /// Encoded prediction
    pub results: Bytes,
    /// Auxiliary metadata
    pub keypairs: BTreeMap<String, i32>,
}

/// Capabilities a session needs once its payload is assembled.
///
/// Implementations must be callable from several sessions at once.
pub trait InferenceBackend: Send + Sync {
    /// Undo compression applied by the edge device.
    fn decompress(&self, payload: &[u8]) -> Result<Bytes>;

    /// Resume the forward pass at `layer` with `payload` as the activation.
    fn infer(&self, payload: &[u8], layer: i32) -> Result<InferenceOutput>;
}

/// What the stream handler should do after a fragment was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Keep the session; optionally send a response
    Continue(Option<Response>),
    /// Session ended; drop it from the registry
    Terminated,
}

#[derive(Debug, Clone)]
struct AssembledPayload {
    payload: Bytes,
    decompressed: bool,
}

/// One offload session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID
    id: String,
    /// Current state
    state: SessionState,
    /// Buffered fragments
    buffer: ChunkBuffer,
    /// Result of the last APPEND
    assembled: Option<AssembledPayload>,
    /// Most recent layer hint
    layer: i32,
    /// Creation time
    created_at: Instant,
    /// Last activity timestamp
    last_activity: Instant,
    /// Fragments applied
    fragments_received: u64,
    /// Successful inferences
    inferences: u64,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            state: SessionState::Empty,
            buffer: ChunkBuffer::new(),
            assembled: None,
            layer: 0,
            created_at: now,
            last_activity: now,
            fragments_received: 0,
            inferences: 0,
        }
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Most recent layer hint
    pub fn layer(&self) -> i32 {
        self.layer
    }

    /// Buffered fragments
    pub fn buffer(&self) -> &ChunkBuffer {
        &self.buffer
    }

    /// Assembled payload, if the session is in [`SessionState::Assembled`]
    pub fn assembled(&self) -> Option<&Bytes> {
        match self.state {
            SessionState::Assembled => self.assembled.as_ref().map(|a| &a.payload),
            _ => None,
        }
    }

    /// Check if the session idled past `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Apply one fragment.
    ///
    /// Steps run in the fixed order of [`ActionSet::plan`](super::ActionSet::plan).
    /// A failing step aborts the rest of the fragment; effects of the steps
    /// before it stay applied, and the failing step itself leaves the session
    /// as it found it.
    pub fn apply<B>(&mut self, fragment: &Fragment, backend: &B) -> Result<Applied>
    where
        B: InferenceBackend + ?Sized,
    {
        self.touch();
        self.fragments_received += 1;
        self.layer = fragment.layer;

        let mut response = None;
        for step in fragment.action.plan() {
            match step {
                Step::Terminate => {
                    self.terminate();
                    return Ok(Applied::Terminated);
                },
                Step::Reset => self.reset(),
                Step::Receive => self.receive(fragment.chunk.clone()),
                Step::Assemble { compressed } => self.assemble(compressed, backend)?,
                Step::Infer { compressed } => {
                    let output = self.infer(compressed, fragment.layer, backend)?;
                    let mut reply =
                        Response::new(&self.id, fragment.action).with_results(output.results);
                    reply.keypairs = output.keypairs;
                    response = Some(reply);
                },
            }
        }

        Ok(Applied::Continue(response))
    }

    /// Discard everything buffered; the session accepts chunks again.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.assembled = None;
        self.state = SessionState::Accumulating;
    }

    /// Append a chunk. A non-empty chunk invalidates any assembled payload.
    pub fn receive(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.append(chunk);
        self.assembled = None;
        self.state = SessionState::Accumulating;
    }

    fn assemble<B>(&mut self, compressed: bool, backend: &B) -> Result<()>
    where
        B: InferenceBackend + ?Sized,
    {
        let raw = self.buffer.assemble();
        let payload = if compressed {
            backend.decompress(&raw)?
        } else {
            raw
        };

        tracing::debug!(
            session = %self.id,
            fragments = self.buffer.len(),
            bytes = payload.len(),
            compressed,
            "payload assembled"
        );

        self.assembled = Some(AssembledPayload {
            payload,
            decompressed: compressed,
        });
        self.state = SessionState::Assembled;
        Ok(())
    }

    fn infer<B>(&mut self, compressed: bool, layer: i32, backend: &B) -> Result<InferenceOutput>
    where
        B: InferenceBackend + ?Sized,
    {
        let assembled = match (&self.state, &self.assembled) {
            (SessionState::Assembled, Some(assembled)) => assembled,
            _ => return Err(OffloadError::InvalidState { state: self.state }),
        };

        let output = if compressed && !assembled.decompressed {
            let tensor = backend.decompress(&assembled.payload)?;
            backend.infer(&tensor, layer)?
        } else {
            backend.infer(&assembled.payload, layer)?
        };

        self.inferences += 1;
        Ok(output)
    }

    fn terminate(&mut self) {
        self.buffer.clear();
        self.assembled = None;
        self.state = SessionState::Done;
    }

    /// Get session statistics
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state,
            fragments_received: self.fragments_received,
            buffered_bytes: self.buffer.total_bytes(),
            inferences: self.inferences,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Update last activity timestamp
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Current state
    pub state: SessionState,
    /// Fragments applied
    pub fragments_received: u64,
    /// Bytes currently buffered
    pub buffered_bytes: usize,
    /// Successful inferences
    pub inferences: u64,
    /// Seconds since creation
    pub age_secs: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::Action;

    /// Records model calls; "decompresses" by stripping a `Z:` prefix.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Vec<u8>, i32)>>,
    }

    impl InferenceBackend for Recorder {
        fn decompress(&self, payload: &[u8]) -> Result<Bytes> {
            payload
                .strip_prefix(b"Z:")
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| OffloadError::Decompression("missing Z: prefix".into()))
        }

        fn infer(&self, payload: &[u8], layer: i32) -> Result<InferenceOutput> {
            self.calls.lock().unwrap().push((payload.to_vec(), layer));
            let mut keypairs = BTreeMap::new();
            keypairs.insert("start_layer".to_string(), layer);
            Ok(InferenceOutput {
                results: Bytes::copy_from_slice(payload),
                keypairs,
            })
        }
    }

    fn frag(chunk: &'static [u8], actions: &[Action]) -> Fragment {
        actions
            .iter()
            .fold(Fragment::new("s1").with_chunk(chunk), |f, a| f.with_action(*a))
    }

    #[test]
    fn test_append_then_inference() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");

        session.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        session.apply(&frag(b"cd", &[Action::Append]), &backend).unwrap();
        let applied = session
            .apply(&frag(b"", &[Action::Inference]).with_layer(3), &backend)
            .unwrap();

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(b"abcd".to_vec(), 3)]);
        match applied {
            Applied::Continue(Some(response)) => {
                assert_eq!(response.id, "s1");
                assert_eq!(&response.results[..], b"abcd");
                assert_eq!(response.keypairs["start_layer"], 3);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Assembled);
    }

    #[test]
    fn test_inference_before_append_is_rejected() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"ab", &[]), &backend).unwrap();

        let err = session
            .apply(&frag(b"", &[Action::Inference]), &backend)
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::InvalidState {
                state: SessionState::Accumulating
            }
        ));
        assert_eq!(session.state(), SessionState::Accumulating);
        assert_eq!(&session.buffer().assemble()[..], b"ab");

        session.apply(&frag(b"", &[Action::Append]), &backend).unwrap();
        session.apply(&frag(b"", &[Action::Inference]), &backend).unwrap();
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_inference_on_empty_session() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        let err = session
            .apply(&frag(b"", &[Action::Inference]), &backend)
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::InvalidState {
                state: SessionState::Empty
            }
        ));
    }

    #[test]
    fn test_reset_discards_prior_content() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"old", &[Action::Append]), &backend).unwrap();

        session
            .apply(&frag(b"x", &[Action::Reset, Action::Append]), &backend)
            .unwrap();
        assert_eq!(session.assembled().unwrap(), &Bytes::from_static(b"x"));
    }

    #[test]
    fn test_double_reset_is_idempotent() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"junk", &[]), &backend).unwrap();

        session.apply(&frag(b"", &[Action::Reset]), &backend).unwrap();
        assert!(session.buffer().is_empty());
        session.apply(&frag(b"", &[Action::Reset]), &backend).unwrap();
        assert!(session.buffer().is_empty());
        assert_eq!(session.state(), SessionState::Accumulating);

        session.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        let mut fresh = Session::new("s1");
        fresh.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        assert_eq!(session.assembled(), fresh.assembled());
    }

    #[test]
    fn test_compressed_append_decompresses_once() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session
            .apply(&frag(b"Z:", &[]), &backend)
            .unwrap();
        session
            .apply(&frag(b"tensor", &[Action::Append, Action::Compressed]), &backend)
            .unwrap();
        assert_eq!(session.assembled().unwrap(), &Bytes::from_static(b"tensor"));

        // Already decompressed at assembly; COMPRESSED on inference is a no-op.
        session
            .apply(&frag(b"", &[Action::Inference, Action::Compressed]), &backend)
            .unwrap();
        assert_eq!(backend.calls.lock().unwrap()[0].0, b"tensor".to_vec());
    }

    #[test]
    fn test_compressed_inference_decompresses_raw_assembly() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session
            .apply(&frag(b"Z:abc", &[Action::Append]), &backend)
            .unwrap();
        session
            .apply(&frag(b"", &[Action::Inference, Action::Compressed]), &backend)
            .unwrap();
        assert_eq!(backend.calls.lock().unwrap()[0].0, b"abc".to_vec());
        // Stored payload stays compressed.
        assert_eq!(session.assembled().unwrap(), &Bytes::from_static(b"Z:abc"));
    }

    #[test]
    fn test_decompression_failure_keeps_session_usable() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        let err = session
            .apply(&frag(b"garbage", &[Action::Append, Action::Compressed]), &backend)
            .unwrap_err();
        assert!(matches!(err, OffloadError::Decompression(_)));
        assert_eq!(session.state(), SessionState::Accumulating);

        session
            .apply(&frag(b"ok", &[Action::Reset, Action::Append]), &backend)
            .unwrap();
        assert_eq!(session.assembled().unwrap(), &Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_end_ignores_other_flags() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        let applied = session
            .apply(&frag(b"cd", &[Action::End, Action::Inference]), &backend)
            .unwrap();
        assert_eq!(applied, Applied::Terminated);
        assert_eq!(session.state(), SessionState::Done);
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_new_chunk_after_assembly_requires_reassembly() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        session.apply(&frag(b"cd", &[]), &backend).unwrap();
        assert_eq!(session.state(), SessionState::Accumulating);
        assert!(session
            .apply(&frag(b"", &[Action::Inference]), &backend)
            .is_err());
    }

    #[test]
    fn test_repeated_inference_on_same_payload() {
        let backend = Recorder::default();
        let mut session = Session::new("s1");
        session.apply(&frag(b"ab", &[Action::Append]), &backend).unwrap();
        session
            .apply(&frag(b"", &[Action::Inference]).with_layer(1), &backend)
            .unwrap();
        session
            .apply(&frag(b"", &[Action::Inference]).with_layer(2), &backend)
            .unwrap();
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
        assert_eq!(session.stats().inferences, 2);
        assert_eq!(session.layer(), 2);
    }
}
