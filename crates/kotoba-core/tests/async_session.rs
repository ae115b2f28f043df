use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kotoba_abi::{Batch, Token, TokenSource};
use kotoba_core::{
    AsyncSession, EngineConfig, EngineError, GenerationResult, GenerationSession, ScriptedSource,
};

fn async_session<S: TokenSource + Send + 'static>(source: S) -> AsyncSession<S> {
    let config = EngineConfig {
        add_bos: false,
        ..Default::default()
    };
    AsyncSession::new(GenerationSession::initialize(source, config).unwrap())
}

/// Counts decodes where the test can see them while the session is locked.
struct CountingSource {
    inner: ScriptedSource,
    decodes: Arc<AtomicUsize>,
}

impl TokenSource for CountingSource {
    fn tokenize(&self, text: &str, add_bos: bool) -> kotoba_abi::Result<Vec<Token>> {
        self.inner.tokenize(text, add_bos)
    }

    fn decode(&mut self, batch: &Batch) -> kotoba_abi::Result<()> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(batch)
    }

    fn logits(&self, index: usize) -> kotoba_abi::Result<&[f32]> {
        self.inner.logits(index)
    }

    fn detokenize(&self, token: Token) -> kotoba_abi::Result<Vec<u8>> {
        self.inner.detokenize(token)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.inner.is_end_of_generation(token)
    }

    fn n_vocab(&self) -> usize {
        self.inner.n_vocab()
    }

    fn context_capacity(&self) -> usize {
        self.inner.context_capacity()
    }

    fn used_context_slots(&self) -> usize {
        self.inner.used_context_slots()
    }

    fn clear_context(&mut self) {
        self.inner.clear_context()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_chunks_in_order() {
    let session = async_session(ScriptedSource::new(64).with_text("こんにちは"));
    let mut stream = session.send("挨拶").await.unwrap();

    let mut text = String::new();
    let mut ended = false;
    while let Some(item) = stream.next().await {
        match item.unwrap() {
            GenerationResult::TextChunk(chunk) => text.push_str(&chunk),
            GenerationResult::EndOfGeneration => ended = true,
        }
    }
    assert!(ended);
    assert_eq!(text, "こんにちは");
    assert_eq!(session.transcript(), "こんにちは");
}

#[tokio::test(flavor = "multi_thread")]
async fn start_errors_are_returned_from_send() {
    let session = async_session(ScriptedSource::new(64));
    assert!(matches!(
        session.send("").await,
        Err(EngineError::Tokenize(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_stops_an_endless_generation() {
    let session = async_session(ScriptedSource::new(4096).with_text("ab").without_eog());
    let mut stream = session.send("p").await.unwrap();
    assert!(stream.next().await.is_some());

    session.abort().await;
    let mut rest = 0;
    while stream.next().await.is_some() {
        rest += 1;
    }
    assert_eq!(rest, 0);

    let mut next = session.send("p").await.unwrap();
    assert!(next.next().await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_stream_releases_the_session() {
    let session = async_session(ScriptedSource::new(4096).with_text("abc").without_eog());
    {
        let mut stream = session.send("p").await.unwrap();
        stream.next().await;
    }
    // The producer notices the closed channel and gives the session back.
    assert!(session.transcript().starts_with('a'));
    assert!(session.send("p").await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_cancel_ends_the_stream() {
    let session = async_session(ScriptedSource::new(4096).with_text("z").without_eog());
    let mut stream = session.send("p").await.unwrap();
    stream.next().await;
    stream.cancel();

    let mut rest = 0;
    while stream.next().await.is_some() {
        rest += 1;
    }
    assert_eq!(rest, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_recovers_from_an_error() {
    let session = async_session(ScriptedSource::new(2).with_text("xyz"));
    let err = session.send("ab").await.unwrap().collect_text().await.unwrap_err();
    assert!(matches!(err, EngineError::ContextOverflow { .. }));
    assert!(matches!(
        session.send("a").await,
        Err(EngineError::SessionErrored)
    ));

    session.reset().await;
    assert_eq!(session.transcript(), "");
    session.reinitialize().await.unwrap();
    let mut stream = session.send("a").await.unwrap();
    assert!(matches!(
        stream.next().await,
        Some(Ok(GenerationResult::TextChunk(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn producer_runs_at_most_one_chunk_ahead() {
    let decodes = Arc::new(AtomicUsize::new(0));
    let session = async_session(CountingSource {
        inner: ScriptedSource::new(4096).with_text("abcdef").without_eog(),
        decodes: decodes.clone(),
    });

    let mut stream = session.send("p").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(decodes.load(Ordering::SeqCst), 1);

    assert_eq!(
        stream.next().await.unwrap().unwrap(),
        GenerationResult::TextChunk("a".into())
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(decodes.load(Ordering::SeqCst), 2);

    session.abort().await;
    // The chunk computed ahead was never delivered, but it was emitted.
    assert_eq!(session.transcript(), "ab");
}

#[tokio::test(flavor = "multi_thread")]
async fn transcript_is_readable_while_a_stream_is_live() {
    let session = async_session(ScriptedSource::new(4096).with_text("abc").without_eog());
    let mut stream = session.send("p").await.unwrap();
    stream.next().await;

    // The producer is parked on the full channel, holding the session.
    let text = session.transcript();
    assert!(text == "a" || text == "ab", "unexpected transcript {text:?}");

    assert_eq!(
        stream.next().await.unwrap().unwrap(),
        GenerationResult::TextChunk("b".into())
    );
}
