// Authenticated streaming session with snapshot + diff reconstruction.
//
// `Disconnected -> Connecting -> Authenticated -> Subscribed -> Receiving`,
// and back to `Disconnected` on any failure. Leaving `Receiving` resets
// every book this session owns; the next snapshot for a symbol brings it
// back. Reconnects wait on a jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::market_data::auth::{AuthError, Credentials, RequestSigner, SignedAuth};
use crate::market_data::backoff::Backoff;
use crate::market_data::reconstructor::{BookEvent, BookPhase, Reconstructor};
use crate::persist::{append_or_log, StateStore};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("nothing received for {0:?}")]
    Timeout(Duration),
    #[error("feed reported an error: {0}")]
    Remote(String),
}

impl StreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Auth(_) => "auth",
            StreamError::Connect(_) => "connect",
            StreamError::Read(_) => "read",
            StreamError::Malformed(_) => "malformed",
            StreamError::Closed => "closed",
            StreamError::Timeout(_) => "timeout",
            StreamError::Remote(_) => "remote",
        }
    }
}

/// A bidirectional text-message connection.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), StreamError>;

    /// Next text message; `Ok(None)` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<String>, StreamError>;
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError>;
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Book {
        event: BookEvent,
        time: Option<DateTime<Utc>>,
    },
    /// Heartbeats, subscription acks and other channels.
    Ignored,
}

/// Venue-specific message framing for a streaming feed.
pub trait StreamProtocol: Send + Sync {
    fn exchange_id(&self) -> &str;

    fn subscribe_message(&self, symbols: &[String], auth: &SignedAuth) -> Result<String, StreamError>;

    /// A venue-side error message decodes to `Err(StreamError::Remote)`.
    fn decode(&self, text: &str) -> Result<FeedMessage, StreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Subscribed,
    Receiving,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub receive_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

pub struct StreamSession {
    protocol: Arc<dyn StreamProtocol>,
    connector: Arc<dyn StreamConnector>,
    credentials: Option<Credentials>,
    symbols: Vec<String>,
    store: Arc<dyn StateStore>,
    receive_timeout: Duration,
    reconstructor: Reconstructor,
    backoff: Backoff,
    state: SessionState,
}

impl StreamSession {
    pub fn new(
        protocol: Arc<dyn StreamProtocol>,
        connector: Arc<dyn StreamConnector>,
        credentials: Option<Credentials>,
        symbols: Vec<String>,
        store: Arc<dyn StateStore>,
        settings: SessionSettings,
    ) -> Self {
        let reconstructor = Reconstructor::new(protocol.exchange_id());
        Self {
            protocol,
            connector,
            credentials,
            symbols,
            store,
            receive_timeout: settings.receive_timeout,
            reconstructor,
            backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self, symbol: &str) -> BookPhase {
        self.reconstructor.phase(symbol)
    }

    /// Fails before any connection attempt when the credential is missing
    /// or unusable.
    fn signer(&self) -> Result<RequestSigner, AuthError> {
        let credentials = self.credentials.as_ref().ok_or(AuthError::MissingCredential)?;
        RequestSigner::new(credentials)
    }

    /// Connect, subscribe and receive until `shutdown` flips. Only an
    /// `AuthError` ends the loop early: there is nothing to retry until the
    /// credential is reconfigured.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        let signer = self.signer()?;
        let session = self.protocol.exchange_id().to_string();
        info!(%session, symbols = ?self.symbols, "stream session starting");

        while !*shutdown.borrow() {
            let outcome = tokio::select! {
                res = self.run_session(&signer) => res,
                _ = shutdown.changed() => break,
            };
            let err = outcome.err().unwrap_or(StreamError::Closed);
            self.disconnect(&err);

            let delay = self.backoff.next_delay();
            debug!(%session, ?delay, attempt = self.backoff.attempt(), "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.reconstructor.reset();
        self.state = SessionState::Disconnected;
        info!(%session, "stream session stopped");
        Ok(())
    }

    /// One connection's lifetime. Returns only on failure.
    pub(crate) async fn run_session(&mut self, signer: &RequestSigner) -> Result<(), StreamError> {
        self.state = SessionState::Connecting;
        let mut transport = self.connector.connect().await?;

        let auth = signer.sign_subscription(Utc::now().timestamp());
        self.state = SessionState::Authenticated;

        let subscribe = self.protocol.subscribe_message(&self.symbols, &auth)?;
        transport.send(subscribe).await?;
        self.state = SessionState::Subscribed;
        info!(session = %self.protocol.exchange_id(), "subscribed");

        self.state = SessionState::Receiving;
        loop {
            let text = match tokio::time::timeout(self.receive_timeout, transport.receive()).await {
                Err(_) => return Err(StreamError::Timeout(self.receive_timeout)),
                Ok(received) => received?.ok_or(StreamError::Closed)?,
            };
            self.handle_text(&text).await?;
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), StreamError> {
        let message = match self.protocol.decode(text) {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("depthwatch_stream_messages_total", "kind" => "error").increment(1);
                return Err(e);
            }
        };
        let FeedMessage::Book { event, time } = message else {
            metrics::counter!("depthwatch_stream_messages_total", "kind" => "ignored").increment(1);
            return Ok(());
        };
        let kind = match &event {
            BookEvent::Snapshot { .. } => "snapshot",
            BookEvent::Diff { .. } => "diff",
        };
        metrics::counter!("depthwatch_stream_messages_total", "kind" => kind).increment(1);
        // book data means the feed is healthy; only then start the backoff over
        self.backoff.reset();

        if let Some(snapshot) = self.reconstructor.apply(event, time.unwrap_or_else(Utc::now)) {
            append_or_log(self.store.as_ref(), &snapshot).await;
        }
        Ok(())
    }

    pub(crate) fn disconnect(&mut self, err: &StreamError) {
        warn!(
            session = %self.protocol.exchange_id(),
            state = ?self.state,
            error = %err,
            "stream session dropped"
        );
        metrics::counter!("depthwatch_stream_reconnects_total", "reason" => err.kind()).increment(1);
        self.reconstructor.reset();
        self.state = SessionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::adapters::coinbase::CoinbaseProtocol;
    use crate::market_data::auth::test_credentials;
    use crate::market_data::types::PriceLevel;
    use crate::persist::memory::MemoryStore;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = VecDeque<Result<Option<String>, StreamError>>;

    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        connects: AtomicUsize,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        fn with_scripts(scripts: Vec<Vec<Result<Option<String>, StreamError>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().map(VecDeque::from).collect()),
                ..Default::default()
            })
        }
    }

    struct ScriptedTransport {
        script: Script,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn send(&mut self, text: String) -> Result<(), StreamError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Option<String>, StreamError> {
            match self.script.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .pop_front()
                .ok_or_else(|| StreamError::Connect("refused".into()))?;
            Ok(Box::new(ScriptedTransport { script, sent: Arc::clone(&self.sent) }))
        }
    }

    fn text(s: &str) -> Result<Option<String>, StreamError> {
        Ok(Some(s.to_string()))
    }

    const SNAPSHOT: &str =
        r#"{"type":"snapshot","product_id":"BTC-USDT","bids":[["100","1"],["99","2"]],"asks":[["101","1"]]}"#;
    const UPDATE: &str = r#"{"type":"l2update","product_id":"BTC-USDT","changes":[["buy","100","0"],["sell","101","2"]],"time":"2024-01-01T00:00:01Z"}"#;
    const LATE_UPDATE: &str =
        r#"{"type":"l2update","product_id":"BTC-USDT","changes":[["sell","150","9"]],"time":"2024-01-01T00:00:05Z"}"#;
    const FEED_ERROR: &str = r#"{"type":"error","message":"rate limited"}"#;

    fn session(
        connector: Arc<ScriptedConnector>,
        credentials: Option<Credentials>,
        store: Arc<MemoryStore>,
    ) -> StreamSession {
        StreamSession::new(
            Arc::new(CoinbaseProtocol::new("coinbase", "level2")),
            connector,
            credentials,
            vec!["BTC/USDT".into(), "ETH/USDT".into()],
            store,
            SessionSettings {
                receive_timeout: Duration::from_secs(5),
                backoff_initial: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn missing_credential_never_connects() {
        let connector = ScriptedConnector::with_scripts(vec![vec![text(SNAPSHOT)]]);
        let mut s = session(Arc::clone(&connector), None, Arc::new(MemoryStore::new()));
        let (_tx, rx) = watch::channel(false);

        let err = s.run(rx).await.unwrap_err();
        assert!(matches!(err, StreamError::Auth(AuthError::MissingCredential)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn snapshot_and_diff_reach_the_store_and_error_resets() {
        let connector = ScriptedConnector::with_scripts(vec![
            vec![text(SNAPSHOT), text(r#"{"type":"heartbeat"}"#), text(UPDATE), text(FEED_ERROR)],
            vec![text(LATE_UPDATE), Ok(None)],
        ]);
        let store = Arc::new(MemoryStore::new());
        let mut s = session(Arc::clone(&connector), Some(test_credentials()), Arc::clone(&store));
        let signer = s.signer().unwrap();

        let err = s.run_session(&signer).await.unwrap_err();
        assert!(matches!(err, StreamError::Remote(_)));
        assert_eq!(s.state(), SessionState::Receiving);
        assert_eq!(s.phase("BTC/USDT"), BookPhase::Live);

        let stored = store.latest("BTC/USDT", "coinbase").await.unwrap().unwrap();
        assert_eq!(stored.bids, vec![PriceLevel::new(dec!(99), dec!(2))]);
        assert_eq!(stored.asks, vec![PriceLevel::new(dec!(101), dec!(2))]);
        assert_eq!(stored.observed_at.to_rfc3339(), "2024-01-01T00:00:01+00:00");

        s.disconnect(&err);
        assert_eq!(s.state(), SessionState::Disconnected);
        assert_eq!(s.phase("BTC/USDT"), BookPhase::Stale);

        // diff on the new connection has no snapshot to apply to
        let err = s.run_session(&signer).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
        assert_eq!(store.appended(), 2);
        assert_eq!(store.latest("BTC/USDT", "coinbase").await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn subscribe_names_every_product_and_carries_signature() {
        let connector = ScriptedConnector::with_scripts(vec![vec![Ok(None)]]);
        let mut s = session(Arc::clone(&connector), Some(test_credentials()), Arc::new(MemoryStore::new()));
        let signer = s.signer().unwrap();
        let _ = s.run_session(&signer).await;

        let sent = connector.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["product_ids"], serde_json::json!(["BTC-USDT", "ETH-USDT"]));
        assert_eq!(v["channels"], serde_json::json!(["level2"]));
        assert_eq!(v["key"], test_credentials().api_key);
        assert!(!v["signature"].as_str().unwrap().is_empty());
        assert!(v["timestamp"].as_str().unwrap().parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn malformed_message_drops_the_session() {
        let connector = ScriptedConnector::with_scripts(vec![vec![text(SNAPSHOT), text("{not json")]]);
        let mut s = session(connector, Some(test_credentials()), Arc::new(MemoryStore::new()));
        let signer = s.signer().unwrap();
        assert!(matches!(s.run_session(&signer).await, Err(StreamError::Malformed(_))));
    }

    #[tokio::test]
    async fn silent_feed_times_out() {
        let connector = ScriptedConnector::with_scripts(vec![vec![]]);
        let mut s = session(connector, Some(test_credentials()), Arc::new(MemoryStore::new()));
        s.receive_timeout = Duration::from_millis(20);
        let signer = s.signer().unwrap();
        assert!(matches!(s.run_session(&signer).await, Err(StreamError::Timeout(_))));
    }

    #[tokio::test]
    async fn backoff_keeps_growing_until_book_data_arrives() {
        let connector = ScriptedConnector::with_scripts(vec![
            vec![text(FEED_ERROR)],
            vec![Ok(None)],
            vec![text(SNAPSHOT), text(FEED_ERROR)],
        ]);
        let mut s = session(connector, Some(test_credentials()), Arc::new(MemoryStore::new()));
        let signer = s.signer().unwrap();
        for _ in 0..3 {
            s.backoff.next_delay();
        }

        assert!(matches!(s.run_session(&signer).await, Err(StreamError::Remote(_))));
        assert_eq!(s.backoff.attempt(), 3);
        assert!(matches!(s.run_session(&signer).await, Err(StreamError::Closed)));
        assert_eq!(s.backoff.attempt(), 3);

        assert!(matches!(s.run_session(&signer).await, Err(StreamError::Remote(_))));
        assert_eq!(s.backoff.attempt(), 0);
    }

    #[tokio::test]
    async fn rejected_subscription_reconnects_at_exponential_pace() {
        let scripts = (0..500).map(|_| vec![text(r#"{"type":"error","message":"Authentication Failed"}"#)]).collect();
        let connector = ScriptedConnector::with_scripts(scripts);
        let mut s = StreamSession::new(
            Arc::new(CoinbaseProtocol::new("coinbase", "level2")),
            Arc::clone(&connector) as Arc<dyn StreamConnector>,
            Some(test_credentials()),
            vec!["BTC/USDT".into()],
            Arc::new(MemoryStore::new()),
            SessionSettings {
                receive_timeout: Duration::from_secs(5),
                backoff_initial: Duration::from_millis(20),
                backoff_max: Duration::from_secs(2),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { s.run(rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().is_ok());

        // minimum delays 10+20+40+80+160+320 ms already exceed most of the second
        let connects = connector.connects.load(Ordering::SeqCst);
        assert!((2..=8).contains(&connects), "connects: {connects}");
    }

    #[tokio::test]
    async fn run_reconnects_until_shutdown() {
        let connector = ScriptedConnector::with_scripts(vec![
            vec![text(SNAPSHOT), Ok(None)],
            vec![Err(StreamError::Read("reset by peer".into()))],
        ]);
        let store = Arc::new(MemoryStore::new());
        let mut s = session(Arc::clone(&connector), Some(test_credentials()), Arc::clone(&store));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let res = s.run(rx).await;
            (res, s)
        });

        for _ in 0..200 {
            if connector.connects.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connector.connects.load(Ordering::SeqCst) >= 4);

        tx.send(true).unwrap();
        let (res, s) = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(res.is_ok());
        assert_eq!(s.state(), SessionState::Disconnected);
        assert_eq!(s.phase("BTC/USDT"), BookPhase::Stale);
        assert_eq!(store.appended(), 1);
    }
}
