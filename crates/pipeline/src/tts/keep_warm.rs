//! Keep-warm connections for connection-oriented TTS backends
//!
//! Opening a synthesis connection (TLS + session setup) is often the largest part
//! of first-audio latency. [`WarmPool`] keeps one connection open ahead of time and
//! starts the next as soon as the current one is taken.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use voice_session_core::{AudioStream, Error, TextToSpeech, TtsCapabilities};

/// Opens backend connections
#[async_trait]
pub trait WarmConnector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, Error>;

    /// Open a connection for the pool ahead of use; may do setup an inline connect skips
    async fn warm(&self) -> Result<Self::Connection, Error> {
        self.connect().await
    }
}

/// A connection that synthesizes one segment and is then discarded
#[async_trait]
pub trait SynthesisConnection: Send + 'static {
    async fn synthesize(self, text: String) -> Result<AudioStream, Error>;
}

/// Holds at most one pre-opened connection
pub struct WarmPool<C: WarmConnector> {
    connector: Arc<C>,
    warm: Arc<Mutex<Option<JoinHandle<Result<C::Connection, Error>>>>>,
}

impl<C: WarmConnector> Clone for WarmPool<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            warm: self.warm.clone(),
        }
    }
}

impl<C: WarmConnector> WarmPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            warm: Arc::new(Mutex::new(None)),
        }
    }

    /// Start opening a connection if none is warm or warming
    pub fn warm_up(&self) {
        let mut warm = self.warm.lock();
        if warm.is_some() {
            return;
        }
        let connector = self.connector.clone();
        *warm = Some(tokio::spawn(async move { connector.warm().await }));
    }

    /// Take the warm connection (or connect inline) and start warming the next one
    pub async fn take(&self) -> Result<C::Connection, Error> {
        let pending = self.warm.lock().take();

        let connection = match pending {
            Some(handle) => match handle.await {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(e)) => {
                    tracing::warn!("Warm connection failed, connecting inline: {}", e);
                    self.connector.connect().await
                }
                Err(e) => {
                    tracing::warn!("Warm-up task failed, connecting inline: {}", e);
                    self.connector.connect().await
                }
            },
            None => self.connector.connect().await,
        };

        self.warm_up();
        connection
    }

    /// Whether a connection is open or opening
    pub fn is_warm(&self) -> bool {
        self.warm.lock().is_some()
    }

    /// Drop the warm connection
    pub fn close(&self) {
        if let Some(handle) = self.warm.lock().take() {
            handle.abort();
        }
    }
}

/// [`TextToSpeech`] on top of a [`WarmPool`]
pub struct PooledTts<C: WarmConnector> {
    name: String,
    capabilities: TtsCapabilities,
    pool: WarmPool<C>,
}

impl<C: WarmConnector> PooledTts<C> {
    pub fn new(name: impl Into<String>, capabilities: TtsCapabilities, pool: WarmPool<C>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            pool,
        }
    }

    pub fn pool(&self) -> &WarmPool<C> {
        &self.pool
    }
}

#[async_trait]
impl<C> TextToSpeech for PooledTts<C>
where
    C: WarmConnector,
    C::Connection: SynthesisConnection,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TtsCapabilities {
        self.capabilities
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, Error> {
        let connection = self.pool.take().await?;
        connection.synthesize(text.to_string()).await
    }

    fn close(&self) {
        self.pool.close();
    }
}
