//! Per-stream composition of registry, batcher and estimator.
//!
//! A `StreamPipeline` drives one stream the way a transport handler would:
//! every generated token is recorded on the connection, offered to the
//! batcher and counted by the estimator. Whatever comes out is handed back to
//! the caller for transmission.

use tokio::sync::mpsc;

use crate::batching::{TokenBatch, TokenBatcher};
use crate::config::{ConfigError, RelayConfig};
use crate::progress::{CompletionHistory, ProgressEstimator, ProgressReport};
use crate::registry::{ConnectionRegistry, MetricsUpdate, StreamConnection, StreamId};

/// Who is opening a stream
#[derive(Clone, Debug, Default)]
pub struct StreamRequest {
    /// Owning user
    pub user_id: String,
    /// Session the stream belongs to
    pub session_id: String,
    /// Reuse an existing stream ID (reconnect)
    pub stream_id: Option<StreamId>,
    /// Model name used to select an estimate profile
    pub model: Option<String>,
    /// Extra totals to calibrate the estimate, on top of the shared history
    pub history: Vec<u64>,
}

impl StreamRequest {
    /// Create a request
    #[must_use]
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Reconnect under an existing stream ID
    #[must_use]
    pub fn with_stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Select a model profile
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Seed historical totals
    #[must_use]
    pub fn with_history(mut self, history: Vec<u64>) -> Self {
        self.history = history;
        self
    }
}

/// Output of one [`StreamPipeline::push_token`] call
#[derive(Clone, Debug, Default)]
pub struct PipelineStep {
    /// A batch ready to transmit
    pub batch: Option<TokenBatch>,
    /// A progress report ready to transmit
    pub progress: Option<ProgressReport>,
    /// False if the connection is no longer registered (evicted or swept)
    pub connected: bool,
}

/// Everything left over when a stream ends
#[derive(Debug)]
pub struct FinishedStream {
    /// Remaining batches in batch-number order
    pub batches: Vec<TokenBatch>,
    /// Final 100% report
    pub report: ProgressReport,
    /// Final connection state, if it was still registered
    pub connection: Option<StreamConnection>,
}

/// One stream's batcher and estimator bound to its registry entry
#[derive(Debug)]
pub struct StreamPipeline {
    registry: ConnectionRegistry,
    connection: StreamConnection,
    batcher: TokenBatcher,
    timed_batches: mpsc::UnboundedReceiver<TokenBatch>,
    estimator: ProgressEstimator,
    model: Option<String>,
    history: CompletionHistory,
}

impl StreamPipeline {
    /// Register the stream and build its batcher and estimator
    ///
    /// The estimator is seeded with the totals `config.history` holds for the
    /// requested model, followed by `request.history`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the batcher or estimator configuration is
    /// invalid. Nothing is registered in that case.
    pub fn open(
        registry: &ConnectionRegistry,
        config: &RelayConfig,
        request: StreamRequest,
    ) -> Result<Self, ConfigError> {
        let (batcher, timed_batches) = TokenBatcher::new(config.batcher.clone())?;
        let estimator = match request.model.as_deref() {
            Some(model) => {
                ProgressEstimator::for_model(config.estimator.clone(), model, &config.profiles)?
            }
            None => ProgressEstimator::new(config.estimator.clone())?,
        }
        .with_history(config.history.totals(request.model.as_deref()))
        .with_history(request.history);

        let connection =
            registry.connect(&request.user_id, &request.session_id, request.stream_id);

        Ok(Self {
            registry: registry.clone(),
            connection,
            batcher,
            timed_batches,
            estimator,
            model: request.model,
            history: config.history.clone(),
        })
    }

    /// The stream ID
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        self.connection.stream_id()
    }

    /// The connection as it was when the stream opened
    #[must_use]
    pub fn connection(&self) -> &StreamConnection {
        &self.connection
    }

    /// The batcher
    #[must_use]
    pub fn batcher(&self) -> &TokenBatcher {
        &self.batcher
    }

    /// The estimator
    #[must_use]
    pub fn estimator(&self) -> &ProgressEstimator {
        &self.estimator
    }

    /// Feed one generated token through the pipeline
    pub fn push_token(&mut self, token: &str) -> PipelineStep {
        let connected = self.registry.update_metrics(
            self.connection.stream_id(),
            MetricsUpdate::new().with_tokens(1).with_delta(token),
        );
        if !connected {
            tracing::debug!(
                stream_id = %self.connection.stream_id(),
                "Token for a stream that is no longer registered"
            );
        }

        PipelineStep {
            batch: self.batcher.add_token(token),
            progress: self.estimator.update(1),
            connected,
        }
    }

    /// Forward a client heartbeat to the registry
    pub fn heartbeat(&self) -> bool {
        self.registry.heartbeat(self.connection.stream_id())
    }

    /// Wait for the next batch produced by the delayed flush
    ///
    /// Pending forever is expected while tokens keep filling batches; use it
    /// inside `tokio::select!` next to the token source.
    pub async fn next_timed_batch(&mut self) -> Option<TokenBatch> {
        self.timed_batches.recv().await
    }

    /// Take a timed batch if one is already waiting
    pub fn try_timed_batch(&mut self) -> Option<TokenBatch> {
        self.timed_batches.try_recv().ok()
    }

    /// End the stream
    ///
    /// Cancels the delayed flush, collects every batch not yet handed out,
    /// completes the estimate and disconnects the stream. The stream total is
    /// recorded in the shared history for later streams of the same model.
    pub fn finish(self) -> FinishedStream {
        self.close(true)
    }

    /// End a stream that did not run to completion
    ///
    /// Same as [`finish`](Self::finish), but the partial total is not
    /// recorded, so it does not skew later estimates.
    pub fn abort(self) -> FinishedStream {
        self.close(false)
    }

    fn close(mut self, record: bool) -> FinishedStream {
        self.batcher.shutdown();

        let mut batches = Vec::new();
        while let Ok(batch) = self.timed_batches.try_recv() {
            batches.push(batch);
        }
        if let Some(batch) = self.batcher.flush() {
            batches.push(batch);
        }
        batches.sort_by_key(TokenBatch::batch_number);

        let report = self.estimator.complete();
        if record {
            self.history.record(self.model.as_deref(), report.tokens_sent);
        }
        let connection = self.registry.disconnect(self.connection.stream_id());

        tracing::debug!(
            stream_id = %self.connection.stream_id(),
            tokens = report.tokens_sent,
            trailing_batches = batches.len(),
            recorded = record,
            "Stream pipeline finished"
        );

        FinishedStream {
            batches,
            report,
            connection,
        }
    }
}
