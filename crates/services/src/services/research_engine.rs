//! Boundary with the external engine that does the actual research work.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use db::models::research_task::{ProgressUpdate, ReportType, ResearchResult, ResearchTask};
use futures::{StreamExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::services::{
    config::EngineConfig,
    execution_control::{ExecutionControl, ExecutionControlError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Research was cancelled")]
    Cancelled,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Engine protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Failed(String),
}

impl From<ExecutionControlError> for EngineError {
    fn from(err: ExecutionControlError) -> Self {
        match err {
            ExecutionControlError::Cancelled => EngineError::Cancelled,
            other => EngineError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub task_id: Uuid,
    pub query: String,
    pub report_type: ReportType,
    pub tone: String,
    pub language: String,
    pub total_words: i32,
    pub max_subtopics: i32,
}

impl From<&ResearchTask> for EngineRequest {
    fn from(task: &ResearchTask) -> Self {
        Self {
            task_id: task.id,
            query: task.query.clone(),
            report_type: task.report_type,
            tone: task.tone.clone(),
            language: task.language.clone(),
            total_words: task.total_words,
            max_subtopics: task.max_subtopics,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub report: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub total_cost: f64,
}

impl From<EngineOutput> for ResearchResult {
    fn from(output: EngineOutput) -> Self {
        Self {
            report: output.report,
            sources: output.sources,
            images: output.images,
            cost: output.total_cost,
        }
    }
}

/// Channel the engine reports progress through, plus its view of run control.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    control: ExecutionControl,
}

impl ProgressSink {
    pub fn new(control: ExecutionControl) -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, control }, rx)
    }

    /// Never blocks. Updates sent after the run is settled are dropped.
    pub fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }

    /// Waits while paused; errors once the run has been cancelled.
    pub async fn checkpoint(&self) -> Result<(), EngineError> {
        self.control.checkpoint().await.map_err(EngineError::from)
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// A started engine run.
pub struct EngineHandle {
    result: BoxFuture<'static, Result<EngineOutput, EngineError>>,
}

impl EngineHandle {
    pub fn new<F>(result: F) -> Self
    where
        F: Future<Output = Result<EngineOutput, EngineError>> + Send + 'static,
    {
        Self {
            result: Box::pin(result),
        }
    }

    pub async fn await_result(self) -> Result<EngineOutput, EngineError> {
        self.result.await
    }
}

#[async_trait]
pub trait ResearchEngine: Send + Sync {
    async fn begin(
        &self,
        request: EngineRequest,
        sink: ProgressSink,
    ) -> Result<EngineHandle, EngineError>;
}

/// Engine reached over HTTP. The response body is newline-delimited JSON,
/// one frame per line, tagged by `type`.
#[derive(Clone)]
pub struct HttpResearchEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineFrame {
    Progress(ProgressUpdate),
    Result(EngineOutput),
    Error { error: String },
}

impl HttpResearchEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read_frames(
        response: reqwest::Response,
        sink: ProgressSink,
    ) -> Result<EngineOutput, EngineError> {
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                sink.checkpoint().await?;
                if let Some(output) = Self::handle_line(&line, &sink)? {
                    return Ok(output);
                }
            }

            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => break,
            }
        }

        sink.checkpoint().await?;
        match Self::handle_line(&buffer, &sink)? {
            Some(output) => Ok(output),
            None => Err(EngineError::Protocol(
                "stream ended without a result".to_string(),
            )),
        }
    }

    fn handle_line(line: &[u8], sink: &ProgressSink) -> Result<Option<EngineOutput>, EngineError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(None);
        }

        let frame: EngineFrame = serde_json::from_slice(line)
            .map_err(|e| EngineError::Protocol(format!("bad frame: {e}")))?;
        match frame {
            EngineFrame::Progress(update) => {
                sink.report(update);
                Ok(None)
            }
            EngineFrame::Result(output) => Ok(Some(output)),
            EngineFrame::Error { error } => Err(EngineError::Failed(error)),
        }
    }
}

#[async_trait]
impl ResearchEngine for HttpResearchEngine {
    async fn begin(
        &self,
        request: EngineRequest,
        sink: ProgressSink,
    ) -> Result<EngineHandle, EngineError> {
        let url = format!("{}/research/stream", self.base_url);
        tracing::debug!("Starting engine run for task {} at {}", request.task_id, url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        // Dropping the handle drops the body stream and closes the connection.
        Ok(EngineHandle::new(Self::read_frames(response, sink)))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedEngine, ScriptedRun};

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use std::time::Duration;

    use async_trait::async_trait;
    use db::models::research_task::ProgressUpdate;
    use tokio::sync::{Mutex, mpsc, oneshot};

    use super::{
        EngineError, EngineHandle, EngineOutput, EngineRequest, ProgressSink, ResearchEngine,
    };

    type Outcome = Result<EngineOutput, EngineError>;

    /// Engine whose runs are driven by the test through [`ScriptedRun`].
    pub struct ScriptedEngine {
        runs_tx: mpsc::UnboundedSender<ScriptedRun>,
        runs_rx: Mutex<mpsc::UnboundedReceiver<ScriptedRun>>,
        refuse_next: parking_lot::Mutex<Option<String>>,
    }

    impl Default for ScriptedEngine {
        fn default() -> Self {
            let (runs_tx, runs_rx) = mpsc::unbounded_channel();
            Self {
                runs_tx,
                runs_rx: Mutex::new(runs_rx),
                refuse_next: parking_lot::Mutex::new(None),
            }
        }
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Waits for the next `begin` call.
        pub async fn next_run(&self) -> ScriptedRun {
            let mut runs = self.runs_rx.lock().await;
            tokio::time::timeout(Duration::from_secs(5), runs.recv())
                .await
                .expect("engine run was never started")
                .expect("engine dropped")
        }

        /// Makes the next `begin` call fail with `error`.
        pub fn refuse_next_start(&self, error: impl Into<String>) {
            *self.refuse_next.lock() = Some(error.into());
        }
    }

    #[async_trait]
    impl ResearchEngine for ScriptedEngine {
        async fn begin(
            &self,
            request: EngineRequest,
            sink: ProgressSink,
        ) -> Result<EngineHandle, EngineError> {
            let refused = self.refuse_next.lock().take();
            if let Some(error) = refused {
                return Err(EngineError::Failed(error));
            }

            let (outcome_tx, outcome_rx) = oneshot::channel::<Outcome>();
            let run_sink = sink.clone();
            let _ = self.runs_tx.send(ScriptedRun {
                request,
                sink,
                outcome: Some(outcome_tx),
            });

            Ok(EngineHandle::new(async move {
                let outcome = tokio::select! {
                    outcome = outcome_rx => outcome.unwrap_or_else(|_| {
                        Err(EngineError::Failed("scripted run dropped".to_string()))
                    }),
                    _ = run_sink.control.cancelled() => Err(EngineError::Cancelled),
                };
                run_sink.checkpoint().await?;
                outcome
            }))
        }
    }

    /// One in-flight run of a [`ScriptedEngine`].
    pub struct ScriptedRun {
        pub request: EngineRequest,
        sink: ProgressSink,
        outcome: Option<oneshot::Sender<Outcome>>,
    }

    impl ScriptedRun {
        pub fn progress(&self, update: ProgressUpdate) {
            self.sink.report(update);
        }

        pub fn complete(mut self, output: EngineOutput) {
            if let Some(tx) = self.outcome.take() {
                let _ = tx.send(Ok(output));
            }
        }

        pub fn fail(mut self, error: impl Into<String>) {
            if let Some(tx) = self.outcome.take() {
                let _ = tx.send(Err(EngineError::Failed(error.into())));
            }
        }

        pub fn is_cancelled(&self) -> bool {
            self.sink.is_cancelled()
        }

        pub async fn cancelled(&self) {
            self.sink.control.cancelled().await
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, routing::post};

    use super::*;

    async fn serve_frames(body: &'static str) -> String {
        let app = Router::new().route("/research/stream", post(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> EngineRequest {
        EngineRequest {
            task_id: Uuid::new_v4(),
            query: "sqlite internals".to_string(),
            report_type: ReportType::ResearchReport,
            tone: "Analytical".to_string(),
            language: "english".to_string(),
            total_words: 2000,
            max_subtopics: 5,
        }
    }

    fn engine_for(base_url: String) -> HttpResearchEngine {
        HttpResearchEngine::new(&EngineConfig {
            base_url,
            connect_timeout_secs: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn http_engine_streams_progress_then_result() {
        let base_url = serve_frames(concat!(
            "{\"type\":\"progress\",\"completed_queries\":1,\"total_queries\":4}\n",
            "\n",
            "{\"type\":\"progress\",\"depth\":2,\"cost\":0.02}\n",
            "{\"type\":\"result\",\"report\":\"R\",",
            "\"sources\":[\"https://a.example\"],\"total_cost\":0.3}\n",
        ))
        .await;

        let (sink, mut rx) = ProgressSink::new(ExecutionControl::new());
        let handle = engine_for(base_url).begin(request(), sink).await.unwrap();
        let output = handle.await_result().await.unwrap();

        assert_eq!(output.report, "R");
        assert_eq!(output.sources, vec!["https://a.example".to_string()]);
        assert!(output.images.is_empty());
        assert_eq!(output.total_cost, 0.3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.completed_queries, Some(1));
        assert_eq!(first.total_queries, Some(4));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.current_depth, Some(2));
        assert_eq!(second.cost, Some(0.02));
    }

    #[tokio::test]
    async fn http_engine_surfaces_error_frame() {
        let base_url =
            serve_frames("{\"type\":\"error\",\"error\":\"search quota exhausted\"}\n").await;
        let (sink, _rx) = ProgressSink::new(ExecutionControl::new());
        let handle = engine_for(base_url).begin(request(), sink).await.unwrap();

        let err = handle.await_result().await.unwrap_err();
        assert_eq!(err.to_string(), "search quota exhausted");
    }

    #[tokio::test]
    async fn http_engine_rejects_truncated_stream() {
        let base_url = serve_frames("{\"type\":\"progress\",\"completed_queries\":1}\n").await;
        let (sink, _rx) = ProgressSink::new(ExecutionControl::new());
        let handle = engine_for(base_url).begin(request(), sink).await.unwrap();

        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn http_engine_stops_at_checkpoint_after_cancel() {
        let base_url = serve_frames(
            "{\"type\":\"result\",\"report\":\"late\",\"total_cost\":0.1}\n",
        )
        .await;
        let control = ExecutionControl::new();
        let (sink, _rx) = ProgressSink::new(control.clone());
        let handle = engine_for(base_url).begin(request(), sink).await.unwrap();

        control.cancel();
        let err = handle.await_result().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn scripted_run_reports_and_completes() {
        let engine = ScriptedEngine::new();
        let (sink, mut rx) = ProgressSink::new(ExecutionControl::new());
        let handle = engine.begin(request(), sink).await.unwrap();

        let run = engine.next_run().await;
        assert_eq!(run.request.query, "sqlite internals");
        run.progress(ProgressUpdate {
            completed_queries: Some(2),
            ..Default::default()
        });
        run.complete(EngineOutput {
            report: "done".to_string(),
            ..Default::default()
        });

        assert_eq!(rx.recv().await.unwrap().completed_queries, Some(2));
        assert_eq!(handle.await_result().await.unwrap().report, "done");
    }

    #[tokio::test]
    async fn scripted_run_observes_cancellation() {
        let engine = ScriptedEngine::new();
        let control = ExecutionControl::new();
        let (sink, _rx) = ProgressSink::new(control.clone());
        let handle = engine.begin(request(), sink).await.unwrap();
        let run = engine.next_run().await;

        control.cancel();
        run.cancelled().await;
        assert!(run.is_cancelled());
        assert!(matches!(
            handle.await_result().await,
            Err(EngineError::Cancelled)
        ));
    }
}
