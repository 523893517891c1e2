use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::Config;
use crate::data_models::{SearchResult, StreamEvent};
use crate::error::AppError;
use crate::gate::{ConfidenceGate, Verdict};
use crate::llm::{FragmentStream, ModelClient};
use crate::report::ReportStreamer;
use crate::search::{SearchBridge, build_context};

/// Events buffered between the pipeline task and the response body.
pub const EVENT_BUFFER: usize = 32;

/// Timeout and retry budget applied to each upstream stage.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl StagePolicy {
    /// Runs `attempt` under the stage timeout, retrying transport failures and
    /// timeouts up to `retries` more times.
    pub async fn run<T, F, Fut>(&self, stage: &'static str, mut attempt: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut retried = 0;
        loop {
            match self.within(stage, attempt()).await {
                Err(e) if e.is_retryable() && retried < self.retries => {
                    retried += 1;
                    log::warn!("{stage} failed, retrying: {:#}", e);
                }
                outcome => return outcome,
            }
        }
    }

    /// Runs `fut` under the stage timeout, without retrying.
    pub async fn within<T, Fut>(&self, stage: &'static str, fut: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(AppError::Timeout {
                stage,
                after: self.timeout,
            }))
    }
}

/// Gate, then search, then report, one request at a time. Holds no
/// per-request state.
#[derive(Debug)]
pub struct Pipeline {
    gate: ConfidenceGate,
    search: SearchBridge,
    report: ReportStreamer,
    policy: StagePolicy,
    request_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        gate: ConfidenceGate,
        search: SearchBridge,
        report: ReportStreamer,
        policy: StagePolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            search,
            report,
            policy,
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::new();
        let model = ModelClient::new(
            client.clone(),
            config.model_api_url.clone(),
            config.model_name.clone(),
        );
        Self::new(
            ConfidenceGate::new(model.clone()),
            SearchBridge::new(
                client,
                config.search_api_url.clone(),
                config.search_api_key.clone(),
            ),
            ReportStreamer::new(model, config.freeze_answer),
            StagePolicy {
                timeout: config.stage_timeout,
                retries: config.upstream_retries,
            },
            config.request_timeout,
        )
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        self.policy.run("search", || self.search.search(query)).await
    }

    /// Opens the gate's upstream call. This happens before the response
    /// starts, so its failure can still become an error status.
    pub async fn open_gate(&self, query: &str) -> Result<FragmentStream, AppError> {
        self.policy.run("gate", || self.gate.open(query)).await
    }

    /// Opens the gate and hands the rest of the request to a background task.
    /// The returned receiver closes when the task ends, on every path.
    /// Dropping the receiver ends the task at whatever stage it is in.
    pub async fn chat(self: Arc<Self>, query: String) -> Result<mpsc::Receiver<StreamEvent>, AppError> {
        let gate_stream = self.open_gate(&query).await?;
        Ok(self.spawn(query, gate_stream))
    }

    pub fn spawn(self: Arc<Self>, query: String, gate_stream: FragmentStream) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!("chat", query = %query);

        tokio::spawn(
            async move {
                let limit = self.request_timeout;
                let run = async {
                    tokio::select! {
                        outcome = self.run(&query, gate_stream, &tx) => outcome,
                        _ = tx.closed() => Err(AppError::ClientDisconnected),
                    }
                };
                match tokio::time::timeout(limit, run).await {
                    Ok(Ok(())) => log::info!("chat stream completed"),
                    Ok(Err(AppError::ClientDisconnected)) => {
                        log::info!("client disconnected, abandoning upstream reads")
                    }
                    Ok(Err(e)) => log::error!("chat stream ended early: {:#}", e),
                    Err(_) => log::error!("chat request timed out after {:?}", limit),
                }
            }
            .instrument(span),
        );

        rx
    }

    pub async fn run(
        &self,
        query: &str,
        gate_stream: FragmentStream,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), AppError> {
        let verdict = self
            .policy
            .within("gate", ConfidenceGate::drain(gate_stream))
            .await?;

        if let Verdict::Confident(answer) = verdict {
            log::info!("gate confident, answering directly");
            return send(tx, StreamEvent::answer(answer)).await;
        }

        log::info!("gate unsure, searching");
        let results = self.search(query).await?;
        let context = build_context(&results);
        send(
            tx,
            StreamEvent::Initial {
                content: query.to_string(),
                search_results: results,
            },
        )
        .await?;

        let fragments = self
            .policy
            .run("report", || self.report.open(query, &context))
            .await?;
        self.report.forward(fragments, tx).await
    }
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), AppError> {
    tx.send(event)
        .await
        .map_err(|_| AppError::ClientDisconnected)
}
