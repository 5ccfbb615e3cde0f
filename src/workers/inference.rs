//! Inference worker — leases tasks, streams tokens, finalizes with exactly
//! one terminal event per task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{RunnerError, StoreError};
use crate::events::{inference_channel, EventHub, JobEvent};
use crate::executor::{ChatOutcome, ModelRunner};
use crate::queue::{InferenceTask, JobStatus};
use crate::store::InferenceStore;
use crate::workers::cancel::CancelRegistry;

/// Shared dependencies for an inference worker.
#[derive(Clone)]
pub struct InferenceWorkerDeps {
    pub tasks: InferenceStore,
    pub hub: Arc<EventHub>,
    pub runner: Arc<dyn ModelRunner>,
    pub cancels: Arc<CancelRegistry>,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
}

/// Repeatedly leases one PENDING inference task, runs it, finalizes it.
pub struct InferenceWorker {
    lease_id: Uuid,
    deps: InferenceWorkerDeps,
}

impl InferenceWorker {
    /// Create a new worker with its own lease identity.
    pub fn new(deps: InferenceWorkerDeps) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            deps,
        }
    }

    /// Main worker loop; mirrors `AgentWorker::run`.
    pub async fn run(self) {
        info!(lease_id = %self.lease_id, "InferenceWorker started");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.deps.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "InferenceWorker iteration failed");
                    tokio::time::sleep(self.deps.poll_interval).await;
                }
            }
        }
    }

    /// One iteration: sweep dangling cancels (publishing their terminal
    /// events), then lease and process at most one task.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        for task_id in self.deps.tasks.sweep_cancel_requested()? {
            info!(task_id = %task_id, "Inference task cancelled before dispatch");
            self.deps
                .hub
                .publish(&inference_channel(task_id), JobEvent::canceled(task_id));
        }

        let Some(task) = self.deps.tasks.lease(self.lease_id, self.deps.lease_ttl)? else {
            return Ok(false);
        };
        self.process(task).await?;
        Ok(true)
    }

    /// Run one leased task to a terminal state and publish its terminal event.
    async fn process(&self, task: InferenceTask) -> Result<(), StoreError> {
        let task_id = task.task_id;
        let channel = inference_channel(task_id);
        info!(task_id = %task_id, model_id = %task.model_id, "Inference started");

        // A malformed prompt never reaches the runner.
        let Some(messages) = task.prompt.get("messages").and_then(Value::as_array).cloned()
        else {
            let message = "invalid prompt: missing messages array";
            warn!(task_id = %task_id, message);
            self.deps
                .tasks
                .finalize(task_id, JobStatus::Failed, None, None, Some(message))?;
            self.deps
                .hub
                .publish(&channel, JobEvent::error(task_id, message, None));
            return Ok(());
        };

        let cancel = self.deps.cancels.register(task_id);

        // A cancel request that raced the lease lands before the handle is
        // registered; re-read the row so it is not lost.
        if let Ok(Some(row)) = self.deps.tasks.get(task_id)
            && row.status == JobStatus::CancelRequested
        {
            cancel.cancel();
        }

        let outcome = self.run_inference(&task, &messages, &cancel).await;

        let finalized = match outcome {
            Ok(chat) => {
                info!(
                    task_id = %task_id,
                    tokens_per_second = chat.tokens_per_second,
                    "Inference completed"
                );
                self.deps.tasks.finalize(
                    task_id,
                    JobStatus::Completed,
                    Some(&chat.result),
                    Some(chat.tokens_per_second),
                    None,
                )?;
                self.deps.hub.publish(
                    &channel,
                    JobEvent::done(task_id, chat.result, chat.tokens_per_second),
                );
                Ok(())
            }
            Err(RunnerError::Canceled) => {
                info!(task_id = %task_id, "Inference cancelled");
                self.deps
                    .tasks
                    .finalize(task_id, JobStatus::Canceled, None, None, None)?;
                self.deps.hub.publish(&channel, JobEvent::canceled(task_id));
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Inference failed");
                self.deps.tasks.finalize(
                    task_id,
                    JobStatus::Failed,
                    None,
                    None,
                    Some(&e.to_string()),
                )?;
                self.deps.hub.publish(
                    &channel,
                    JobEvent::error(task_id, e.to_string(), Some(format!("{e:?}"))),
                );
                Ok(())
            }
        };

        self.deps.cancels.remove(task_id);
        finalized
    }

    /// Load the model and stream the chat, publishing one TOKEN event per
    /// streamed token.
    async fn run_inference(
        &self,
        task: &InferenceTask,
        messages: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, RunnerError> {
        self.deps.runner.ensure_loaded(&task.model_id).await?;

        let hub = Arc::clone(&self.deps.hub);
        let channel = inference_channel(task.task_id);
        let task_id = task.task_id;
        let on_token = move |text: &str| {
            hub.publish(&channel, JobEvent::token(task_id, text));
        };

        self.deps
            .runner
            .run_chat(messages, &task.parameters, &on_token, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue::EnqueueService;
    use crate::executor::TokenSink;
    use crate::queue::JobSource;
    use crate::store::{Database, ExecutionStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Streams fixed tokens, then returns their concatenation.
    struct ScriptedRunner {
        tokens: Vec<&'static str>,
    }

    #[async_trait]
    impl ModelRunner for ScriptedRunner {
        async fn ensure_loaded(&self, _model_id: &str) -> Result<(), RunnerError> {
            Ok(())
        }

        async fn run_chat(
            &self,
            _messages: &[Value],
            _parameters: &Value,
            on_token: TokenSink<'_>,
            cancel: &CancellationToken,
        ) -> Result<ChatOutcome, RunnerError> {
            let mut text = String::new();
            for token in &self.tokens {
                if cancel.is_cancelled() {
                    return Err(RunnerError::Canceled);
                }
                on_token(token);
                text.push_str(token);
            }
            Ok(ChatOutcome {
                result: json!({"text": text, "finish_reason": "stop"}),
                tokens_per_second: 42.0,
            })
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl ModelRunner for FailingRunner {
        async fn ensure_loaded(&self, model_id: &str) -> Result<(), RunnerError> {
            Err(RunnerError::ModelUnavailable {
                model_id: model_id.to_string(),
            })
        }

        async fn run_chat(
            &self,
            _messages: &[Value],
            _parameters: &Value,
            _on_token: TokenSink<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ChatOutcome, RunnerError> {
            unreachable!("ensure_loaded always fails")
        }
    }

    /// Flags if the runner was ever invoked.
    struct TrackingRunner {
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ModelRunner for TrackingRunner {
        async fn ensure_loaded(&self, _model_id: &str) -> Result<(), RunnerError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn run_chat(
            &self,
            _messages: &[Value],
            _parameters: &Value,
            _on_token: TokenSink<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ChatOutcome, RunnerError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(ChatOutcome {
                result: json!({}),
                tokens_per_second: 1.0,
            })
        }
    }

    fn setup(runner: Arc<dyn ModelRunner>) -> (InferenceWorker, EnqueueService, InferenceStore) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executions = ExecutionStore::new(Arc::clone(&db));
        let tasks = InferenceStore::new(db);
        let enqueue = EnqueueService::new(executions, tasks.clone());

        let worker = InferenceWorker::new(InferenceWorkerDeps {
            tasks: tasks.clone(),
            hub: Arc::new(EventHub::new()),
            runner,
            cancels: Arc::new(CancelRegistry::new()),
            lease_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(10),
        });
        (worker, enqueue, tasks)
    }

    fn enqueue_chat(enqueue: &EnqueueService) -> Uuid {
        enqueue
            .enqueue_inference(
                "llama-3",
                vec![json!({"role": "user", "content": "greet"})],
                json!({}),
                JobSource::Chat,
                None,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn streams_tokens_then_exactly_one_done() {
        let (worker, enqueue, tasks) = setup(Arc::new(ScriptedRunner {
            tokens: vec!["Hello", " ", "world"],
        }));
        let id = enqueue_chat(&enqueue);

        let mut rx = worker.deps.hub.subscribe(&inference_channel(id));
        assert!(worker.run_once().await.unwrap());

        let mut texts = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            match event {
                JobEvent::Token { data, .. } => texts.push(data.text),
                JobEvent::Done { data, .. } => {
                    assert_eq!(data.result["text"], "Hello world");
                    assert!(data.tokens_per_second > 0.0);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(texts, vec!["Hello", " ", "world"]);

        let row = tasks.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.tokens_per_second, Some(42.0));
    }

    #[tokio::test]
    async fn runner_failure_finalizes_failed_with_error_event() {
        let (worker, enqueue, tasks) = setup(Arc::new(FailingRunner));
        let id = enqueue_chat(&enqueue);

        let mut rx = worker.deps.hub.subscribe(&inference_channel(id));
        worker.run_once().await.unwrap();

        match rx.recv().await.unwrap() {
            JobEvent::Error { data, .. } => assert!(data.message.contains("llama-3")),
            other => panic!("expected ERROR, got {other:?}"),
        }

        let row = tasks.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error_log.unwrap().contains("llama-3"));
    }

    /// Blocks until the cancellation token fires, then reports cancelled.
    struct WaitForCancelRunner;

    #[async_trait]
    impl ModelRunner for WaitForCancelRunner {
        async fn ensure_loaded(&self, _model_id: &str) -> Result<(), RunnerError> {
            Ok(())
        }

        async fn run_chat(
            &self,
            _messages: &[Value],
            _parameters: &Value,
            _on_token: TokenSink<'_>,
            cancel: &CancellationToken,
        ) -> Result<ChatOutcome, RunnerError> {
            cancel.cancelled().await;
            Err(RunnerError::Canceled)
        }
    }

    #[tokio::test]
    async fn cooperative_cancel_finalizes_canceled() {
        let (worker, enqueue, tasks) = setup(Arc::new(WaitForCancelRunner));
        let id = enqueue_chat(&enqueue);

        let mut rx = worker.deps.hub.subscribe(&inference_channel(id));
        let cancels = Arc::clone(&worker.deps.cancels);
        let handle = tokio::spawn(async move { worker.run_once().await });

        while !cancels.is_registered(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cancels.signal(id));
        handle.await.unwrap().unwrap();

        match rx.recv().await.unwrap() {
            JobEvent::Canceled { .. } => {}
            other => panic!("expected CANCELED, got {other:?}"),
        }
        assert_eq!(tasks.get(id).unwrap().unwrap().status, JobStatus::Canceled);
        assert!(!cancels.is_registered(id));
    }

    #[tokio::test]
    async fn invalid_prompt_fails_without_invoking_runner() {
        let called = Arc::new(AtomicBool::new(false));
        let (worker, _, tasks) = setup(Arc::new(TrackingRunner {
            called: Arc::clone(&called),
        }));

        // Bypass the enqueue service to store a prompt with no messages.
        let task = InferenceTask::new("llama-3", json!({"raw": "oops"}), json!({}), 90, 90);
        let id = task.task_id;
        tasks.enqueue(&task).unwrap();

        worker.run_once().await.unwrap();

        assert!(!called.load(Ordering::SeqCst));
        let row = tasks.get(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error_log.unwrap().contains("missing messages"));
    }

    #[tokio::test]
    async fn sweep_publishes_canceled_for_pending_cancel() {
        let (worker, enqueue, tasks) = setup(Arc::new(ScriptedRunner { tokens: vec![] }));
        let id = enqueue_chat(&enqueue);
        tasks.request_cancel(id).unwrap();

        let mut rx = worker.deps.hub.subscribe(&inference_channel(id));
        assert!(!worker.run_once().await.unwrap());

        match rx.recv().await.unwrap() {
            JobEvent::Canceled { .. } => {}
            other => panic!("expected CANCELED, got {other:?}"),
        }
        assert_eq!(tasks.get(id).unwrap().unwrap().status, JobStatus::Canceled);
    }
}
