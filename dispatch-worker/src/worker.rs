//! The polling loop itself: pull a task, heartbeat while it runs, run
//! the model, deliver or fail. One task in flight at a time.
//!
//! Grounded in `original_source/npsgd_worker.py`'s
//! `NPSGDWorker`/`TaskKeepAliveThread` for the overall shape (poll,
//! spawn a heartbeat thread, run, report), and structured like
//! `hook-worker::worker::WebhookWorker` for the Rust idiom (a struct
//! holding a `reqwest::Client` and a `HealthHandle`, an async `run`
//! loop, `tokio::spawn` standing in for the source's `Thread`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use dispatch_common::email::{blocking_send, OutgoingEmail, SmtpConfig};
use dispatch_common::health::HealthHandle;
use dispatch_common::registry::{ModelDefinition, ModelRegistry};
use dispatch_common::task::{Task, TaskDict, TaskId};

use crate::error::{RunError, WorkerError};
use crate::run;

pub struct WorkerConfig {
    pub base_url: String,
    pub request_secret: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub working_directory_root: PathBuf,
    pub latex_path: String,
    pub latex_num_runs: u32,
}

pub struct Worker {
    client: Client,
    registry: Arc<ModelRegistry>,
    smtp: SmtpConfig,
    config: WorkerConfig,
    liveness: HealthHandle,
}

impl Worker {
    pub fn new(
        registry: Arc<ModelRegistry>,
        smtp: SmtpConfig,
        config: WorkerConfig,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client: Client::new(),
            registry,
            smtp,
            config,
            liveness,
        }
    }

    /// Equivalent to `NPSGDWorker::getServerInfo`: a single connectivity
    /// check at startup, failing fast if the queue is unreachable.
    pub async fn check_connectivity(&self) -> Result<(), WorkerError> {
        self.touch_checkin().await
    }

    async fn touch_checkin(&self) -> Result<(), WorkerError> {
        let url = format!("{}/worker_info", self.config.base_url);
        self.client
            .get(&url)
            .query(&[("secret", &self.config.request_secret)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Runs forever, processing one task per iteration and sleeping
    /// `poll_interval` whenever the queue has nothing this worker can
    /// run.
    pub async fn run(&self) -> ! {
        loop {
            self.liveness.report_healthy().await;

            if let Err(err) = self.touch_checkin().await {
                warn!(error = %err, "failed to touch worker checkin");
            }

            match self.poll_task().await {
                Ok(Some(dict)) => self.process_task(dict).await,
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    warn!(error = %err, "failed to poll queue for work");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn poll_task(&self) -> Result<Option<TaskDict>, WorkerError> {
        let versions = self.registry.model_versions();
        let url = format!("{}/worker_work_task", self.config.base_url);

        let response: Value = self
            .client
            .post(&url)
            .query(&[("secret", &self.config.request_secret)])
            .json(&json!({ "model_versions_json": versions }))
            .send()
            .await?
            .json()
            .await?;

        match response.get("task") {
            Some(task_json) => {
                let dict: TaskDict = serde_json::from_value(task_json.clone())
                    .map_err(|e| WorkerError::MalformedResponse(e.to_string()))?;
                Ok(Some(dict))
            }
            None => {
                match response.get("error").and_then(Value::as_str) {
                    Some("empty_queue") => info!("no tasks available on queue"),
                    Some("no_version") => info!("queue has work but none this worker can run"),
                    other => warn!(?other, "unexpected worker_work_task response"),
                }
                Ok(None)
            }
        }
    }

    async fn process_task(&self, dict: TaskDict) {
        let task_id = dict.task_id;

        let definition = match self.registry.get(&dict.model_name, &dict.model_version) {
            Some(definition) => definition,
            None => {
                warn!(
                    model = %dict.model_name,
                    version = %dict.model_version,
                    task_id,
                    "pulled a task for a model version this worker no longer has loaded"
                );
                self.report_failed(task_id).await;
                return;
            }
        };

        let task = match Task::from_dict(dict, &definition.parameters) {
            Ok(task) => task,
            Err(err) => {
                warn!(error = %err, task_id, "task dict did not match its declared schema");
                self.report_failed(task_id).await;
                return;
            }
        };

        let (stop_heartbeat, heartbeat) = self.spawn_heartbeat(task_id);

        let outcome = self.run_and_deliver(&definition, &task).await;

        let _ = stop_heartbeat.send(());
        let _ = heartbeat.await;

        if let Err(err) = outcome {
            error!(error = %err, task_id, "model run or result delivery failed");
            self.report_failed(task_id).await;
        }
    }

    fn spawn_heartbeat(&self, task_id: TaskId) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let client = self.client.clone();
        let base_url = self.config.base_url.clone();
        let secret = self.config.request_secret.clone();
        let interval_duration = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let url = format!("{base_url}/worker_keep_alive_task/{task_id}");
                        match client.get(&url).query(&[("secret", &secret)]).send().await {
                            Ok(resp) if resp.status().is_success() => {}
                            Ok(resp) => {
                                warn!(status = %resp.status(), task_id, "heartbeat rejected by queue")
                            }
                            Err(err) => warn!(error = %err, task_id, "heartbeat request failed"),
                        }
                    }
                }
            }
        });

        (stop_tx, handle)
    }

    async fn run_and_deliver(
        &self,
        definition: &ModelDefinition,
        task: &Task,
    ) -> Result<(), WorkerError> {
        let working_dir =
            run::create_working_directory(&self.config.working_directory_root).map_err(RunError::from)?;
        let cleanup_dir = working_dir.clone();

        let result = self.run_and_deliver_in(definition, task, working_dir).await;

        if let Err(err) = std::fs::remove_dir_all(&cleanup_dir) {
            warn!(error = %err, dir = %cleanup_dir.display(), "failed to remove working directory");
        }

        result
    }

    async fn run_and_deliver_in(
        &self,
        definition: &ModelDefinition,
        task: &Task,
        working_dir: PathBuf,
    ) -> Result<(), WorkerError> {
        let definition = definition.clone();
        let task_for_run = task.clone();
        let latex_path = self.config.latex_path.clone();
        let latex_num_runs = self.config.latex_num_runs;

        let output = tokio::task::spawn_blocking(move || {
            run::execute(&definition, &task_for_run, &working_dir, &latex_path, latex_num_runs)
        })
        .await
        .map_err(|join_err| WorkerError::Panicked(join_err.to_string()))??;

        if !self.has_task(task.task_id).await {
            info!(task_id = task.task_id, "task was reclaimed while we were running it, dropping results");
            return Ok(());
        }

        let mut binary_attachments = vec![("results.pdf".to_owned(), output.pdf)];
        binary_attachments.extend(output.attachments);

        let email = OutgoingEmail {
            recipient: task.email_address.clone(),
            subject: "Your model run results".to_owned(),
            body: format!(
                "Your model run '{}' (id {}) has completed. Results are attached.",
                task.model_name, task.visible_id
            ),
            text_attachments: Vec::new(),
            binary_attachments,
        };

        let smtp = self.smtp.clone();
        tokio::task::spawn_blocking(move || blocking_send(&smtp, email))
            .await
            .map_err(|join_err| WorkerError::Panicked(join_err.to_string()))??;

        self.report_succeeded(task.task_id).await;
        Ok(())
    }

    /// Duplicate-suppression check immediately before sending results:
    /// covers the sweeper-retried-while-still-running race.
    async fn has_task(&self, task_id: TaskId) -> bool {
        let url = format!("{}/worker_has_task/{task_id}", self.config.base_url);
        match self
            .client
            .get(&url)
            .query(&[("secret", &self.config.request_secret)])
            .send()
            .await
        {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(body) => body.get("result").and_then(Value::as_str) == Some("yes"),
                Err(err) => {
                    warn!(error = %err, task_id, "could not parse worker_has_task response, assuming lost");
                    false
                }
            },
            Err(err) => {
                warn!(error = %err, task_id, "worker_has_task request failed, assuming lost");
                false
            }
        }
    }

    async fn report_succeeded(&self, task_id: TaskId) {
        let url = format!("{}/worker_succeed_task/{task_id}", self.config.base_url);
        if let Err(err) = self
            .client
            .get(&url)
            .query(&[("secret", &self.config.request_secret)])
            .send()
            .await
        {
            warn!(error = %err, task_id, "failed to report success to queue");
        }
    }

    async fn report_failed(&self, task_id: TaskId) {
        let url = format!("{}/worker_failed_task/{task_id}", self.config.base_url);
        if let Err(err) = self
            .client
            .get(&url)
            .query(&[("secret", &self.config.request_secret)])
            .send()
            .await
        {
            warn!(error = %err, task_id, "failed to report failure to queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_common::health::HealthRegistry;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn worker(base_url: String) -> Worker {
        let registry = Arc::new(ModelRegistry::new());
        let liveness = HealthRegistry::new("liveness")
            .register("worker".to_owned(), time::Duration::seconds(60))
            .await;
        Worker::new(
            registry,
            SmtpConfig {
                server: "localhost".to_owned(),
                port: 25,
                username: String::new(),
                password: String::new(),
                use_tls: false,
                from_address: "worker@example.com".to_owned(),
                cc: Vec::new(),
                bcc: Vec::new(),
            },
            WorkerConfig {
                base_url,
                request_secret: "sekrit".to_owned(),
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(10),
                working_directory_root: std::env::temp_dir(),
                latex_path: "/bin/true".to_owned(),
                latex_num_runs: 1,
            },
            liveness,
        )
    }

    #[tokio::test]
    async fn poll_task_returns_none_on_empty_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker_work_task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "empty_queue"})))
            .mount(&server)
            .await;

        let w = worker(server.uri()).await;
        assert!(w.poll_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_task_parses_returned_task_dict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker_work_task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task": {
                "emailAddress": "a@b.com",
                "taskId": 7,
                "visibleId": "abcd1234",
                "failureCount": 0,
                "modelName": "abmu",
                "modelVersion": "v1",
                "modelParameters": {},
            }})))
            .mount(&server)
            .await;

        let w = worker(server.uri()).await;
        let dict = w.poll_task().await.unwrap().unwrap();
        assert_eq!(dict.task_id, 7);
        assert_eq!(dict.model_name, "abmu");
    }

    #[tokio::test]
    async fn has_task_reports_false_when_server_says_no() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/worker_has_task/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "no"})))
            .mount(&server)
            .await;

        let w = worker(server.uri()).await;
        assert!(!w.has_task(9).await);
    }

    #[tokio::test]
    async fn has_task_reports_false_on_transport_error() {
        let w = worker("http://127.0.0.1:1".to_owned()).await;
        assert!(!w.has_task(9).await);
    }
}
