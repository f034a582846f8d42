//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container for the whole test run. Each harness gets its own
//! database on that container, so parallel tests never lease each other's
//! jobs.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use server_core::broker::Broker;
use server_core::kernel::ServerKernel;
use server_core::render::RenderService;
use server_core::server::app::{build_app_with_state, AppState};
use server_core::storage::events::{EventDraft, EventRecord, EventType};
use server_core::Config;

/// 32 zero bytes, base64; fine for tests.
pub const TEST_CREDENTIAL_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

struct SharedTestInfra {
    admin_url: String,
    base_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .expect("postgres container starts");
        let host = postgres.get_host().await.expect("container host");
        let port = postgres
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

        Self {
            admin_url: format!("{base_url}/postgres"),
            base_url,
            _postgres: postgres,
        }
    }

    async fn get() -> &'static Self {
        SHARED_INFRA.get_or_init(Self::init).await
    }

    /// One database per harness: leases sweep the whole queue, so tests
    /// running in parallel must not share one.
    async fn fresh_database(&self) -> String {
        let name = format!("t_{}", uuid::Uuid::new_v4().simple());
        let admin = PgPool::connect(&self.admin_url)
            .await
            .expect("admin connection");
        sqlx::query(&format!(r#"CREATE DATABASE "{name}""#))
            .execute(&admin)
            .await
            .expect("test database created");
        let db_url = format!("{}/{name}", self.base_url);

        let pool = PgPool::connect(&db_url).await.expect("connect for migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations run");
        db_url
    }
}

pub struct TestHarness {
    pub kernel: Arc<ServerKernel>,
    pub broker: Arc<Broker>,
    pub base_url: String,
    pub http: reqwest::Client,
}

impl TestHarness {
    pub async fn new() -> Self {
        let infra = SharedTestInfra::get().await;
        let db_url = infra.fresh_database().await;
        let pool = PgPool::connect(&db_url).await.expect("pool connects");
        let config = Config {
            database_url: db_url,
            port: 0,
            credential_key: Some(TEST_CREDENTIAL_KEY.to_string()),
            reaper_interval_ms: 200,
            max_job_attempts: 3,
            purge_grace_secs: 3600,
        };
        let kernel = Arc::new(ServerKernel::new(pool, config).expect("kernel builds"));
        let broker = Broker::new(Arc::clone(&kernel));
        let render = Arc::new(RenderService::new(Arc::clone(&kernel)));

        let app = build_app_with_state(AppState {
            kernel: Arc::clone(&kernel),
            broker: Arc::clone(&broker),
            render,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port binds");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server runs");
        });

        Self {
            kernel,
            broker,
            base_url: format!("http://{addr}"),
            http: reqwest::Client::new(),
        }
    }

    pub async fn register(&self, path: &str, yaml: &str) -> i64 {
        self.kernel
            .catalog
            .register(path, yaml)
            .await
            .expect("playbook registers")
            .catalog_id
    }

    /// Start an execution and run the first broker evaluation synchronously,
    /// so tests observe a deterministic frontier.
    pub async fn start(&self, path: &str, workload: Value) -> i64 {
        let record = self
            .kernel
            .catalog
            .latest(path)
            .await
            .expect("catalog reachable")
            .expect("playbook registered");
        let document = playbook::parse(&record.content_yaml).expect("stored playbook parses");
        let merged = document.merged_workload(&workload);
        let execution = self
            .kernel
            .executions
            .create(record.catalog_id, &merged)
            .await
            .expect("execution row");
        self.kernel
            .events
            .append(
                EventDraft::new(execution.execution_id, EventType::ExecutionStart)
                    .input_context(merged),
            )
            .await
            .expect("execution_start appends");
        self.broker
            .evaluate(execution.execution_id)
            .await
            .expect("first evaluation");
        execution.execution_id
    }

    pub async fn events(&self, execution_id: i64) -> Vec<EventRecord> {
        self.kernel
            .events
            .read(execution_id, None, None)
            .await
            .expect("events read")
    }

    /// `(event_type, node_id)` pairs in log order, for order assertions.
    pub async fn event_trace(&self, execution_id: i64) -> Vec<(String, String)> {
        self.events(execution_id)
            .await
            .into_iter()
            .map(|event| {
                (
                    event.event_type.as_str().to_string(),
                    event.node_id.unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Scripted stand-in for the worker pool: lease, emit the worker's event
    /// sequence, ack, re-evaluate. `decide` maps a node id to an outcome.
    pub async fn drive<F>(&self, worker_id: &str, mut decide: F)
    where
        F: FnMut(&str) -> Scripted,
    {
        for _ in 0..200 {
            let jobs = self
                .kernel
                .queue
                .lease(worker_id, 10, 30_000)
                .await
                .expect("lease");
            if jobs.is_empty() {
                return;
            }
            for job in jobs {
                let started = self
                    .kernel
                    .events
                    .append(
                        EventDraft::new(job.execution_id, EventType::ActionStarted)
                            .node(&job.node_id),
                    )
                    .await
                    .expect("action_started");
                match decide(&job.node_id) {
                    Scripted::Ok(result) => {
                        self.kernel
                            .events
                            .append(
                                EventDraft::new(job.execution_id, EventType::ActionCompleted)
                                    .node(&job.node_id)
                                    .parent(started)
                                    .result(result.clone()),
                            )
                            .await
                            .expect("action_completed");
                        self.kernel
                            .events
                            .append(
                                EventDraft::new(job.execution_id, EventType::StepResult)
                                    .node(&job.node_id)
                                    .result(result),
                            )
                            .await
                            .expect("step_result");
                        self.kernel
                            .queue
                            .complete(job.job_id, worker_id)
                            .await
                            .expect("complete ack");
                    }
                    Scripted::Err(error) => {
                        self.kernel
                            .events
                            .append(
                                EventDraft::new(job.execution_id, EventType::ActionError)
                                    .node(&job.node_id)
                                    .parent(started)
                                    .error(&error),
                            )
                            .await
                            .expect("action_error");
                        self.kernel
                            .queue
                            .fail(job.job_id, worker_id, &error)
                            .await
                            .expect("fail ack");
                    }
                }
                self.broker
                    .evaluate(job.execution_id)
                    .await
                    .expect("re-evaluation");
            }
        }
        panic!("drive did not quiesce within 200 rounds");
    }
}

pub enum Scripted {
    Ok(Value),
    Err(String),
}

/// Assert `needle` appears as a subsequence of `haystack`, in order.
pub fn assert_subsequence(haystack: &[(String, String)], needle: &[(&str, &str)]) {
    let mut position = 0;
    for expected in needle {
        let found = haystack[position..]
            .iter()
            .position(|(event, node)| event == expected.0 && node == expected.1);
        match found {
            Some(offset) => position += offset + 1,
            None => panic!(
                "expected ({}, {}) after position {position} in trace {haystack:?}",
                expected.0, expected.1
            ),
        }
    }
}
