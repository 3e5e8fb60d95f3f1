//! Full master/worker round trips over real sockets
//!
//! These bring up a real master (in-memory stores) and real workers, then
//! drive runs end to end: schedule, execute as subprocesses, synchronize
//! status/results/logs back, verify, clean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use capstan_core::domain::{
    ElementGate, Job, JobDefinition, JobProperties, PipelineElement, Run, RunStatus,
    WorkerProperties,
};
use capstan_master::auth::StaticAuthorizer;
use capstan_master::config::MasterConfig;
use capstan_master::scheduler::JobScheduler;
use capstan_master::selector::WorkerSelector;
use capstan_master::store::{MemoryJobStore, MemoryRunStore, MemoryWorkerStore, RunStore};
use capstan_master::supervisor::Supervisor;
use capstan_worker::config::WorkerConfig;
use capstan_worker::link::{LinkHandle, MasterLink, MasterRunClient};
use capstan_worker::state::StateDir;
use capstan_worker::worker::Worker;

struct Master {
    run_store: Arc<MemoryRunStore>,
    job_store: Arc<MemoryJobStore>,
    supervisor: Arc<Supervisor>,
    scheduler: Arc<JobScheduler>,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Master {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_master() -> Master {
    let mut config = MasterConfig::new("127.0.0.1:0".to_string());
    config.proxy_tick = Duration::from_millis(50);
    config.supervisor_tick = Duration::from_millis(100);

    let run_store = Arc::new(MemoryRunStore::new());
    let job_store = Arc::new(MemoryJobStore::new());
    let worker_store = Arc::new(MemoryWorkerStore::new());
    let authorizer = Arc::new(StaticAuthorizer::new().with_token("secret", "ops"));

    let supervisor = Supervisor::new(
        config,
        run_store.clone(),
        worker_store.clone(),
        authorizer,
    );
    let selector = WorkerSelector::new(Arc::clone(&supervisor), worker_store);
    let scheduler = Arc::new(JobScheduler::new(
        run_store.clone(),
        job_store.clone(),
        Arc::clone(&supervisor),
        selector,
        Duration::from_millis(50),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&supervisor).serve(listener, cancel.clone()));
    tokio::spawn(Arc::clone(&supervisor).update_loop(cancel.clone()));
    {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await });
    }

    Master {
        run_store,
        job_store,
        supervisor,
        scheduler,
        addr,
        cancel,
    }
}

struct WorkerProcess {
    worker: Arc<Worker>,
    _dir: tempfile::TempDir,
}

async fn start_worker(
    master: &Master,
    name: &str,
    properties: WorkerProperties,
    cancel: &CancellationToken,
) -> WorkerProcess {
    let dir = tempfile::tempdir().unwrap();
    let mut config = WorkerConfig::new(name.to_string(), master.addr.to_string());
    config.token = "secret".to_string();
    config.properties = properties;
    config.state_dir = dir.path().join("state");
    config.workspace_dir = dir.path().join("workspace");
    config.sync_interval = Duration::from_millis(50);
    config.pipeline_poll_interval = Duration::from_millis(50);

    let state = Arc::new(StateDir::new(config.state_dir.clone()));
    let link_handle = LinkHandle::new();
    let client = Arc::new(MasterRunClient::new(link_handle.clone()));
    let worker = Worker::new(config.clone(), state, client.clone(), client);
    worker.recover().await.unwrap();

    let link = MasterLink::new(config, worker.clone(), link_handle.clone(), cancel.clone());
    tokio::spawn(async move { link.run().await });
    tokio::spawn(Arc::clone(&worker).sync_loop(link_handle, cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !master.supervisor.is_worker_available(name).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker {name} never became available"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    WorkerProcess { worker, _dir: dir }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn command_job(name: &str, commands: Vec<Vec<String>>) -> Job {
    Job {
        name: name.into(),
        project: "web".into(),
        definition: JobDefinition::Commands {
            setup: vec![],
            commands,
            teardown: vec![],
        },
        parameters: HashMap::new(),
        properties: JobProperties::default(),
        enabled: true,
    }
}

fn web_worker() -> WorkerProperties {
    WorkerProperties {
        projects: vec!["web".into()],
        is_controller: false,
        executor_limit: 4,
    }
}

async fn wait_for_status(master: &Master, run_id: Uuid, expected: RunStatus) -> Run {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let run = master.run_store.get(run_id).await.unwrap().unwrap();
        if run.status == expected {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} stuck in {:?}, wanted {expected:?}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_clean(master: &Master, process: &WorkerProcess, run_id: Uuid) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let gone = !process.worker.active_runs().await.contains(&run_id);
        if gone {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} never cleaned"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let name = master
        .run_store
        .get(run_id)
        .await
        .unwrap()
        .unwrap()
        .worker
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while master.supervisor.executor_count(&name).await != 0 {
        assert!(tokio::time::Instant::now() < deadline, "executor lingered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_run_round_trip_to_succeeded() {
    let master = start_master().await;
    let cancel = CancellationToken::new();
    let process = start_worker(&master, "worker-1", web_worker(), &cancel).await;

    master
        .job_store
        .insert(command_job("build", vec![sh("echo round trip")]));
    let run = Run::new("web", "build", HashMap::new(), "test");
    let run_id = run.id;
    master.run_store.create(run).await.unwrap();

    let run = wait_for_status(&master, run_id, RunStatus::Succeeded).await;
    assert_eq!(run.worker.as_deref(), Some("worker-1"));
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
    assert_eq!(run.results.as_ref().unwrap()["steps"][0]["outcome"], "succeeded");

    wait_for_clean(&master, &process, run_id).await;

    let log = master.run_store.get_log(run_id, 0).await.unwrap().unwrap();
    assert_eq!(String::from_utf8(log).unwrap(), "round trip\n");

    cancel.cancel();
}

#[tokio::test]
async fn test_failing_run_reports_failed() {
    let master = start_master().await;
    let cancel = CancellationToken::new();
    let process = start_worker(&master, "worker-1", web_worker(), &cancel).await;

    master
        .job_store
        .insert(command_job("flaky", vec![sh("echo boom; exit 2")]));
    let run = Run::new("web", "flaky", HashMap::new(), "test");
    let run_id = run.id;
    master.run_store.create(run).await.unwrap();

    wait_for_status(&master, run_id, RunStatus::Failed).await;
    wait_for_clean(&master, &process, run_id).await;

    let log = master.run_store.get_log(run_id, 0).await.unwrap().unwrap();
    let log = String::from_utf8(log).unwrap();
    assert!(log.contains("boom"), "{log}");

    cancel.cancel();
}

#[tokio::test]
async fn test_abort_round_trip() {
    let master = start_master().await;
    let cancel = CancellationToken::new();
    let process = start_worker(&master, "worker-1", web_worker(), &cancel).await;

    master
        .job_store
        .insert(command_job("long", vec![sh("sleep 120")]));
    let run = Run::new("web", "long", HashMap::new(), "test");
    let run_id = run.id;
    master.run_store.create(run).await.unwrap();

    wait_for_status(&master, run_id, RunStatus::Running).await;
    // Wait until the worker actually holds the run before aborting
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !process.worker.active_runs().await.contains(&run_id) {
        assert!(tokio::time::Instant::now() < deadline, "run never arrived");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(master.scheduler.abort_run(run_id).await.unwrap());

    wait_for_status(&master, run_id, RunStatus::Aborted).await;
    wait_for_clean(&master, &process, run_id).await;

    cancel.cancel();
}

#[tokio::test]
async fn test_pipeline_round_trip_through_controller_worker() {
    let master = start_master().await;
    let cancel = CancellationToken::new();
    let runner = start_worker(&master, "runner-1", web_worker(), &cancel).await;
    let controller = start_worker(
        &master,
        "controller-1",
        WorkerProperties {
            projects: vec!["web".into()],
            is_controller: true,
            executor_limit: 2,
        },
        &cancel,
    )
    .await;

    master
        .job_store
        .insert(command_job("compile", vec![sh("echo compiled")]));
    master
        .job_store
        .insert(command_job("package", vec![sh("echo packaged")]));
    master.job_store.insert(Job {
        name: "release".into(),
        project: "web".into(),
        definition: JobDefinition::Pipeline {
            elements: vec![
                PipelineElement {
                    name: "compile".into(),
                    project: "web".into(),
                    job: "compile".into(),
                    parameters: HashMap::new(),
                    after: vec![],
                },
                PipelineElement {
                    name: "package".into(),
                    project: "web".into(),
                    job: "package".into(),
                    parameters: HashMap::new(),
                    after: vec![ElementGate::on_success("compile")],
                },
            ],
        },
        parameters: HashMap::new(),
        properties: JobProperties {
            is_controller: true,
        },
        enabled: true,
    });

    let run = Run::new("web", "release", HashMap::new(), "test");
    let run_id = run.id;
    master.run_store.create(run).await.unwrap();

    let run = wait_for_status(&master, run_id, RunStatus::Succeeded).await;
    assert_eq!(run.worker.as_deref(), Some("controller-1"));

    let elements = run.results.as_ref().unwrap()["elements"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(elements.len(), 2);
    for element in &elements {
        assert_eq!(element["status"], "succeeded");
    }

    wait_for_clean(&master, &controller, run_id).await;
    drop(runner);

    cancel.cancel();
}
