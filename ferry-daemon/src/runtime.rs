use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use ferry_sync::{pipeline, FerryContext, SyncOutcome};

use crate::error::{io_err, DaemonError};
use crate::paths::{run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Last run of each sync, keyed by sync name.
type SyncHistory = HashMap<String, SyncStatus>;

#[derive(Debug, Clone, Serialize)]
struct SyncStatus {
    last_run_at_unix: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_summary: Option<SyncSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

struct SyncJob {
    sync: String,
    trigger: &'static str,
    respond_to: oneshot::Sender<Result<SyncSummary, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub sync: String,
    pub trigger: String,
    pub run_id: String,
    pub mode: String,
    pub synced: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub duration_ms: u128,
}

impl SyncSummary {
    fn new(sync: String, trigger: &str, outcome: &SyncOutcome, duration: Duration) -> Self {
        Self {
            sync,
            trigger: trigger.to_string(),
            run_id: outcome.run_id.to_string(),
            mode: outcome.mode.to_string(),
            synced: outcome.synced.len(),
            unchanged: outcome.unchanged.len(),
            conflicts: outcome.conflicts.len(),
            unresolved: outcome.unresolved().count(),
            failed: outcome.failed.len(),
            duration_ms: duration.as_millis(),
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing("info");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Load the context at `home` and run until stopped.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let ctx = FerryContext::open_at(&home)?;
    run_with_context(ctx).await
}

/// Run the daemon against an already-built context. The socket lives under
/// `ctx.home`.
pub async fn run_with_context(ctx: FerryContext) -> Result<(), DaemonError> {
    let home = ctx.home.clone();
    ensure_runtime_dirs(&home)?;

    let ctx = Arc::new(ctx);
    let history: Arc<RwLock<SyncHistory>> = Arc::new(RwLock::new(HashMap::new()));
    let started_at_unix = unix_seconds_now();

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let schedules = scheduled_syncs(&ctx);
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(schedules, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        let history = history.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(ctx, history, sync_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        let history = history.clone();
        let sync_tx = sync_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                ctx,
                history,
                sync_tx,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(
        home = %home.display(),
        socket = %socket_path(&home).display(),
        syncs = ctx.config.syncs.len(),
        "daemon started"
    );

    let (scheduler_result, processor_result, socket_result, signal_result) = tokio::join!(
        scheduler_handle,
        processor_handle,
        socket_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Enabled syncs with a schedule, and how often each fires.
fn scheduled_syncs(ctx: &FerryContext) -> Vec<(String, Duration)> {
    ctx.config
        .syncs
        .iter()
        .filter(|sync| sync.enabled)
        .filter_map(|sync| Some((sync.name.clone(), sync.schedule?.interval())))
        .collect()
}

async fn scheduler_task(
    schedules: Vec<(String, Duration)>,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut tickers = JoinSet::new();
    for (name, every) in schedules {
        let sync_tx = sync_tx.clone();
        tracing::info!(sync = %name, every_secs = every.as_secs(), "scheduling sync");
        tickers.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick is immediate; wait one full period before the first run.
            interval.tick().await;
            loop {
                interval.tick().await;
                match enqueue_sync(&sync_tx, name.clone(), "schedule").await {
                    Ok(summary) => tracing::info!(
                        sync = %summary.sync,
                        synced = summary.synced,
                        failed = summary.failed,
                        duration_ms = summary.duration_ms,
                        "scheduled sync completed",
                    ),
                    Err(DaemonError::ChannelClosed(_)) => break,
                    Err(err) => tracing::error!(sync = %name, error = %err, "scheduled sync failed"),
                }
            }
        });
    }

    let _ = shutdown_rx.recv().await;
    tickers.shutdown().await;
    Ok(())
}

/// Runs queued syncs one at a time so two runs never overlap.
async fn sync_processor_task(
    ctx: Arc<FerryContext>,
    history: Arc<RwLock<SyncHistory>>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let started = Instant::now();
                let result = pipeline::run_sync(&ctx, &job.sync).await;

                let outcome = result
                    .map(|outcome| {
                        SyncSummary::new(job.sync.clone(), job.trigger, &outcome, started.elapsed())
                    })
                    .map_err(|err| err.to_string());
                let status = SyncStatus {
                    last_run_at_unix: unix_seconds_now(),
                    last_summary: outcome.as_ref().ok().cloned(),
                    last_error: outcome.as_ref().err().cloned(),
                };
                history.write().await.insert(job.sync, status);

                let _ = job.respond_to.send(outcome);
            }
        }
    }

    Ok(())
}

async fn socket_server_task(
    ctx: Arc<FerryContext>,
    history: Arc<RwLock<SyncHistory>>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let history = history.clone();
                let sync_tx = sync_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        ctx,
                        history,
                        sync_tx,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<FerryContext>,
    history: Arc<RwLock<SyncHistory>>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => {
                DaemonResponse::ok(build_status_payload(&ctx, &history, started_at_unix).await)
            }
            "sync" => match request.sync.clone() {
                Some(name) => match enqueue_sync(&sync_tx, name, "socket").await {
                    Ok(summary) => DaemonResponse::ok(json!(summary)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                },
                None => DaemonResponse::error("sync requires a sync name"),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(
    ctx: &FerryContext,
    history: &RwLock<SyncHistory>,
    started_at_unix: u64,
) -> Value {
    let history = history.read().await.clone();

    let syncs: Vec<Value> = ctx
        .config
        .syncs
        .iter()
        .map(|sync| {
            let status = history.get(&sync.name);
            json!({
                "name": sync.name,
                "source": sync.source_environment,
                "target": sync.target_environment,
                "mode": sync.mode,
                "enabled": sync.enabled,
                "every_secs": sync.schedule.map(|s| s.every_secs),
                "last_run_at_unix": status.map(|s| s.last_run_at_unix).unwrap_or(0),
                "last_summary": status.and_then(|s| s.last_summary.clone()),
                "last_error": status.and_then(|s| s.last_error.clone()),
            })
        })
        .collect();

    let last_sync_at_unix = history
        .values()
        .map(|s| s.last_run_at_unix)
        .max()
        .unwrap_or(0);

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": started_at_unix,
        "last_sync_at_unix": last_sync_at_unix,
        "syncs": syncs,
        "socket": socket_path(&ctx.home).display().to_string(),
    })
}

async fn enqueue_sync(
    sync_tx: &mpsc::Sender<SyncJob>,
    sync: String,
    trigger: &'static str,
) -> Result<SyncSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            sync,
            trigger,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
    outcome.map_err(DaemonError::Protocol)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber: `RUST_LOG` wins, otherwise `default`.
/// Later calls are no-ops.
pub fn init_tracing(default: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::memory::MemoryRegistry;
    use ferry_core::{
        FerryConfig, ModuleRecord, ModuleStatus, Payload, RegistrySet, Schedule,
        SyncConfiguration,
    };
    use tempfile::TempDir;

    fn context(home: &Path, syncs: Vec<SyncConfiguration>) -> FerryContext {
        let record = ModuleRecord::new("dao", "1.0.0", ModuleStatus::Testing, Payload::new());
        let registries = RegistrySet::new()
            .with(Arc::new(MemoryRegistry::new("staging").with_records([record])))
            .with(Arc::new(MemoryRegistry::new("production")));
        let mut config = FerryConfig::default();
        config.execution.backoff_ms = 0;
        config.execution.max_backoff_ms = 0;
        config.syncs = syncs;
        FerryContext::with_registries(home, config, registries)
    }

    fn scheduled(name: &str, every_secs: u64, enabled: bool) -> SyncConfiguration {
        let mut sync = SyncConfiguration::new(name, "staging", "production");
        sync.schedule = Some(Schedule { every_secs });
        sync.enabled = enabled;
        sync
    }

    #[test]
    fn only_enabled_scheduled_syncs_are_scheduled() {
        let home = TempDir::new().expect("home");
        let ctx = context(
            home.path(),
            vec![
                scheduled("hourly", 3600, true),
                scheduled("paused", 60, false),
                SyncConfiguration::new("manual", "staging", "production"),
            ],
        );
        assert_eq!(
            scheduled_syncs(&ctx),
            vec![("hourly".to_string(), Duration::from_secs(3600))]
        );
    }

    #[tokio::test]
    async fn processor_records_history_and_answers_each_job() {
        let home = TempDir::new().expect("home");
        let ctx = Arc::new(context(home.path(), vec![scheduled("hourly", 3600, true)]));
        let history = Arc::new(RwLock::new(SyncHistory::new()));
        let (sync_tx, sync_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);

        let processor = tokio::spawn(sync_processor_task(
            ctx.clone(),
            history.clone(),
            sync_rx,
            shutdown_tx.subscribe(),
        ));

        let summary = enqueue_sync(&sync_tx, "hourly".into(), "test").await.expect("sync");
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.trigger, "test");

        let err = enqueue_sync(&sync_tx, "ghost".into(), "test").await.unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");

        {
            let history = history.read().await;
            assert!(history["hourly"].last_summary.is_some());
            assert!(history["ghost"].last_error.is_some());
        }

        let payload = build_status_payload(&ctx, &history, 1_000).await;
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000u64));
        assert_eq!(payload["syncs"][0]["name"], json!("hourly"));
        assert_eq!(payload["syncs"][0]["every_secs"], json!(3600u64));
        assert_eq!(payload["syncs"][0]["last_summary"]["synced"], json!(1));

        shutdown_tx.send(()).expect("shutdown");
        processor.await.expect("join").expect("processor");
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_waits_one_period_before_first_run() {
        let (sync_tx, mut sync_rx) = mpsc::channel::<SyncJob>(4);
        let (shutdown_tx, _) = broadcast::channel(1);
        let scheduler = tokio::spawn(scheduler_task(
            vec![("hourly".to_string(), Duration::from_secs(3600))],
            sync_tx,
            shutdown_tx.subscribe(),
        ));

        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(sync_rx.try_recv().is_err(), "no run before the first period");

        tokio::time::sleep(Duration::from_secs(1801)).await;
        let job = sync_rx.recv().await.expect("scheduled job");
        assert_eq!(job.sync, "hourly");
        assert_eq!(job.trigger, "schedule");
        drop(job);

        shutdown_tx.send(()).expect("shutdown");
        scheduler.await.expect("join").expect("scheduler");
    }
}
