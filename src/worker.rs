//! Worker lifecycle: image generation, detached launch, endpoint discovery.
//!
//! Each sandbox gets one long-lived worker process for the lifetime of the
//! client process. The worker program ships with this crate as a template;
//! the registry section (the tuple members' function definitions plus the
//! name-to-function table) is spliced in when the image is written into the
//! sandbox directory. The worker is spawned detached and never reaped; the
//! launcher only waits for its two endpoint files to appear.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::function::RegisteredFn;
use crate::provision::sandbox_python;

/// The worker program image, before registry splicing.
const WORKER_TEMPLATE: &str = include_str!("../scripts/ml3_daemon.py");

/// The direct-invocation driver, before registry splicing.
const DIRECT_TEMPLATE: &str = include_str!("../scripts/ml3_direct.py");

/// Marker line replaced with the generated registry section.
const REGISTRY_MARKER: &str = "### ML3_REGISTRY ###";

/// How long the launcher waits for the worker's endpoints.
const LAUNCH_CEILING: Duration = Duration::from_secs(10);
const LAUNCH_POLL: Duration = Duration::from_millis(10);

/// A running worker's endpoints.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    pub rpc_path: PathBuf,
    pub stream_path: PathBuf,
    pub pid: u32,
}

/// One worker per sandbox for the lifetime of this process, regardless of
/// how many clients point at the same directory.
fn workers() -> &'static Mutex<HashMap<PathBuf, WorkerHandle>> {
    static WORKERS: OnceLock<Mutex<HashMap<PathBuf, WorkerHandle>>> = OnceLock::new();
    WORKERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Generates the registry section: the members' source text followed by the
/// name-to-function table. Opaque members resolve through the template's
/// `_opaque` helper.
pub(crate) fn render_registry(members: &[Arc<RegisteredFn>]) -> String {
    let mut section = String::new();
    for member in members {
        if let Some(source) = &member.source {
            section.push_str(source.trim_end());
            section.push_str("\n\n\n");
        }
    }
    section.push_str("_REGISTRY = {\n");
    for member in members {
        if member.source.is_some() {
            section.push_str(&format!("    \"{0}\": {0},\n", member.name));
        } else {
            section.push_str(&format!("    \"{0}\": _opaque(\"{0}\"),\n", member.name));
        }
    }
    section.push_str("}");
    section
}

/// The worker image for a tuple.
pub(crate) fn render_worker_image(members: &[Arc<RegisteredFn>]) -> String {
    WORKER_TEMPLATE.replace(REGISTRY_MARKER, &render_registry(members))
}

/// The direct-invocation driver for a tuple.
pub(crate) fn render_direct_driver(members: &[Arc<RegisteredFn>]) -> String {
    DIRECT_TEMPLATE.replace(REGISTRY_MARKER, &render_registry(members))
}

/// Starts the worker for `sandbox_id` if this process has not already, and
/// returns its endpoints. Blocks until both endpoint files exist, up to the
/// launch ceiling.
pub(crate) async fn ensure_worker(
    client: &ClientInner,
    sandbox_id: &str,
    members: &[Arc<RegisteredFn>],
) -> Result<WorkerHandle> {
    let ml3_dir = client.ml3_dir();
    let sandbox_dir = ml3_dir.join(sandbox_id);

    let mut workers = workers().lock().await;
    if let Some(handle) = workers.get(&sandbox_dir) {
        debug!("reusing worker pid {} for {sandbox_id}", handle.pid);
        return Ok(handle.clone());
    }

    let rpc_path = ml3_dir.join(format!("{sandbox_id}.rpc.sock"));
    let stream_path = ml3_dir.join(format!("{sandbox_id}.stream.sock"));
    // Endpoints left behind by a previous process would satisfy the wait
    // loop before the new worker binds.
    remove_stale(&rpc_path)?;
    remove_stale(&stream_path)?;

    let image_path = sandbox_dir.join("_ml3_daemon.py");
    tokio::fs::write(&image_path, render_worker_image(members)).await?;

    let python = sandbox_python(&sandbox_dir);
    let mut command = std::process::Command::new(&python);
    command
        .arg(&image_path)
        .env("ML3_RPC_SOCK", &rpc_path)
        .env("ML3_STREAM_SOCK", &stream_path)
        .env("ML3_IS_WINDOWS", if cfg!(windows) { "1" } else { "0" })
        .env("ML3_TIMEOUT", client.timeout_secs.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn()?;
    let pid = child.id();
    debug!("spawned worker pid {pid} for {sandbox_id}");
    // Detached: the child is never waited on.
    drop(child);

    let deadline = tokio::time::Instant::now() + LAUNCH_CEILING;
    while !(rpc_path.exists() && stream_path.exists()) {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::WorkerLaunch {
                sandbox: sandbox_id.to_string(),
            });
        }
        tokio::time::sleep(LAUNCH_POLL).await;
    }

    let handle = WorkerHandle {
        rpc_path,
        stream_path,
        pid,
    };
    workers.insert(sandbox_dir, handle.clone());
    Ok(handle)
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale endpoint {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
