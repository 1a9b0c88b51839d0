//! Tuple resolution and sandbox provisioning.
//!
//! A call's sandbox is determined by its *tuple*: the called function plus
//! every registered function passed as an argument. The tuple identifier
//! keys everything on disk under `.ml3/`: the manifest (`<id>.txt`), the
//! virtualenv (`<id>/`), and the worker endpoints. An existing manifest is
//! authoritative: the package set is never recomputed for it and the
//! installer is not re-run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use console::{Term, style};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::Result;
use crate::function::{CallArgs, RegisteredFn};

/// First-line prefix marking a manifest as provisioned.
const MANIFEST_PREFIX: &str = "# venv: ";

/// How many installer lines stay visible in the scrolling pane.
const PANE_LINES: usize = 8;

/// The resolved tuple for one invocation.
#[derive(Debug)]
pub(crate) struct SandboxPlan {
    /// Sorted member names joined with '-'.
    pub sandbox_id: String,
    /// Tuple members sorted by name, deduplicated.
    pub members: Vec<Arc<RegisteredFn>>,
    /// Union of the members' dependency sets.
    pub packages: BTreeSet<String>,
}

/// Forms the tuple from the called function and its registered-function
/// arguments, and derives the sandbox identifier and combined package set.
pub(crate) fn resolve(root: &Arc<RegisteredFn>, args: &CallArgs) -> SandboxPlan {
    let mut members: BTreeMap<&str, Arc<RegisteredFn>> = BTreeMap::new();
    members.insert(root.name.as_str(), Arc::clone(root));
    for handle in args.function_args() {
        members
            .entry(handle.func.name.as_str())
            .or_insert_with(|| Arc::clone(&handle.func));
    }

    let sandbox_id = members.keys().copied().collect::<Vec<_>>().join("-");
    let packages = members
        .values()
        .flat_map(|member| member.dependencies())
        .collect();
    SandboxPlan {
        sandbox_id,
        members: members.into_values().collect(),
        packages,
    }
}

/// Path of the interpreter inside a sandbox directory.
pub(crate) fn sandbox_python(sandbox_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        sandbox_dir.join("Scripts").join("python.exe")
    } else {
        sandbox_dir.join("bin").join("python")
    }
}

/// Ensures the sandbox for `plan` exists and is provisioned, returning the
/// sandbox identifier to dispatch into (an existing manifest may record a
/// legacy identifier, which is preserved).
pub(crate) async fn ensure(client: &ClientInner, plan: &SandboxPlan) -> Result<String> {
    let ml3_dir = client.ml3_dir();
    tokio::fs::create_dir_all(&ml3_dir).await?;

    client
        .logger
        .info(format!("Running tuple: {}", plan.sandbox_id));

    let manifest = ml3_dir.join(format!("{}.txt", plan.sandbox_id));
    if let Some(recorded) = recorded_sandbox_id(&manifest).await? {
        debug!("manifest {} already provisioned", manifest.display());
        return Ok(recorded);
    }

    write_manifest(&manifest, &plan.sandbox_id, &plan.packages)?;

    let sandbox_dir = ml3_dir.join(&plan.sandbox_id);
    if !sandbox_dir.exists() {
        debug!("creating virtualenv at {}", sandbox_dir.display());
        let status = tokio::process::Command::new(&client.python)
            .arg("-m")
            .arg("venv")
            .arg(&sandbox_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(client
                .logger
                .error(format!("venv creation failed for {}", plan.sandbox_id)));
        }
    }

    install(client, &plan.sandbox_id, &manifest, &sandbox_dir).await?;
    Ok(plan.sandbox_id.clone())
}

/// Reads the identifier recorded in an existing manifest, if any.
async fn recorded_sandbox_id(manifest: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(manifest).await {
        Ok(contents) => {
            let first = contents.lines().next().unwrap_or("");
            Ok(first
                .strip_prefix(MANIFEST_PREFIX)
                .map(|id| id.trim().to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically writes the manifest: the identifier line, then the sorted
/// package set one per line.
fn write_manifest(manifest: &Path, sandbox_id: &str, packages: &BTreeSet<String>) -> Result<()> {
    let dir = manifest.parent().expect("manifest lives under .ml3/");
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    writeln!(tmp, "{MANIFEST_PREFIX}{sandbox_id}")?;
    for package in packages {
        writeln!(tmp, "{package}")?;
    }
    tmp.persist(manifest).map_err(|e| e.error)?;
    Ok(())
}

/// Runs the installer synchronously, rendering its merged stdout/stderr in
/// a bounded scrolling pane.
async fn install(
    client: &ClientInner,
    sandbox_id: &str,
    manifest: &Path,
    sandbox_dir: &Path,
) -> Result<()> {
    let python = sandbox_python(sandbox_dir);
    println!("{} Installing dependencies", style("⟲").cyan());

    let mut child = tokio::process::Command::new(&python)
        .arg("-m")
        .arg("pip")
        .arg("install")
        .arg("-r")
        .arg(manifest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = LinesStream::new(BufReader::new(child.stdout.take().expect("piped")).lines());
    let stderr = LinesStream::new(BufReader::new(child.stderr.take().expect("piped")).lines());
    let mut merged = futures::stream::select(stdout, stderr);

    let term = Term::stdout();
    let mut pane: VecDeque<String> = VecDeque::with_capacity(PANE_LINES);
    let mut printed = 0usize;
    while let Some(line) = merged.next().await {
        let line = line.unwrap_or_default();
        if pane.len() == PANE_LINES {
            pane.pop_front();
        }
        pane.push_back(line);
        if term.is_term() {
            if printed > 0 {
                term.move_cursor_up(printed)?;
            }
            for shown in &pane {
                term.clear_line()?;
                term.write_line(&format!("{} {}", style("│").dim(), style(shown).dim()))?;
            }
            printed = pane.len();
        } else {
            // Plain scrolling when stdout is not a terminal.
            println!("│ {}", pane.back().expect("just pushed"));
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(client
            .logger
            .error(format!("pip install failed for {sandbox_id}")));
    }
    client
        .logger
        .ok(format!("Finished installing into venv: {sandbox_id}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{CallArg, PyFunction};
    use crate::logger::{LogLevel, Logger};
    use crate::{CallArgs, Ml3};
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> Ml3 {
        Ml3::builder()
            .logger(Logger::new(LogLevel::Error))
            .base_dir(dir.path())
            .build()
    }

    fn registered(client: &Ml3, source: &str) -> Arc<RegisteredFn> {
        client
            .register(PyFunction::from_source(source))
            .unwrap()
            .func
    }

    #[test]
    fn test_tuple_identifier_is_sorted_names() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let loader = client
            .register(PyFunction::from_source("def load_data():\n    return 0\n"))
            .unwrap();
        let assess = registered(&client, "def assess(loader):\n    return loader()\n");

        let args = CallArgs::new().arg(&loader);
        let plan = resolve(&assess, &args);
        assert_eq!(plan.sandbox_id, "assess-load_data");
        let names: Vec<&str> = plan.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["assess", "load_data"]);
    }

    #[test]
    fn test_tuple_unions_dependencies() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let loader = client
            .register(
                PyFunction::from_source("def load_data():\n    import pandas\n    return 0\n")
                    .packages(["pyarrow"]),
            )
            .unwrap();
        let assess = registered(
            &client,
            "def assess(loader):\n    import sklearn\n    return loader()\n",
        );

        let plan = resolve(&assess, &CallArgs::new().arg(&loader));
        let packages: Vec<&str> = plan.packages.iter().map(String::as_str).collect();
        assert_eq!(packages, vec!["numpy", "pandas", "pyarrow", "sklearn"]);
    }

    #[test]
    fn test_singleton_tuple() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let f = registered(&client, "def solo():\n    return 0\n");
        let plan = resolve(&f, &CallArgs::new().arg(CallArg::json(1)));
        assert_eq!(plan.sandbox_id, "solo");
        assert_eq!(plan.members.len(), 1);
    }

    #[test]
    fn test_manifest_format() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("assess-load_data.txt");
        let packages: BTreeSet<String> = ["pandas", "numpy"]
            .into_iter()
            .map(String::from)
            .collect();
        write_manifest(&manifest, "assess-load_data", &packages).unwrap();

        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert_eq!(contents, "# venv: assess-load_data\nnumpy\npandas\n");
    }

    #[tokio::test]
    async fn test_existing_manifest_short_circuits() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("demo.txt");
        std::fs::write(&manifest, "# venv: demo\nnumpy\n").unwrap();
        let recorded = recorded_sandbox_id(&manifest).await.unwrap();
        assert_eq!(recorded.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn test_legacy_identifier_preserved() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("demo.txt");
        std::fs::write(&manifest, "# venv: renamed-elsewhere\nnumpy\n").unwrap();
        let recorded = recorded_sandbox_id(&manifest).await.unwrap();
        assert_eq!(recorded.as_deref(), Some("renamed-elsewhere"));
    }

    #[tokio::test]
    async fn test_manifest_without_prefix_is_not_provisioned() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("demo.txt");
        std::fs::write(&manifest, "numpy\npandas\n").unwrap();
        assert_eq!(recorded_sandbox_id(&manifest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        // A pre-provisioned manifest must short-circuit before any
        // interpreter or installer runs: a client configured with an
        // unrunnable interpreter still succeeds.
        let dir = TempDir::new().unwrap();
        let client = Ml3::builder()
            .logger(Logger::new(LogLevel::Error))
            .base_dir(dir.path())
            .python("/nonexistent/python")
            .build();
        let f = registered(&client, "def solo():\n    return 0\n");
        let plan = resolve(&f, &CallArgs::new());

        let ml3_dir = dir.path().join(".ml3");
        std::fs::create_dir_all(&ml3_dir).unwrap();
        std::fs::write(ml3_dir.join("solo.txt"), "# venv: solo\nnumpy\n").unwrap();

        let first = ensure(client.inner(), &plan).await.unwrap();
        let second = ensure(client.inner(), &plan).await.unwrap();
        assert_eq!(first, "solo");
        assert_eq!(second, "solo");

        let contents = std::fs::read_to_string(ml3_dir.join("solo.txt")).unwrap();
        assert_eq!(contents, "# venv: solo\nnumpy\n");
    }
}
