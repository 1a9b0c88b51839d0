//! The client object: configuration, registration, and call results.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::function::{FuncHandle, PyFunction};
use crate::logger::Logger;
use crate::shm::SharedArray;

/// Client for registering functions and running them in sandboxes.
///
/// Clones share configuration and state; the client is cheap to pass
/// around. See the crate docs for a walkthrough.
#[derive(Clone)]
pub struct Ml3 {
    inner: Arc<ClientInner>,
}

/// Shared client state. One per [`Ml3`] and all its clones.
pub(crate) struct ClientInner {
    pub logger: Logger,
    pub base_dir: PathBuf,
    pub python: String,
    pub timeout_secs: u64,
    pub already_remote: bool,
}

impl ClientInner {
    /// The working directory root, `<base>/.ml3/`.
    pub fn ml3_dir(&self) -> PathBuf {
        self.base_dir.join(".ml3")
    }
}

impl Ml3 {
    /// A client with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> Ml3Builder {
        Ml3Builder::default()
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    /// Registers a function and returns its handle.
    ///
    /// Registration parses the source (if any) for imports and records the
    /// dependency set; nothing touches the filesystem until the first call.
    pub fn register(&self, function: PyFunction) -> Result<FuncHandle> {
        let func = function.into_registered(&self.inner.logger)?;
        tracing::debug!(
            "registered '{}' with dependencies {:?}",
            func.name,
            func.dependencies()
        );
        Ok(FuncHandle {
            func: Arc::new(func),
            client: self.clone(),
        })
    }
}

impl Default for Ml3 {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Ml3`].
pub struct Ml3Builder {
    logger: Logger,
    base_dir: PathBuf,
    python: String,
    timeout_secs: u64,
    already_remote: Option<bool>,
}

impl Default for Ml3Builder {
    fn default() -> Self {
        let python = if cfg!(windows) { "python" } else { "python3" };
        Self {
            logger: Logger::default(),
            base_dir: PathBuf::from("."),
            python: python.to_string(),
            timeout_secs: 0,
            already_remote: None,
        }
    }
}

impl Ml3Builder {
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Directory beneath which `.ml3/` is created. Defaults to the current
    /// directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Interpreter used to create virtualenvs and for direct invocations.
    pub fn python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Wall-clock ceiling passed to workers, in seconds. 0 disables it.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Overrides the already-remote token. When unset it is seeded from
    /// `ML3_IN_DAEMON=1`, so code running inside a worker degrades to
    /// direct invocations instead of sandboxing recursively.
    pub fn already_remote(mut self, yes: bool) -> Self {
        self.already_remote = Some(yes);
        self
    }

    pub fn build(self) -> Ml3 {
        let already_remote = self
            .already_remote
            .unwrap_or_else(|| std::env::var("ML3_IN_DAEMON").is_ok_and(|v| v == "1"));
        Ml3 {
            inner: Arc::new(ClientInner {
                logger: self.logger,
                base_dir: self.base_dir,
                python: self.python,
                timeout_secs: self.timeout_secs,
                already_remote,
            }),
        }
    }
}

/// A call's result: a plain JSON value or a zero-copy array view.
#[derive(Debug)]
pub enum RemoteValue {
    Json(Value),
    Array(SharedArray),
}

impl RemoteValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RemoteValue::Json(value) => Some(value),
            RemoteValue::Array(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            RemoteValue::Json(value) => Some(value),
            RemoteValue::Array(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(Value::as_f64)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(Value::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    pub fn as_array(&self) -> Option<&SharedArray> {
        match self {
            RemoteValue::Array(array) => Some(array),
            RemoteValue::Json(_) => None,
        }
    }

    pub fn into_array(self) -> Option<SharedArray> {
        match self {
            RemoteValue::Array(array) => Some(array),
            RemoteValue::Json(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use crate::CallArgs;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_builder_defaults() {
        let client = Ml3::new();
        assert_eq!(client.inner().base_dir, PathBuf::from("."));
        assert_eq!(client.inner().timeout_secs, 0);
        assert_eq!(client.inner().ml3_dir(), PathBuf::from("./.ml3"));
    }

    #[test]
    fn test_handles_share_registration() {
        let client = Ml3::new();
        let f = client
            .register(PyFunction::from_source("def f():\n    return 1\n"))
            .unwrap();
        let g = f.clone();
        assert_eq!(f.name(), g.name());
        assert_eq!(f.dependencies(), g.dependencies());
    }

    #[test]
    fn test_remote_value_accessors() {
        let value = RemoteValue::Json(json!(4.0));
        assert_eq!(value.as_f64(), Some(4.0));
        assert!(value.as_array().is_none());
        assert_eq!(value.into_json(), Some(json!(4.0)));

        let text = RemoteValue::Json(json!("done"));
        assert_eq!(text.as_str(), Some("done"));
        assert_eq!(text.as_i64(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_already_remote_degrades_without_sandboxing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        // Stand-in interpreter: writes a canned OK reply into the result
        // file (third argument) without touching anything else.
        let fake_python = dir.path().join("fake-python");
        std::fs::write(&fake_python, "#!/bin/sh\necho '[\"OK\", 7]' > \"$3\"\n").unwrap();
        std::fs::set_permissions(&fake_python, std::fs::Permissions::from_mode(0o755)).unwrap();

        let base = dir.path().join("workdir");
        std::fs::create_dir(&base).unwrap();
        let client = Ml3::builder()
            .logger(Logger::new(LogLevel::Error))
            .base_dir(&base)
            .python(fake_python.display().to_string())
            .already_remote(true)
            .build();

        let f = client
            .register(PyFunction::from_source("def f():\n    return 7\n"))
            .unwrap();
        let result = f.call(CallArgs::new()).await.unwrap();
        assert_eq!(result.as_i64(), Some(7));

        // Degraded call: no working directory, no manifest, no endpoints.
        assert!(!base.join(".ml3").exists());
    }
}
