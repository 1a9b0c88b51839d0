//! Registered functions and call arguments.
//!
//! A [`PyFunction`] describes a unit of Python computation: source text (or
//! a dotted path for source-less builtins) plus explicitly declared
//! packages. Registering it with an [`Ml3`](crate::Ml3) client yields a
//! cheap-to-clone [`FuncHandle`] carrying the resolved dependency set.
//! Passing a handle as an argument to another handle's call groups both
//! into the same sandbox.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::client::Ml3;
use crate::codec::{CallRecord, FN_MARKER_KEY};
use crate::error::{Error, Result};
use crate::{RemoteValue, dispatch, inference, provision};

/// A function specification awaiting registration.
#[derive(Debug, Clone)]
pub struct PyFunction {
    body: Body,
    packages: BTreeSet<String>,
}

#[derive(Debug, Clone)]
enum Body {
    Source(String),
    Opaque(String),
}

impl PyFunction {
    /// A function defined by Python source text. The display name is taken
    /// from the first top-level `def`.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            body: Body::Source(source.into()),
            packages: BTreeSet::new(),
        }
    }

    /// A source-less callable referenced by dotted path (`"len"`,
    /// `"math.sqrt"`), resolved inside the worker. Only explicitly declared
    /// packages apply.
    pub fn opaque(path: impl Into<String>) -> Self {
        Self {
            body: Body::Opaque(path.into()),
            packages: BTreeSet::new(),
        }
    }

    /// Declares explicit package dependencies.
    pub fn packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub(crate) fn into_registered(self, logger: &crate::Logger) -> Result<RegisteredFn> {
        let (name, source) = match self.body {
            Body::Source(source) => {
                let name = inference::top_level_function_name(&source).ok_or_else(|| {
                    Error::Registration(
                        "source must be valid Python defining a top-level function".to_string(),
                    )
                })?;
                (name, Some(source))
            }
            Body::Opaque(path) => {
                validate_dotted_path(&path)?;
                (path, None)
            }
        };
        let inferred = inference::inferred_dependencies(logger, &name, source.as_deref());
        Ok(RegisteredFn {
            name,
            source,
            explicit: self.packages,
            inferred,
        })
    }
}

fn validate_dotted_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            let mut chars = segment.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::Registration(format!(
            "'{path}' is not a dotted Python path"
        )))
    }
}

/// A registered function: display name, optional source, and the explicit
/// and inferred package sets.
#[derive(Debug)]
pub(crate) struct RegisteredFn {
    pub name: String,
    pub source: Option<String>,
    pub explicit: BTreeSet<String>,
    pub inferred: BTreeSet<String>,
}

impl RegisteredFn {
    /// Union of the explicit and inferred sets.
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.explicit.union(&self.inferred).cloned().collect()
    }
}

/// A handle to a registered function. Clones share the registration.
#[derive(Clone)]
pub struct FuncHandle {
    pub(crate) func: Arc<RegisteredFn>,
    pub(crate) client: Ml3,
}

impl std::fmt::Debug for FuncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncHandle")
            .field("name", &self.func.name)
            .field("dependencies", &self.func.dependencies())
            .finish()
    }
}

impl FuncHandle {
    /// The display name used in tuple identifiers and worker registries.
    pub fn name(&self) -> &str {
        &self.func.name
    }

    /// The function's full dependency set (explicit ∪ inferred).
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.func.dependencies()
    }

    /// Executes the function in its sandbox and returns the result.
    ///
    /// The sandbox is derived from this function plus every registered
    /// function passed in `args`; it is provisioned on first use and its
    /// worker is started lazily and reused. The worker's stdout and stderr
    /// appear on the caller's stdout while the call runs.
    ///
    /// When the client carries the already-remote token, the call degrades
    /// to a direct invocation under the ambient interpreter: no sandbox, no
    /// worker, no sockets.
    pub async fn call(&self, args: CallArgs) -> Result<RemoteValue> {
        let inner = self.client.inner();
        let plan = provision::resolve(&self.func, &args);
        let record = CallRecord {
            function: self.func.name.clone(),
            args: args.positional.iter().map(CallArg::encode).collect(),
            kwargs: args
                .named
                .iter()
                .map(|(k, v)| (k.clone(), v.encode()))
                .collect(),
        };
        if inner.already_remote {
            return dispatch::run_direct(inner, &plan.members, record).await;
        }
        let sandbox_id = provision::ensure(inner, &plan).await?;
        dispatch::dispatch(inner, &sandbox_id, &plan.members, record).await
    }
}

/// One argument: a JSON value or a registered function.
#[derive(Debug, Clone)]
pub enum CallArg {
    Json(Value),
    Function(FuncHandle),
}

impl CallArg {
    pub fn json(value: impl Into<Value>) -> Self {
        CallArg::Json(value.into())
    }

    pub fn func(handle: &FuncHandle) -> Self {
        CallArg::Function(handle.clone())
    }

    fn encode(&self) -> Value {
        match self {
            CallArg::Json(value) => value.clone(),
            CallArg::Function(handle) => {
                let mut marker = serde_json::Map::new();
                marker.insert(
                    FN_MARKER_KEY.to_string(),
                    Value::String(handle.func.name.clone()),
                );
                Value::Object(marker)
            }
        }
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        CallArg::Json(value)
    }
}

impl From<&FuncHandle> for CallArg {
    fn from(handle: &FuncHandle) -> Self {
        CallArg::func(handle)
    }
}

macro_rules! call_arg_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for CallArg {
            fn from(value: $ty) -> Self {
                CallArg::Json(Value::from(value))
            }
        })*
    };
}

call_arg_from!(bool, i32, i64, u32, f64, &str, String);

/// Positional and named arguments for one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub(crate) positional: Vec<CallArg>,
    pub(crate) named: Vec<(String, CallArg)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<CallArg>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Appends a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<CallArg>) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }

    /// Every registered function among the arguments, in insertion order.
    pub(crate) fn function_args(&self) -> impl Iterator<Item = &FuncHandle> {
        self.positional
            .iter()
            .chain(self.named.iter().map(|(_, v)| v))
            .filter_map(|arg| match arg {
                CallArg::Function(handle) => Some(handle),
                CallArg::Json(_) => None,
            })
    }
}
