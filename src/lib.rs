//! # ml3
//!
//! Run Python functions from Rust inside isolated, per-function-group
//! virtualenv sandboxes, with each sandbox served by a persistent worker
//! process. The worker's stdout and stderr stream back to the caller's
//! terminal while the call runs, and return values come back as if the
//! call were local. Large contiguous numeric arrays come back through
//! shared memory, without copying the bytes over the wire.
//!
//! ## Overview
//!
//! A registered function carries its source text and an explicit package
//! set; further packages are inferred by statically parsing the source for
//! imports. When a call passes one registered function to another, both are
//! grouped into a *tuple* that shares a sandbox provisioned with the union
//! of their dependencies, so nested calls never hit a missing import.
//!
//! ## Architecture
//!
//! The crate is organized around the call path:
//!
//! - [`Ml3`] / [`PyFunction`] / [`FuncHandle`] - registration and the call
//!   surface ([`client`], [`function`])
//! - [`inference`] - static import extraction (tree-sitter)
//! - provisioning - tuple to manifest to virtualenv to installer, cached on
//!   disk under `.ml3/` and reused across processes
//! - worker - one detached Python daemon per sandbox, serving sequential
//!   calls over a control socket and a stream socket
//! - [`logger`] - the colored four-channel logger ([`Logger`])
//! - [`shm`] - zero-copy array views ([`SharedArray`])
//!
//! ## Quick start
//!
//! ```no_run
//! use ml3::{CallArg, CallArgs, Ml3, PyFunction};
//!
//! #[tokio::main]
//! async fn main() -> ml3::Result<()> {
//!     let client = Ml3::new();
//!
//!     let load_data = client.register(
//!         PyFunction::from_source(
//!             r#"
//! def load_data():
//!     import numpy as np
//!     import pandas as pd
//!     return pd.DataFrame({"x": np.arange(5) * 2})
//! "#,
//!         )
//!         .packages(["pandas"]),
//!     )?;
//!
//!     let assess = client.register(PyFunction::from_source(
//!         r#"
//! def assess(loader):
//!     import numpy as np
//!     df = loader()
//!     print(df["x"])
//!     return float(np.mean(df["x"]))
//! "#,
//!     ))?;
//!
//!     // Provisions .ml3/assess-load_data on first use, then dispatches to
//!     // its worker. The print() above appears on this process's stdout.
//!     let mean = assess
//!         .call(CallArgs::new().arg(CallArg::func(&load_data)))
//!         .await?;
//!     println!("mean {:?}", mean.as_f64());
//!     Ok(())
//! }
//! ```
//!
//! ## On-disk layout
//!
//! Everything lives under `.ml3/` beneath the configured base directory:
//! `<id>.txt` (the manifest: identifier line, then one package per line),
//! `<id>/` (the virtualenv, with the worker image written inside), and
//! `<id>.rpc.sock` / `<id>.stream.sock` (the worker's endpoints; on
//! Windows these are files holding the bound loopback ports).
//!
//! ## Workers
//!
//! Workers are started lazily on the first call into their sandbox and are
//! intentionally left running: they are detached from the client and serve
//! one call at a time for as long as the program keeps calling. Inside a
//! worker `ML3_IN_DAEMON=1` is set, which makes any nested client degrade
//! to direct in-process invocation instead of sandboxing recursively.

pub mod client;
mod codec;
mod dispatch;
pub mod error;
pub mod function;
pub mod inference;
pub mod logger;
mod provision;
pub mod shm;
mod worker;

// Re-export the types most client programs need.

pub use client::{Ml3, Ml3Builder, RemoteValue};
pub use error::{Error, RemoteException, Result};
pub use function::{CallArg, CallArgs, FuncHandle, PyFunction};
pub use logger::{LogLevel, Logger};
pub use shm::{Dtype, Element, SharedArray};
