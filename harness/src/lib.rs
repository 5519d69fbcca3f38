/*!

Building blocks for end-to-end tests of a service mesh running in Kubernetes.

The two primitives are [`RepeatedSuccess`], which waits until a probe has succeeded a number of
times in a row, and [`Aggregator`], which issues many independent requests at once and collects
their results. [`TestContext`] wires both to HTTP requests sent with `curl` from inside mesh pods.

!*/

#![deny(
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::panic,
    clippy::panic_in_result_fn,
    clippy::panicking_unwrap,
    clippy::unwrap_in_result,
    clippy::unwrap_used
)]

pub use aggregate::{run_all, Aggregator};
pub use context::TestContext;
pub use error::{Error, Result};
pub use http::{parse_curl_headers, ExecOutput, HttpRequester, KubeExec, PodExec};
pub use poll::{wait_for_repeated_success, RepeatedSuccess, DEFAULT_POLL_INTERVAL};
pub use request::{ProbeResult, RequestDescriptor, ResultMap};
pub use settings::Settings;

pub mod aggregate;
mod context;
mod error;
pub mod http;
pub mod poll;
mod request;
mod settings;
