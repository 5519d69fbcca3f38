use snafu::Snafu;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the harness.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unable to create client: {}", source))]
    ClientCreateKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Unable to read kubeconfig: {}", source))]
    ConfigRead {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display(
        "Command in pod '{}' failed with exit code {:?}: {}",
        pod,
        exit_code,
        stderr
    ))]
    CommandFailed {
        pod: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[snafu(display("Unable to exec into pod '{}': {}", pod, source))]
    Exec { pod: String, source: kube::Error },

    #[snafu(display("Unable to {}: {}", action, source))]
    Io {
        action: String,
        source: std::io::Error,
    },

    #[snafu(display("Unable to {}: {}", action, source))]
    Kube { action: String, source: kube::Error },

    #[snafu(display("Exec session did not provide {}", what))]
    MissingStream { what: String },

    #[snafu(display("Unable to parse curl output: {}", reason))]
    ParseCurl { reason: String },

    #[snafu(display("Unable to read settings from the environment: {}", source))]
    Settings { source: envy::Error },

    #[snafu(display("Timeout after {:?} waiting for {}", duration, what))]
    Timeout { duration: Duration, what: String },
}
