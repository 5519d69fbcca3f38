use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Identifies one request: the pod it is sent from and where it is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestDescriptor {
    pub source_namespace: String,
    pub source_pod: String,
    /// Opaque to the harness, usually a URL or `host:port`.
    pub destination: String,
}

impl RequestDescriptor {
    pub fn new<S1, S2, S3>(source_namespace: S1, source_pod: S2, destination: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            source_namespace: source_namespace.into(),
            source_pod: source_pod.into(),
            destination: destination.into(),
        }
    }

    /// The outer key used in a [`ResultMap`], `<namespace>/<pod>`.
    pub fn source_key(&self) -> String {
        format!("{}/{}", self.source_namespace, self.source_pod)
    }
}

impl Display for RequestDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source_key(), self.destination)
    }
}

/// The outcome of a single request.
///
/// The default value is the zero result: status `0`, no headers, no error. A status of `0` means
/// the request did not complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(status_code: u16, headers: BTreeMap<String, String>) -> Self {
        Self {
            status_code,
            headers,
            error: None,
        }
    }

    pub fn failed<E>(error: E) -> Self
    where
        E: Display,
    {
        Self {
            status_code: 0,
            headers: BTreeMap::new(),
            error: Some(error.to_string()),
        }
    }

    /// `true` when the request completed without error and returned a 2xx status.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }
}

/// Results keyed by source (`<namespace>/<pod>`) and then by destination. Iteration is ordered by
/// source, then destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMap {
    inner: BTreeMap<String, BTreeMap<String, ProbeResult>>,
}

impl ResultMap {
    /// Inserts the result for `descriptor` and returns the result it replaced, if any.
    pub(crate) fn insert(
        &mut self,
        descriptor: &RequestDescriptor,
        result: ProbeResult,
    ) -> Option<ProbeResult> {
        self.inner
            .entry(descriptor.source_key())
            .or_default()
            .insert(descriptor.destination.clone(), result)
    }

    pub fn get(&self, source_key: &str, destination: &str) -> Option<&ProbeResult> {
        self.inner
            .get(source_key)
            .and_then(|destinations| destinations.get(destination))
    }

    /// Look up the result for a descriptor.
    pub fn result(&self, descriptor: &RequestDescriptor) -> Option<&ProbeResult> {
        self.get(&descriptor.source_key(), &descriptor.destination)
    }

    pub fn source(&self, source_key: &str) -> Option<&BTreeMap<String, ProbeResult>> {
        self.inner.get(source_key)
    }

    /// The number of (source, destination) entries.
    pub fn len(&self) -> usize {
        self.inner.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over `(source, destination, result)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &ProbeResult)> {
        self.inner.iter().flat_map(|(source, destinations)| {
            destinations
                .iter()
                .map(move |(destination, result)| (source.as_str(), destination.as_str(), result))
        })
    }

    /// The entries whose result is not a success.
    pub fn failures(&self) -> Vec<(&str, &str, &ProbeResult)> {
        self.iter().filter(|(_, _, r)| !r.is_success()).collect()
    }
}
