//! The resource test pool.
//!
//! Resources are accumulated into batches and submitted to two external
//! probers: bridgestrap for reachability and onbasca for bandwidth. A
//! batch is flushed when it reaches capacity or when the flush timer
//! expires, whichever comes first. Flushes run on their own task so the
//! dispatcher keeps consuming submissions.

use rdsys_api::{
    DynResource, RdError, RdResult, Resource, SpeedState, TestFunc,
    TestState, Timestamp,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// The maximum number of resources we buffer before flushing a batch to
/// the probers.
pub const MAX_BATCH: usize = 25;

/// How long a non-full batch may linger before it is flushed.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// A timer deadline that practically counts as "never". Far enough out
/// that an armed-but-idle timer stays silent, close enough to stay
/// within the runtime's timer horizon.
const FAR_IN_THE_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// How many submissions may queue up in front of the dispatcher before
/// further ones are dropped. Ingest never blocks on the pool.
const PENDING_CAPACITY: usize = 512;

/// A request for bridgestrap and onbasca.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeTestRequest {
    /// The bridge lines to test.
    pub bridge_lines: Vec<String>,
}

/// The status of a single bridge in a prober's response.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BridgeTest {
    /// Whether the prober could reach the bridge.
    #[serde(default)]
    pub functional: bool,
    /// When the prober tested the bridge.
    #[serde(default)]
    pub last_tested: Option<Timestamp>,
    /// The measured bandwidth ratio, if any.
    #[serde(default)]
    pub ratio: Option<f64>,
    /// The error the prober hit, empty if none.
    #[serde(default)]
    pub error: String,
}

/// A prober's response.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BridgeTestResponse {
    /// Per-bridge-line results.
    #[serde(default)]
    pub bridge_results: HashMap<String, BridgeTest>,
    /// How long the test run took, in seconds.
    #[serde(default)]
    pub time: f64,
    /// A request-level error, empty if none.
    #[serde(default)]
    pub error: String,
}

/// The ability to test a batch of bridges. Implemented over HTTPS for
/// the real probers and by an in-process dummy in tests.
pub trait Prober: Send + Sync + 'static {
    /// Submit the given bridge lines and return per-line results.
    fn test_bridges(
        &self,
        request: &BridgeTestRequest,
    ) -> RdResult<BridgeTestResponse>;
}

/// Trait-object [Prober].
pub type DynProber = Arc<dyn Prober>;

/// A [Prober] talking JSON over HTTP(S), authenticated with a bearer
/// token.
pub struct HttpProber {
    endpoint: String,
    token: String,
}

impl HttpProber {
    /// Construct a prober for the given endpoint.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> DynProber {
        Arc::new(Self {
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }
}

impl Prober for HttpProber {
    fn test_bridges(
        &self,
        request: &BridgeTestRequest,
    ) -> RdResult<BridgeTestResponse> {
        // The probers expect a GET request carrying a JSON body.
        let response = ureq::request("GET", &self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(request)
            .map_err(RdError::upstream)?;
        response
            .into_json::<BridgeTestResponse>()
            .map_err(RdError::upstream)
    }
}

/// The pool's tuning knobs, overridable in tests.
#[derive(Debug, Clone)]
pub struct TestPoolConfig {
    /// How long a non-full batch may linger.
    pub flush_timeout: Duration,
    /// The batch size that triggers an immediate flush.
    pub max_batch: usize,
    /// Ratios below this threshold get their speed rejected.
    pub bandwidth_ratio_threshold: f64,
}

impl Default for TestPoolConfig {
    fn default() -> Self {
        Self {
            flush_timeout: FLUSH_TIMEOUT,
            max_batch: MAX_BATCH,
            bandwidth_ratio_threshold: 0.75,
        }
    }
}

struct PoolInner {
    config: TestPoolConfig,
    bridgestrap: DynProber,
    onbasca: DynProber,
    in_flight: Mutex<HashSet<String>>,
}

impl PoolInner {
    /// Mark the given bridge line as in flight. Returns false if it
    /// already was, in which case the caller discards the submission.
    fn mark_in_flight(&self, bridge_line: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .insert(bridge_line.to_string())
    }

    fn unmark_in_flight<'a>(
        &self,
        bridge_lines: impl Iterator<Item = &'a String>,
    ) {
        let mut in_flight = self.in_flight.lock().unwrap();
        for line in bridge_lines {
            in_flight.remove(line);
        }
    }
}

/// A pool to which the hashrings add resources until it is time to send
/// them to the probers for testing.
pub struct TestPool {
    pending: mpsc::Sender<DynResource>,
    dispatcher: tokio::task::AbortHandle,
}

impl std::fmt::Debug for TestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPool").finish()
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl TestPool {
    /// Construct a new test pool and start its dispatcher task.
    pub fn new(
        config: TestPoolConfig,
        bridgestrap: DynProber,
        onbasca: DynProber,
    ) -> Self {
        let (pending, rx) = mpsc::channel(PENDING_CAPACITY);
        let inner = Arc::new(PoolInner {
            config,
            bridgestrap,
            onbasca,
            in_flight: Mutex::new(HashSet::new()),
        });
        let dispatcher = tokio::spawn(dispatch(rx, inner)).abort_handle();
        Self {
            pending,
            dispatcher,
        }
    }

    /// The function that is executed when a new resource enters the
    /// backend: it submits the resource to the pool. A full queue drops
    /// the submission; the resource will be re-submitted on its next
    /// ingest cycle.
    pub fn test_func(&self) -> TestFunc {
        let pending = self.pending.clone();
        Arc::new(move |r: DynResource| {
            if pending.try_send(r).is_err() {
                tracing::debug!(
                    "Test pool queue full, dropping submission.",
                );
            }
        })
    }
}

/// Handle incoming resources to be tested, a timer whose expiry signals
/// that it is time to test bridges, and channel closure, indicating
/// shutdown.
async fn dispatch(
    mut pending: mpsc::Receiver<DynResource>,
    inner: Arc<PoolInner>,
) {
    tracing::info!("Starting resource pool dispatcher.");
    let timer = tokio::time::sleep(FAR_IN_THE_FUTURE);
    tokio::pin!(timer);
    let mut batch: HashMap<String, DynResource> = HashMap::new();

    loop {
        tokio::select! {
            () = timer.as_mut() => {
                tracing::info!(
                    "Test pool timer expired. Testing resources.",
                );
                timer.as_mut().reset(
                    tokio::time::Instant::now() + FAR_IN_THE_FUTURE,
                );
                tokio::spawn(test_resources(
                    inner.clone(),
                    std::mem::take(&mut batch),
                ));
            }
            r = pending.recv() => {
                let Some(r) = r else {
                    tracing::info!("Shutting down resource pool dispatcher.");
                    return;
                };
                let bridge_line = r.string_form();
                if !inner.mark_in_flight(&bridge_line) {
                    continue;
                }

                // The first resource after an idle period arms the
                // flush timer.
                if batch.is_empty() {
                    tracing::debug!("Starting test pool timer.");
                    timer.as_mut().reset(
                        tokio::time::Instant::now()
                            + inner.config.flush_timeout,
                    );
                }
                batch.insert(bridge_line, r);

                if batch.len() >= inner.config.max_batch {
                    tracing::info!(
                        "Test pool reached capacity. Resetting timer \
                         and testing resources.",
                    );
                    timer.as_mut().reset(
                        tokio::time::Instant::now() + FAR_IN_THE_FUTURE,
                    );
                    tokio::spawn(test_resources(
                        inner.clone(),
                        std::mem::take(&mut batch),
                    ));
                }
            }
        }
    }
}

/// Put all resources of the batch into a bridgestrap request and an
/// onbasca request, send them in parallel, and write the results back
/// onto the resources.
async fn test_resources(
    inner: Arc<PoolInner>,
    batch: HashMap<String, DynResource>,
) {
    if batch.is_empty() {
        return;
    }

    let request = BridgeTestRequest {
        bridge_lines: batch.keys().cloned().collect(),
    };

    let reachability = {
        let prober = inner.bridgestrap.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || prober.test_bridges(&request))
    };
    let bandwidth = {
        let prober = inner.onbasca.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || prober.test_bridges(&request))
    };
    let (reachability, bandwidth) = tokio::join!(reachability, bandwidth);

    match flatten(reachability) {
        Ok(response) => apply_reachability_results(&batch, &response),
        Err(err) => tracing::warn!("Bridgestrap request failed: {err}"),
    }
    match flatten(bandwidth) {
        Ok(response) => apply_bandwidth_results(
            &batch,
            &response,
            inner.config.bandwidth_ratio_threshold,
        ),
        Err(err) => tracing::warn!("Onbasca request failed: {err}"),
    }

    inner.unmark_in_flight(batch.keys());
}

fn flatten(
    result: Result<RdResult<BridgeTestResponse>, tokio::task::JoinError>,
) -> RdResult<BridgeTestResponse> {
    let response = result.map_err(RdError::upstream)??;
    if !response.error.is_empty() {
        return Err(RdError::upstream(response.error));
    }
    Ok(response)
}

/// Copy bridgestrap's verdicts onto the batched resources.
pub(crate) fn apply_reachability_results(
    batch: &HashMap<String, DynResource>,
    response: &BridgeTestResponse,
) {
    let (mut num_functional, mut num_dysfunctional) = (0, 0);
    for (bridge_line, result) in &response.bridge_results {
        let Some(r) = batch.get(bridge_line) else {
            tracing::warn!(
                "Bug: {bridge_line:?} not in our resource test pool.",
            );
            continue;
        };

        let mut test = r.test_state().write().unwrap();
        if let Some(last_tested) = result.last_tested {
            test.last_tested = Some(last_tested);
        }
        test.error = result.error.clone();
        if result.functional {
            num_functional += 1;
            test.state = TestState::Functional;
        } else {
            num_dysfunctional += 1;
            test.state = TestState::Dysfunctional;
        }
    }
    tracing::info!(
        "Tested {} resources: {num_functional} functional and \
         {num_dysfunctional} dysfunctional.",
        response.bridge_results.len(),
    );
}

/// Copy onbasca's verdicts onto the batched resources.
pub(crate) fn apply_bandwidth_results(
    batch: &HashMap<String, DynResource>,
    response: &BridgeTestResponse,
    threshold: f64,
) {
    let (mut num_accepted, mut num_rejected) = (0, 0);
    for (bridge_line, result) in &response.bridge_results {
        let Some(r) = batch.get(bridge_line) else {
            tracing::warn!(
                "Bug: {bridge_line:?} not in our resource test pool.",
            );
            continue;
        };

        let mut test = r.test_state().write().unwrap();
        if !result.error.is_empty() {
            // Onbasca reports an error for bridges that are not
            // available at the moment they are tested, or that have
            // timed out.
            tracing::info!(
                "Onbasca gave an error testing the bridge: {}",
                result.error,
            );
            test.ratio = None;
            test.speed = SpeedState::Untested;
        } else if result.functional && result.ratio == Some(0.0) {
            // Onbasca queues bridges rather than testing them on
            // request. A functional bridge with a ratio of zero is
            // still queued and must not be rejected.
            test.ratio = None;
            test.speed = SpeedState::Untested;
        } else {
            if result.ratio.unwrap_or(0.0) < threshold {
                test.speed = SpeedState::Rejected;
                num_rejected += 1;
            } else {
                test.speed = SpeedState::Accepted;
                num_accepted += 1;
            }
            test.ratio = result.ratio;
        }
    }
    tracing::info!(
        "Tested {} resources: {num_accepted} have acceptable bandwidth \
         and {num_rejected} have unacceptable bandwidth.",
        response.bridge_results.len(),
    );
}
