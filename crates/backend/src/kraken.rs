//! The resource kraken: the periodic ingestion loop that reloads bridge
//! descriptors, feeds the resulting resources into the backend, prunes
//! expired ones, and recomputes the distribution gates.

use crate::{BackendConfig, BlockList, Metrics};
use rdsys_api::{
    DynResource, RdError, RdResult, Registry, Resource, SpeedState,
    TestFunc, TestState, Timestamp,
};
use rdsys_core::BackendResources;
use rdsys_resources::{invalid_address, Bridge, Flags, OrAddress, Transport};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How often the kraken reloads the bridge descriptor files.
pub const KRAKEN_TICKER_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Distribute only functional resources once at least this fraction of
/// them is functional. The fraction is low after a restart, when most
/// resources are untested, or when the reachability prober is in
/// trouble.
const MIN_FUNCTIONAL_FRACTION: f64 = 0.5;

/// Same idea for the bandwidth dimension.
const MIN_RATIO_FRACTION: f64 = 0.5;

const TRANSPORT_PREFIX: &str = "transport";
const EXTRA_INFO_PREFIX: &str = "extra-info";
const RECORD_END_PREFIX: &str = "-----END SIGNATURE-----";

/// Run the initial descriptor reload. Called once at startup, before
/// the web api starts answering requests.
pub fn startup(
    config: &BackendConfig,
    resources: &BackendResources,
    registry: &Registry,
    test_func: &TestFunc,
    metrics: &Metrics,
) {
    tracing::info!("Initialising resource kraken.");
    reload_bridge_descriptors(config, resources, registry, test_func);
    calc_tested_resources(resources, metrics);
    update_distributor_metrics(config, resources, metrics);
}

/// The kraken's periodic loop. [startup] must have run already; the
/// first reload of this task happens one ticker interval in.
pub async fn run(
    config: Arc<BackendConfig>,
    resources: Arc<BackendResources>,
    registry: Arc<Registry>,
    test_func: TestFunc,
    metrics: Arc<Metrics>,
) {
    let mut ticker = tokio::time::interval(KRAKEN_TICKER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        tracing::info!("Kraken's ticker is ticking.");
        reload_bridge_descriptors(&config, &resources, &registry, &test_func);
        prune_expired_resources(&resources);
        calc_tested_resources(&resources, &metrics);
        update_distributor_metrics(&config, &resources, &metrics);
        tracing::info!("Backend resources: {}", resources.collection());
    }
}

/// Determine the fraction of each resource state per resource type,
/// expose them via Prometheus, and flip the distribution gates
/// accordingly.
pub fn calc_tested_resources(
    resources: &BackendResources,
    metrics: &Metrics,
) {
    metrics.resources.clear();

    let mut functional_count = 0usize;
    let mut accepted_count = 0usize;
    let mut num_resources = 0usize;

    for (rtype, group) in resources.collection().iter() {
        for r in group.get_all() {
            let test = r.test_result();
            if test.state == TestState::Functional {
                functional_count += 1;
            }
            if test.speed == SpeedState::Accepted {
                accepted_count += 1;
            }
            num_resources += 1;

            metrics
                .resources
                .get_or_create(&crate::ResourceLabels {
                    rtype: rtype.to_string(),
                    functional: test.state.to_string(),
                    ratio: test.speed.to_string(),
                    running: running_flag(&r).to_string(),
                })
                .inc();
        }
    }

    let functional_fraction =
        functional_count as f64 / num_resources as f64;
    let only_functional = functional_fraction >= MIN_FUNCTIONAL_FRACTION;
    metrics
        .distributing_non_functional
        .set(if only_functional { 0 } else { 1 });

    let accepted_fraction = accepted_count as f64 / num_resources as f64;
    let use_bandwidth_ratio = accepted_fraction >= MIN_RATIO_FRACTION;
    metrics
        .ignoring_bandwidth_ratio
        .set(if use_bandwidth_ratio { 0 } else { 1 });

    resources.set_gates(only_functional, use_bandwidth_ratio);
    metrics
        .dropped_diffs
        .set(resources.dropped_diffs() as i64);
}

fn running_flag(r: &DynResource) -> bool {
    // Only bridge flavours carry authority flags; everything else
    // counts as not running for the metrics breakdown.
    r.to_json()["flags"]["running"].as_bool().unwrap_or(false)
}

fn update_distributor_metrics(
    config: &BackendConfig,
    resources: &BackendResources,
    metrics: &Metrics,
) {
    for distributor in config.distribution_proportions.keys() {
        for rtype in config.resources.keys() {
            let state = resources.get(distributor, rtype);
            metrics
                .distributor_resources
                .get_or_create(&crate::DistributorLabels {
                    distributor: distributor.clone(),
                    rtype: rtype.clone(),
                })
                .set(state.working.len() as i64);
        }
    }
}

fn prune_expired_resources(resources: &BackendResources) {
    let types: Vec<String> = resources
        .collection()
        .iter()
        .map(|(rtype, _)| rtype.to_string())
        .collect();
    for rtype in types {
        let orig_len = resources
            .collection()
            .get(&rtype)
            .map(|g| g.len())
            .unwrap_or(0);
        let pruned = resources.prune(&rtype);
        if !pruned.is_empty() {
            tracing::info!(
                "Pruned {} out of {orig_len} resources from {rtype} \
                 hashring.",
                pruned.len(),
            );
        }
    }
}

/// Reload bridges from the network status, bridge descriptors and
/// extra-info files, apply the block list, and feed every resulting
/// resource into the backend. Each file is loaded independently; a
/// missing file is logged and leaves the prior in-memory state intact.
pub fn reload_bridge_descriptors(
    config: &BackendConfig,
    resources: &BackendResources,
    registry: &Registry,
    test_func: &TestFunc,
) {
    let mut bridges =
        match load_bridges_from_networkstatus(&config.networkstatus_file) {
            Ok(bridges) => bridges,
            Err(err) => {
                tracing::warn!("Error loading network statuses: {err}");
                HashMap::new()
            }
        };

    let mut distributor_names = vec!["none".to_string()];
    distributor_names
        .extend(config.distribution_proportions.keys().cloned());

    if let Err(err) = apply_distribution_requests(
        &config.descriptors_file,
        &distributor_names,
        &mut bridges,
    ) {
        tracing::warn!("Error loading bridge descriptors file: {err}");
    }

    let new_file = config.extrainfo_file.with_file_name(format!(
        "{}.new",
        config
            .extrainfo_file
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default(),
    ));
    for filename in [&config.extrainfo_file, &new_file] {
        let descriptors = match load_bridges_from_extrainfo(filename) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                tracing::warn!(
                    "Failed to reload bridge descriptors: {err}",
                );
                continue;
            }
        };
        for (fingerprint, descriptor) in descriptors {
            match bridges.get_mut(&fingerprint) {
                Some(bridge) => bridge.transports = descriptor.transports,
                None => tracing::warn!(
                    "Received extrainfo descriptor for bridge \
                     {fingerprint} but could not find bridge with that \
                     fingerprint",
                ),
            }
        }
    }

    let block_list = match BlockList::load(
        config.blocklist_file.as_deref(),
        config.allowlist_file.as_deref(),
    ) {
        Ok(block_list) => block_list,
        Err(err) => {
            tracing::warn!("Problem loading block list: {err}");
            BlockList::default()
        }
    };

    tracing::info!("Adding {} bridges.", bridges.len());
    for (_, mut bridge) in bridges {
        let blocked_in = block_list.blocked_in(&bridge.fingerprint);

        let transports = std::mem::take(&mut bridge.transports);

        // Only hand out the vanilla flavour if there are no transports.
        if transports.is_empty() {
            let invalid = match &bridge.address {
                Some(addr) => invalid_address(addr),
                None => true,
            };
            if invalid {
                tracing::info!(
                    "Reject vanilla bridge {} as its IP is not valid: \
                     {:?}",
                    bridge.fingerprint,
                    bridge.address,
                );
                continue;
            }
            bridge.set_blocked_in(&blocked_in);
            bridge.set_test_func(test_func.clone());
            resources.add(Arc::new(bridge));
            continue;
        }

        for mut transport in transports {
            transport.flags = bridge.flags;
            transport.distribution = bridge.distribution.clone();
            transport.set_blocked_in(&blocked_in);

            let address_dummy = registry
                .get(transport.resource_type())
                .map(|info| info.address_dummy)
                .unwrap_or(false);
            let invalid = match &transport.address {
                Some(addr) => invalid_address(addr),
                None => true,
            };
            if !address_dummy && invalid {
                tracing::info!(
                    "Reject bridge {} transport {} as its IP is not \
                     valid: {:?}",
                    transport.fingerprint,
                    transport.resource_type(),
                    transport.address,
                );
                set_invalid_address_result(&transport);
            } else {
                transport.set_test_func(test_func.clone());
            }
            resources.add(Arc::new(transport));
        }
    }

    resources.collection().save();
}

/// Mark a resource whose address must not be handed out; it is not
/// submitted for testing.
fn set_invalid_address_result(r: &Transport) {
    let mut test = r.test_state().write().unwrap();
    test.state = TestState::Dysfunctional;
    test.speed = SpeedState::Untested;
    test.last_tested = Some(Timestamp::now());
    test.error = "Bridge address is not valid".to_string();
}

/// Learn about available bridges by parsing a network status file.
pub fn load_bridges_from_networkstatus(
    networkstatus_file: &Path,
) -> RdResult<HashMap<String, Bridge>> {
    let content = std::fs::read_to_string(networkstatus_file)
        .map_err(RdError::persistence)?;
    parse_networkstatus(&content)
}

fn parse_networkstatus(content: &str) -> RdResult<HashMap<String, Bridge>> {
    use base64::prelude::*;

    let mut bridges = HashMap::new();
    let mut current: Option<Bridge> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            if let Some(bridge) = current.take() {
                bridges.insert(bridge.fingerprint.clone(), bridge);
            }

            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 7 {
                return Err(RdError::bad_request(
                    "incorrect number of fields in 'r' line",
                ));
            }
            let identity = BASE64_STANDARD_NO_PAD
                .decode(fields[1])
                .map_err(RdError::bad_request)?;

            let mut bridge = Bridge::new();
            bridge.fingerprint = hex::encode_upper(identity);
            if let Ok(addr) = fields[5].parse() {
                let port = fields[6].parse().unwrap_or(0);
                bridge.address = Some(addr);
                bridge.port = port;
                bridge.or_addresses.push(OrAddress {
                    ip_version: 4,
                    port,
                    address: addr,
                });
            }
            current = Some(bridge);
        } else if let Some(rest) = line.strip_prefix("a ") {
            if let Some(bridge) = current.as_mut() {
                if let Some((host, port)) = rest.trim().rsplit_once(':') {
                    let host =
                        host.trim_start_matches('[').trim_end_matches(']');
                    if let Ok(addr) = host.parse() {
                        bridge.or_addresses.push(OrAddress {
                            ip_version: 6,
                            port: port.parse().unwrap_or(0),
                            address: addr,
                        });
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("s ") {
            if let Some(bridge) = current.as_mut() {
                bridge.flags = parse_flags(rest);
            }
        }
    }
    if let Some(bridge) = current.take() {
        bridges.insert(bridge.fingerprint.clone(), bridge);
    }
    Ok(bridges)
}

fn parse_flags(line: &str) -> Flags {
    let mut flags = Flags::default();
    for flag in line.split_whitespace() {
        match flag {
            "Fast" => flags.fast = true,
            "Stable" => flags.stable = true,
            "Running" => flags.running = true,
            "Valid" => flags.valid = true,
            _ => {}
        }
    }
    flags
}

/// Read each bridge operator's distribution request from the bridge
/// descriptors file and copy it onto the bridges: "any" stays empty, a
/// known distributor name is copied, anything else becomes "none".
pub fn apply_distribution_requests(
    descriptors_file: &Path,
    distributor_names: &[String],
    bridges: &mut HashMap<String, Bridge>,
) -> RdResult<()> {
    let content = std::fs::read_to_string(descriptors_file)
        .map_err(RdError::persistence)?;
    let requests = parse_distribution_requests(&content);

    for (fingerprint, bridge) in bridges.iter_mut() {
        let Some(request) = requests.get(fingerprint) else {
            tracing::warn!(
                "Bridge {fingerprint} from networkstatus not present in \
                 the descriptors file {}",
                descriptors_file.display(),
            );
            continue;
        };
        if request == "any" {
            continue;
        }
        if distributor_names.contains(request) {
            bridge.distribution = request.clone();
        } else {
            tracing::warn!(
                "Bridge {fingerprint} has an unsupported distribution \
                 request: {request}. Setting it to none.",
            );
            bridge.distribution = "none".to_string();
        }
    }
    Ok(())
}

fn parse_distribution_requests(content: &str) -> HashMap<String, String> {
    let mut requests = HashMap::new();
    let mut current_fingerprint: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("router ") {
            current_fingerprint = None;
        } else if let Some(rest) = line.strip_prefix("fingerprint ") {
            current_fingerprint =
                Some(rest.split_whitespace().collect::<String>());
        } else if let Some(rest) =
            line.strip_prefix("bridge-distribution-request ")
        {
            if let Some(fingerprint) = &current_fingerprint {
                requests
                    .insert(fingerprint.clone(), rest.trim().to_string());
            }
        }
    }
    requests
}

/// Load and return bridges (with their transports) from an extra-info
/// file, as produced by the bridge authority.
pub fn load_bridges_from_extrainfo(
    extrainfo_file: &Path,
) -> RdResult<HashMap<String, Bridge>> {
    let content = std::fs::read_to_string(extrainfo_file)
        .map_err(RdError::persistence)?;
    parse_extrainfo_doc(&content)
}

fn parse_extrainfo_doc(content: &str) -> RdResult<HashMap<String, Bridge>> {
    let mut bridges = HashMap::new();
    let mut bridge = Bridge::new();

    for line in content.lines() {
        let line = line.trim();

        // A new extra-info block, i.e. a new bridge.
        if line.starts_with(EXTRA_INFO_PREFIX) {
            let words: Vec<&str> = line.split(' ').collect();
            if words.len() != 3 {
                return Err(RdError::bad_request(
                    "incorrect number of words in 'extra-info' line",
                ));
            }
            bridge.fingerprint = words[2].to_string();
        }

        // A bridge's transport protocols. There may be several.
        if line.starts_with(TRANSPORT_PREFIX) {
            let mut transport = populate_transport_info(line)?;
            transport.fingerprint = bridge.fingerprint.clone();
            bridge.add_transport(transport);
        }

        // Store the bridge when the record ends.
        if line.starts_with(RECORD_END_PREFIX) {
            bridges.insert(
                bridge.fingerprint.clone(),
                std::mem::take(&mut bridge),
            );
        }
    }
    Ok(bridges)
}

/// Parse a transport line of the format
/// `"transport" transportname address:port [arglist]` and return the
/// resulting transport.
fn populate_transport_info(line: &str) -> RdResult<Transport> {
    let words: Vec<&str> = line.split(' ').collect();
    if words.first() != Some(&TRANSPORT_PREFIX) {
        return Err(RdError::bad_request("no 'transport' prefix"));
    }
    if words.len() < 3 {
        return Err(RdError::bad_request(
            "not enough arguments in 'transport' line",
        ));
    }

    let mut transport = Transport::new(words[1]);

    let (host, port) = words[2].rsplit_once(':').ok_or_else(|| {
        RdError::bad_request(format!("malformed address {:?}", words[2]))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    transport.address =
        Some(host.parse().map_err(RdError::bad_request)?);
    transport.port = port.parse().map_err(RdError::bad_request)?;

    // We may be dealing with one or more key=value pairs.
    if words.len() > 3 {
        for arg in words[3].split(',') {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                RdError::bad_request(format!(
                    "key:value pair in {:?} not separated by a '='",
                    words[3],
                ))
            })?;
            transport
                .params
                .insert(key.to_string(), value.to_string());
        }
    }
    Ok(transport)
}

#[cfg(test)]
mod test;
