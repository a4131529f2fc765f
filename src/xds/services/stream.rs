//! State of the world xDS stream loop
//!
//! One loop runs per gRPC stream. It answers discovery requests from the
//! published snapshot of the node's group, detects ACKs and NACKs through the
//! nonce and version Envoy echoes back, and pushes every newly published
//! snapshot for the resource types the client subscribed to.

use std::collections::HashMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::xds::resources::BuiltResource;
use crate::xds::state::XdsState;

/// Tracks the last sent version and nonce for ACK/NACK detection
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: Arc<str>,
    nonce: Arc<str>,
}

#[derive(Debug, Default)]
struct StreamTracker {
    group: Option<String>,
    node_id: Option<String>,
    last_sent: HashMap<String, LastDiscoverySnapshot>,
    // type url -> requested resource names, empty for wildcard
    subscriptions: HashMap<String, Vec<String>>,
}

/// Build the response for `type_url` out of the group's snapshot.
///
/// Returns `None` while the group has no snapshot; the client then waits for
/// the first publication.
pub fn create_resource_response(
    state: &XdsState,
    group: &str,
    type_url: &str,
    resource_names: &[String],
) -> Option<DiscoveryResponse> {
    let snapshot = state.snapshot(group)?;

    let resources = snapshot
        .resources(type_url)
        .iter()
        .filter(|resource| is_requested(resource, resource_names))
        .map(|resource| resource.resource.clone())
        .collect();

    Some(DiscoveryResponse {
        version_info: snapshot.version.clone(),
        resources,
        type_url: type_url.to_string(),
        nonce: Uuid::new_v4().to_string(),
        ..Default::default()
    })
}

fn is_requested(resource: &BuiltResource, names: &[String]) -> bool {
    names.is_empty() || names.iter().any(|name| name == "*" || *name == resource.name)
}

/// Run the shared SOTW stream loop.
///
/// `fixed_type` pins the stream to one resource type (CDS, LDS, SDS); requests
/// without a type URL are treated as that type, requests for other types are
/// rejected. ADS streams pass `None`.
pub fn run_stream_loop<S>(
    state: Arc<XdsState>,
    mut in_stream: S,
    fixed_type: Option<&'static str>,
    label: &'static str,
    shutdown: CancellationToken,
) -> ReceiverStream<std::result::Result<DiscoveryResponse, Status>>
where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let mut update_rx = state.subscribe_updates();
    let span = tracing::info_span!("xds_stream", stream = label);

    tokio::spawn(
        async move {
            let mut tracker = StreamTracker::default();

            loop {
                tokio::select! {
                    result = in_stream.next() => {
                        match result {
                            Some(Ok(mut request)) => {
                                if let Some(fixed) = fixed_type {
                                    if request.type_url.is_empty() {
                                        request.type_url = fixed.to_string();
                                    } else if request.type_url != fixed {
                                        let status = Status::invalid_argument(format!(
                                            "stream only serves {}, got {}",
                                            fixed, request.type_url
                                        ));
                                        let _ = tx.send(Err(status)).await;
                                        break;
                                    }
                                }

                                if let Some(response) = handle_request(&state, &mut tracker, request) {
                                    if tx.send(Ok(response)).await.is_err() {
                                        debug!("Discovery response receiver dropped");
                                        break;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Error receiving discovery request");
                                break;
                            }
                            None => {
                                info!(node_id = ?tracker.node_id, "xDS stream ended by client");
                                break;
                            }
                        }
                    }
                    update = update_rx.recv() => {
                        let group = match update {
                            Ok(update) => update.group.clone(),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Missed {} snapshot notifications", skipped);
                                // the latest snapshot is pushed below anyway
                                match tracker.group.clone() {
                                    Some(group) => group,
                                    None => continue,
                                }
                            }
                            Err(RecvError::Closed) => {
                                warn!("Snapshot notification channel closed");
                                break;
                            }
                        };

                        if tracker.group.as_deref() != Some(group.as_str()) {
                            continue;
                        }

                        let mut closed = false;
                        for response in push_updates(&state, &mut tracker) {
                            if tx.send(Ok(response)).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            debug!("Discovery response receiver dropped");
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Closing xDS stream for shutdown");
                        break;
                    }
                }
            }

            if let Some(node_id) = &tracker.node_id {
                state.metrics().record_xds_connection(node_id, false);
            }
        }
        .instrument(span),
    );

    ReceiverStream::new(rx)
}

fn handle_request(
    state: &XdsState,
    tracker: &mut StreamTracker,
    request: DiscoveryRequest,
) -> Option<DiscoveryResponse> {
    // envoy only sends its node on the first request of a stream
    if tracker.group.is_none() {
        let group = state.group_of(request.node.as_ref());
        let node_id = request.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
        info!(node_id = %node_id, group = %group, "New xDS stream");
        state.metrics().record_xds_connection(&node_id, true);
        tracker.node_id = Some(node_id);
        tracker.group = Some(group);
    }
    let group = tracker.group.clone().unwrap_or_default();

    debug!(
        type_url = %request.type_url,
        version_info = %request.version_info,
        nonce = %request.response_nonce,
        "Received discovery request"
    );

    let previous_names =
        tracker.subscriptions.insert(request.type_url.clone(), request.resource_names.clone());
    let names_changed = previous_names.as_ref() != Some(&request.resource_names);

    let last = tracker.last_sent.get(&request.type_url).cloned();
    let answers_last = last.as_ref().is_some_and(|last| {
        !request.response_nonce.is_empty() && request.response_nonce.as_str() == last.nonce.as_ref()
    });

    if let Some(error_detail) = request.error_detail.as_ref() {
        warn!(
            type_url = %request.type_url,
            nonce = %request.response_nonce,
            error_code = error_detail.code,
            error_message = %error_detail.message,
            "[NACK] Envoy rejected previous response"
        );
        state.metrics().record_xds_request(&request.type_url, false);
        // resending the rejected version would only be rejected again
        if answers_last && !names_changed {
            return None;
        }
    } else if let Some(last) = last.as_ref().filter(|_| answers_last) {
        let current_version = state.get_version(&group);
        let is_ack = request.version_info.as_str() == last.version.as_ref()
            && last.version.as_ref() == current_version;
        if is_ack && !names_changed {
            debug!(
                type_url = %request.type_url,
                version = %request.version_info,
                "[ACK] Skipping duplicate discovery request"
            );
            state.metrics().record_xds_request(&request.type_url, true);
            return None;
        }
    } else if last.is_some() && !request.response_nonce.is_empty() {
        debug!(type_url = %request.type_url, nonce = %request.response_nonce, "Ignoring stale nonce");
        return None;
    }

    respond(state, tracker, &group, &request.type_url)
}

fn push_updates(state: &XdsState, tracker: &mut StreamTracker) -> Vec<DiscoveryResponse> {
    let group = tracker.group.clone().unwrap_or_default();
    let current_version = state.get_version(&group);

    let mut stale: Vec<String> = tracker
        .subscriptions
        .keys()
        .filter(|type_url| {
            tracker
                .last_sent
                .get(*type_url)
                .map_or(true, |last| last.version.as_ref() != current_version)
        })
        .cloned()
        .collect();
    stale.sort();

    stale.into_iter().filter_map(|type_url| respond(state, tracker, &group, &type_url)).collect()
}

fn respond(
    state: &XdsState,
    tracker: &mut StreamTracker,
    group: &str,
    type_url: &str,
) -> Option<DiscoveryResponse> {
    let names = tracker.subscriptions.get(type_url).cloned().unwrap_or_default();
    let Some(response) = create_resource_response(state, group, type_url, &names) else {
        debug!(group = %group, type_url = %type_url, "No snapshot published yet");
        return None;
    };

    info!(
        type_url = %response.type_url,
        version = %response.version_info,
        nonce = %response.nonce,
        resource_count = response.resources.len(),
        "Sending discovery response"
    );

    tracker.last_sent.insert(
        type_url.to_string(),
        LastDiscoverySnapshot {
            version: Arc::from(response.version_info.as_str()),
            nonce: Arc::from(response.nonce.as_str()),
        },
    );
    Some(response)
}
