//! The routing state machine
//!
//! Everything here runs with the node's state lock held, except server
//! probing: probe jobs are collected while locked and executed by
//! [`Node::run_probe_jobs`] with the lock released, then their answers are
//! fed back through the same path a response from the network takes. Replay
//! protection (seen request ids, cached outcomes) makes that re-entry safe.

use std::net::SocketAddr;

use futures::stream::{FuturesUnordered, StreamExt};

use super::tables::{Downstream, NodeState, ProbeOutcome, RunningStream};
use super::{Neighbour, Node};
use crate::packet::{Packet, ProbeRequest, ProbeResponse};

/// Deferred probe work collected while the state lock is held
enum ProbeJob {
    /// Ask the configured servers about a request
    Consult(ProbeRequest),
    /// An answer produced locally, to be recorded and propagated like any
    /// other response
    Settle {
        response: ProbeResponse,
        source: Option<SocketAddr>,
    },
}

impl Node {
    /// Handle an inbound probe and run any server probing it requires
    pub(crate) async fn drive_probe_request(
        &self,
        request: ProbeRequest,
        source: Option<SocketAddr>,
    ) {
        let mut jobs = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            self.probe_request_step(&mut state, request, source, &mut jobs);
        }
        self.run_probe_jobs(jobs).await;
    }

    /// Handle an inbound probe answer
    pub(crate) async fn drive_probe_response(
        &self,
        response: ProbeResponse,
        source: Option<SocketAddr>,
    ) {
        let mut jobs = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            self.handle_probe_response(&mut state, response, source, &mut jobs)
                .await;
        }
        self.run_probe_jobs(jobs).await;
    }

    /// Handle a subscription for `dests`, resolving the stream first if
    /// necessary. This is the entry point for both inbound StreamRequests
    /// and locally originated re-subscriptions.
    pub async fn drive_stream_request(
        &self,
        stream_id: &str,
        request_id: u32,
        dests: Vec<Downstream>,
    ) {
        let mut jobs = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            self.handle_stream_request(&mut state, stream_id, request_id, dests, &mut jobs)
                .await;
        }
        self.run_probe_jobs(jobs).await;
    }

    /// Execute deferred probe work without holding the state lock.
    ///
    /// Only rendezvous nodes ever enqueue server consultations, so a negative
    /// consult result is authoritative and may be propagated.
    async fn run_probe_jobs(&self, mut jobs: Vec<ProbeJob>) {
        while let Some(job) = jobs.pop() {
            let (response, source) = match job {
                ProbeJob::Settle { response, source } => (response, source),
                ProbeJob::Consult(request) => self.probe_servers(&request).await,
            };
            let mut state = self.inner.state.lock().await;
            self.handle_probe_response(&mut state, response, source, &mut jobs)
                .await;
        }
    }

    /// First step of probe handling: replay suppression, local answer or
    /// flood. Server consultation is deferred into `jobs`.
    fn probe_request_step(
        &self,
        state: &mut NodeState,
        request: ProbeRequest,
        source: Option<SocketAddr>,
        jobs: &mut Vec<ProbeJob>,
    ) {
        if !state.seen_requests.insert(request.request_id) {
            tracing::debug!(request = request.request_id, "probe already seen, dropped");
            return;
        }

        if let Some(stream) = state.running.get(&request.stream_id) {
            // Answer from local knowledge, but through the same propagation
            // path a network response takes so admission gating applies.
            tracing::debug!(stream = %request.stream_id, "probe hit a locally running stream");
            jobs.push(ProbeJob::Settle {
                response: request.respond_existing(stream.metadata),
                source: Some(stream.upstream),
            });
            return;
        }

        for neighbour in &self.inner.config.neighbours {
            if Some(neighbour.addr) == source {
                continue;
            }
            if let Err(e) = self
                .inner
                .io
                .send_control(Packet::ProbeRequest(request.clone()), neighbour.addr)
            {
                tracing::warn!(error = %e, neighbour = %neighbour.addr, "failed to forward probe");
            }
        }

        if self.inner.config.is_rendezvous() {
            jobs.push(ProbeJob::Consult(request));
        }
    }

    /// Record a probe's outcome, propagate it, and re-drive any local
    /// interest in the stream it answers.
    async fn handle_probe_response(
        &self,
        state: &mut NodeState,
        response: ProbeResponse,
        source: Option<SocketAddr>,
        jobs: &mut Vec<ProbeJob>,
    ) {
        state.seen_requests.insert(response.request_id);
        if state.probe_outcomes.contains_key(&response.request_id) {
            tracing::debug!(request = response.request_id, "probe already resolved, answer dropped");
            return;
        }

        let outcome = if response.exists {
            match source {
                Some(addr) => ProbeOutcome::Found {
                    source: addr,
                    metadata: response.metadata,
                },
                None => {
                    tracing::error!(
                        stream = %response.stream_id,
                        "positive probe answer with no source, dropped"
                    );
                    return;
                }
            }
        } else {
            ProbeOutcome::Missing
        };
        state.probe_outcomes.insert(response.request_id, outcome);

        for neighbour in &self.inner.config.neighbours {
            if Some(neighbour.addr) == source {
                continue;
            }
            if response.exists
                && !self.fits_additional(state, response.metadata.bitrate, neighbour)
            {
                tracing::debug!(
                    neighbour = %neighbour.addr,
                    stream = %response.stream_id,
                    "link saturated, withholding probe answer"
                );
                continue;
            }
            if let Err(e) = self
                .inner
                .io
                .send_control(Packet::ProbeResponse(response.clone()), neighbour.addr)
            {
                tracing::warn!(error = %e, neighbour = %neighbour.addr, "failed to propagate probe answer");
            }
        }

        if state.waiting.contains_key(&response.stream_id) {
            if response.exists {
                let stream_id = response.stream_id.clone();
                let pending: Vec<Downstream> = state
                    .waiting
                    .get(&stream_id)
                    .map(|w| w.pending.iter().copied().collect())
                    .unwrap_or_default();
                self.handle_stream_request(state, &stream_id, response.request_id, pending, jobs)
                    .await;
            } else {
                tracing::info!(stream = %response.stream_id, "stream unresolvable, notifying subscribers");
                self.abandon_waiting(state, &response.stream_id).await;
            }
        }
    }

    /// Attach `dests` to a stream, resolving and subscribing as needed
    async fn handle_stream_request(
        &self,
        state: &mut NodeState,
        stream_id: &str,
        request_id: u32,
        dests: Vec<Downstream>,
        jobs: &mut Vec<ProbeJob>,
    ) {
        if dests.is_empty() {
            tracing::error!(stream = stream_id, "stream request with no subscribers");
            return;
        }

        if let Some(stream) = state.running.get_mut(stream_id) {
            let response = Packet::StreamResponse {
                stream_id: stream_id.to_string(),
                description: stream.description.clone(),
            };
            for dest in dests {
                stream.downstreams.insert(dest);
                tracing::info!(stream = stream_id, subscriber = %dest.control, "subscriber joined running stream");
                if let Err(e) = self.inner.io.send_control(response.clone(), dest.control) {
                    tracing::warn!(error = %e, subscriber = %dest.control, "failed to confirm subscription");
                }
            }
            return;
        }

        match state.probe_outcomes.get(&request_id).copied() {
            Some(ProbeOutcome::Found { source, metadata }) => {
                let already_subscribed = {
                    let waiting = state.waiting.entry(stream_id.to_string()).or_default();
                    waiting.pending.extend(dests.iter().copied());
                    waiting.metadata = Some(metadata);
                    waiting.relay_port.is_some()
                };
                if already_subscribed {
                    return;
                }

                let port = match self.inner.io.open_relay_port().await {
                    Ok(port) => port,
                    Err(e) => {
                        tracing::error!(error = %e, stream = stream_id, "cannot allocate relay port");
                        self.abandon_waiting(state, stream_id).await;
                        return;
                    }
                };
                if let Some(waiting) = state.waiting.get_mut(stream_id) {
                    waiting.relay_port = Some(port);
                    waiting.upstream = Some(source);
                }

                tracing::info!(stream = stream_id, upstream = %source, port, "subscribing upstream");
                let request = Packet::StreamRequest {
                    stream_id: stream_id.to_string(),
                    request_id,
                    port,
                };
                if let Err(e) = self.inner.io.send_control(request, source) {
                    tracing::warn!(error = %e, upstream = %source, stream = stream_id, "upstream subscription failed");
                    self.abandon_waiting(state, stream_id).await;
                }
            }
            Some(ProbeOutcome::Missing) => {
                let notice = Packet::StreamEnd {
                    stream_id: stream_id.to_string(),
                };
                for dest in dests {
                    if let Err(e) = self.inner.io.send_control(notice.clone(), dest.control) {
                        tracing::warn!(error = %e, subscriber = %dest.control, "failed to deliver stream end");
                    }
                }
            }
            None => {
                {
                    let waiting = state.waiting.entry(stream_id.to_string()).or_default();
                    waiting.pending.extend(dests.iter().copied());
                }
                if state.seen_requests.contains(&request_id) {
                    // A probe with this id is already in flight; its answer
                    // will pick up the accumulated subscribers.
                    tracing::debug!(stream = stream_id, request = request_id, "probe in flight, subscriber queued");
                } else {
                    let request = ProbeRequest {
                        stream_id: stream_id.to_string(),
                        request_id,
                    };
                    tracing::info!(stream = stream_id, request = request_id, "raising probe for unknown stream");
                    self.probe_request_step(state, request, None, jobs);
                }
            }
        }
    }

    /// Upstream confirmed our subscription: promote waiting to running and
    /// pass the confirmation down the tree
    pub(crate) async fn handle_stream_response(
        &self,
        state: &mut NodeState,
        stream_id: &str,
        description: String,
        from: SocketAddr,
    ) {
        if state.running.contains_key(stream_id) {
            tracing::debug!(stream = stream_id, peer = %from, "duplicate stream confirmation dropped");
            return;
        }
        match state.waiting.get(stream_id) {
            Some(waiting) if waiting.upstream == Some(from) && waiting.relay_port.is_some() => {}
            Some(_) => {
                tracing::debug!(stream = stream_id, peer = %from, "stream confirmation from unexpected peer");
                return;
            }
            None => {
                tracing::debug!(stream = stream_id, peer = %from, "unsolicited stream confirmation");
                return;
            }
        }

        let Some(waiting) = state.waiting.remove(stream_id) else {
            return;
        };
        let Some(relay_port) = waiting.relay_port else {
            return;
        };
        let stream = RunningStream {
            upstream: from,
            relay_port,
            downstreams: waiting.pending,
            description: description.clone(),
            metadata: waiting.metadata.unwrap_or_default(),
        };

        let response = Packet::StreamResponse {
            stream_id: stream_id.to_string(),
            description,
        };
        for dest in &stream.downstreams {
            if let Err(e) = self.inner.io.send_control(response.clone(), dest.control) {
                tracing::warn!(error = %e, subscriber = %dest.control, "failed to confirm subscription");
            }
        }

        tracing::info!(
            stream = stream_id,
            upstream = %from,
            subscribers = stream.downstreams.len(),
            "stream running"
        );
        state.running.insert(stream_id.to_string(), stream);
    }

    /// A downstream gave up one delivery port
    pub(crate) async fn cancel_stream(
        &self,
        state: &mut NodeState,
        stream_id: &str,
        peer: SocketAddr,
        port: u16,
    ) {
        let target = Downstream::new(peer, port);

        if let Some(stream) = state.running.get_mut(stream_id) {
            if !stream.downstreams.remove(&target) {
                tracing::debug!(stream = stream_id, peer = %peer, "cancel from unknown subscriber");
                return;
            }
            tracing::info!(stream = stream_id, subscriber = %peer, "subscriber left");
            if stream.downstreams.is_empty() {
                self.teardown_running(state, stream_id).await;
            }
        } else if let Some(waiting) = state.waiting.get_mut(stream_id) {
            if !waiting.pending.remove(&target) {
                tracing::debug!(stream = stream_id, peer = %peer, "cancel from unknown subscriber");
                return;
            }
            if waiting.pending.is_empty() {
                self.drop_waiting(state, stream_id).await;
            }
        } else {
            tracing::debug!(stream = stream_id, peer = %peer, "cancel for unknown stream");
        }
    }

    /// Upstream declared the stream over (or unresolvable)
    pub(crate) async fn handle_stream_end(
        &self,
        state: &mut NodeState,
        stream_id: &str,
        from: SocketAddr,
    ) {
        let is_upstream = match (state.running.get(stream_id), state.waiting.get(stream_id)) {
            (Some(stream), _) => stream.upstream == from,
            (None, Some(waiting)) => waiting.upstream == Some(from),
            (None, None) => {
                tracing::debug!(stream = stream_id, peer = %from, "stream end for unknown stream");
                return;
            }
        };
        if !is_upstream {
            // Stale notice from a peer that is no longer (or never was) our
            // parent for this stream.
            tracing::debug!(stream = stream_id, peer = %from, "stream end from non-upstream, dropped");
            return;
        }

        tracing::info!(stream = stream_id, "stream ended upstream");
        if let Some(stream) = state.running.remove(stream_id) {
            let notice = Packet::StreamEnd {
                stream_id: stream_id.to_string(),
            };
            for dest in &stream.downstreams {
                if let Err(e) = self.inner.io.send_control(notice.clone(), dest.control) {
                    tracing::warn!(error = %e, subscriber = %dest.control, "failed to deliver stream end");
                }
            }
            self.inner.io.close_relay_port(stream.relay_port).await;
        } else {
            self.abandon_waiting(state, stream_id).await;
        }
    }

    /// A control connection died. Its subscriptions are cancelled; streams it
    /// fed us are re-resolved for the surviving subscribers, each with a
    /// fresh request id, concurrently.
    pub(crate) async fn handle_disconnect(&self, peer: SocketAddr) {
        let mut recoveries: Vec<(String, Vec<Downstream>)> = Vec::new();
        {
            let mut state = self.inner.state.lock().await;

            let ids: Vec<String> = state.running.keys().cloned().collect();
            for id in ids {
                let now_empty = match state.running.get_mut(&id) {
                    Some(stream) => {
                        let before = stream.downstreams.len();
                        stream.downstreams.retain(|d| d.control != peer);
                        before != stream.downstreams.len() && stream.downstreams.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.teardown_running(&mut state, &id).await;
                }
            }

            let ids: Vec<String> = state.waiting.keys().cloned().collect();
            for id in ids {
                let now_empty = match state.waiting.get_mut(&id) {
                    Some(waiting) => {
                        let before = waiting.pending.len();
                        waiting.pending.retain(|d| d.control != peer);
                        before != waiting.pending.len() && waiting.pending.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.drop_waiting(&mut state, &id).await;
                }
            }

            let ids: Vec<String> = state
                .running
                .iter()
                .filter(|(_, s)| s.upstream == peer)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(stream) = state.running.remove(&id) {
                    self.inner.io.close_relay_port(stream.relay_port).await;
                    recoveries.push((id, stream.downstreams.into_iter().collect()));
                }
            }

            let ids: Vec<String> = state
                .waiting
                .iter()
                .filter(|(_, w)| w.upstream == Some(peer))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(waiting) = state.waiting.remove(&id) {
                    if let Some(port) = waiting.relay_port {
                        self.inner.io.close_relay_port(port).await;
                    }
                    recoveries.push((id, waiting.pending.into_iter().collect()));
                }
            }
        }

        for (stream_id, dests) in recoveries {
            if dests.is_empty() {
                continue;
            }
            let request_id = self.inner.io.fresh_request_id();
            tracing::info!(stream = %stream_id, request = request_id, "upstream lost, re-resolving stream");
            let node = self.clone();
            tokio::spawn(async move {
                node.drive_stream_request(&stream_id, request_id, dests).await;
            });
        }
    }

    /// Fan one payload datagram out to every downstream of its stream
    pub(crate) async fn relay_media(&self, packet: Packet, local_port: u16) {
        let Packet::StreamPacket { stream_id, .. } = &packet else {
            return;
        };

        let state = self.inner.state.lock().await;
        let Some(stream) = state.running.get(stream_id) else {
            tracing::debug!(stream = %stream_id, "payload for unknown stream dropped");
            return;
        };
        if stream.relay_port != local_port {
            tracing::debug!(stream = %stream_id, port = local_port, "payload on stale relay port dropped");
            return;
        }
        for dest in &stream.downstreams {
            if let Err(e) = self.inner.io.send_media(&packet, dest.media_addr()).await {
                tracing::debug!(error = %e, dest = %dest.media_addr(), "payload forward failed");
            }
        }
    }

    /// Ask every configured server about `request` in parallel; the first
    /// positive answer wins and the rest are abandoned.
    async fn probe_servers(&self, request: &ProbeRequest) -> (ProbeResponse, Option<SocketAddr>) {
        let mut probes = FuturesUnordered::new();
        for &server in &self.inner.config.servers {
            let io = std::sync::Arc::clone(&self.inner.io);
            let request = request.clone();
            let timeout = self.inner.config.probe_timeout;
            probes.push(async move { (io.probe_server(request, server, timeout).await, server) });
        }

        while let Some((result, server)) = probes.next().await {
            match result {
                Ok(response) if response.exists => {
                    tracing::debug!(stream = %response.stream_id, server = %server, "server carries stream");
                    return (response, Some(server));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, server = %server, "server probe failed");
                }
            }
        }
        (request.respond_missing(), None)
    }

    /// Whether the link to `neighbour` can take one more stream of `bitrate`
    fn fits_additional(&self, state: &NodeState, bitrate: u32, neighbour: &Neighbour) -> bool {
        state.link_usage(neighbour.addr) + u64::from(bitrate) < u64::from(neighbour.bandwidth)
    }

    /// Drop a waiting record, notifying its subscribers and unwinding any
    /// upstream subscription already made
    async fn abandon_waiting(&self, state: &mut NodeState, stream_id: &str) {
        let Some(waiting) = state.waiting.remove(stream_id) else {
            return;
        };
        let notice = Packet::StreamEnd {
            stream_id: stream_id.to_string(),
        };
        for dest in &waiting.pending {
            if let Err(e) = self.inner.io.send_control(notice.clone(), dest.control) {
                tracing::warn!(error = %e, subscriber = %dest.control, "failed to deliver stream end");
            }
        }
        self.unwind_waiting_subscription(stream_id, &waiting).await;
    }

    /// Drop a waiting record that has no subscribers left
    async fn drop_waiting(&self, state: &mut NodeState, stream_id: &str) {
        if let Some(waiting) = state.waiting.remove(stream_id) {
            self.unwind_waiting_subscription(stream_id, &waiting).await;
        }
    }

    async fn unwind_waiting_subscription(
        &self,
        stream_id: &str,
        waiting: &super::tables::WaitingStream,
    ) {
        if let (Some(port), Some(upstream)) = (waiting.relay_port, waiting.upstream) {
            let cancel = Packet::StreamCancel {
                stream_id: stream_id.to_string(),
                port,
            };
            if let Err(e) = self.inner.io.send_control(cancel, upstream) {
                tracing::warn!(error = %e, upstream = %upstream, "failed to cancel upstream subscription");
            }
        }
        if let Some(port) = waiting.relay_port {
            self.inner.io.close_relay_port(port).await;
        }
    }

    /// Remove a running stream whose last subscriber left, unsubscribing
    /// upstream and releasing the relay port
    async fn teardown_running(&self, state: &mut NodeState, stream_id: &str) {
        let Some(stream) = state.running.remove(stream_id) else {
            return;
        };
        tracing::info!(stream = stream_id, upstream = %stream.upstream, "last subscriber gone, unsubscribing");
        let cancel = Packet::StreamCancel {
            stream_id: stream_id.to_string(),
            port: stream.relay_port,
        };
        if let Err(e) = self.inner.io.send_control(cancel, stream.upstream) {
            tracing::warn!(error = %e, upstream = %stream.upstream, "failed to cancel upstream subscription");
        }
        self.inner.io.close_relay_port(stream.relay_port).await;
    }
}
