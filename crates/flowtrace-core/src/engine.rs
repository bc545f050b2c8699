//! The probe engine: drives the ttl x round x flow matrix over a driver.
//!
//! Probes are sent one at a time; with a single shared capture stream the
//! serial order keeps reply matching deterministic. Replies are still
//! correlated by the quoted inner 4-tuple, never by arrival order.

use crate::result::{FlowRecord, HopResult, TracerouteResult};
use crate::traits::{ProbeDriver, ReverseResolver};
use crate::types::ProbeParams;
use crate::TraceError;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Multipath traceroute engine.
///
/// Owns the protocol driver (and through it the raw sender and the
/// sniffer) plus the growing result. One engine runs one traceroute.
pub struct ProbeEngine<D: ProbeDriver> {
    driver: D,
    params: ProbeParams,
    target: IpAddr,
    src_ip: IpAddr,
    timeout: Duration,
    delay: Duration,
    resolver: Option<Box<dyn ReverseResolver>>,
    started: bool,
    closed: bool,
}

impl<D: ProbeDriver> ProbeEngine<D> {
    /// Creates an engine after validating the parameters.
    pub fn new(
        driver: D,
        target: IpAddr,
        src_ip: IpAddr,
        params: ProbeParams,
    ) -> Result<Self, TraceError> {
        params.validate()?;
        let timeout = params
            .timeout
            .unwrap_or_else(|| driver.driver_info().protocol.default_timeout());
        let delay = params.delay;
        Ok(Self {
            driver,
            params,
            target,
            src_ip,
            timeout,
            delay,
            resolver: None,
            started: false,
            closed: false,
        })
    }

    /// Overrides the per-probe timeout. Pre-run only.
    pub fn set_timeout(&mut self, timeout: Duration) {
        if !self.started {
            self.timeout = timeout;
        }
    }

    /// Overrides the inter-probe delay. Pre-run only.
    pub fn set_delay(&mut self, delay: Duration) {
        if !self.started {
            self.delay = delay;
        }
    }

    /// Installs a reverse DNS hook, consulted on round 0 only.
    pub fn set_reverse_resolver(&mut self, resolver: Box<dyn ReverseResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Runs the traceroute to completion and freezes the result.
    ///
    /// Per-probe send failures and timeouts are recorded in the matching
    /// flow record and do not abort the run. A capture stream that closes
    /// mid-run aborts with [`TraceError::CaptureEnded`] carrying the
    /// partial result.
    pub async fn traceroute(&mut self) -> Result<TracerouteResult, TraceError> {
        self.started = true;
        let start_time = Utc::now();
        let started = Instant::now();
        let mut hops = BTreeMap::new();

        debug!(
            target = %self.target,
            src_ip = %self.src_ip,
            num_paths = self.params.num_paths,
            probe_count = self.params.probe_count,
            "starting traceroute"
        );

        let outcome = self.run_matrix(&mut hops).await;

        let result = TracerouteResult {
            target: self.target,
            src_ip: self.src_ip,
            start_time,
            end_time: Utc::now(),
            duration: started.elapsed(),
            hops,
        };

        match outcome {
            Ok(()) => Ok(result),
            Err(TraceError::CaptureEnded { .. }) => Err(TraceError::CaptureEnded {
                partial: Some(Box::new(result)),
            }),
            Err(e) => Err(e),
        }
    }

    async fn run_matrix(&mut self, hops: &mut BTreeMap<u8, HopResult>) -> Result<(), TraceError> {
        for ttl in self.params.min_ttl..=self.params.max_ttl {
            let mut hop = HopResult::new(ttl);
            let mut target_reached = false;

            let outcome = self.probe_hop(ttl, &mut hop, &mut target_reached).await;
            hops.insert(ttl, hop);
            outcome?;

            if target_reached {
                debug!(ttl = ttl, "target answered, stopping");
                break;
            }
        }
        Ok(())
    }

    async fn probe_hop(
        &mut self,
        ttl: u8,
        hop: &mut HopResult,
        target_reached: &mut bool,
    ) -> Result<(), TraceError> {
        for round in 0..self.params.probe_count {
            for flow in 0..self.params.num_paths {
                let unique_flow_id = self.params.unique_flow_id(flow, round);
                let mut rec = FlowRecord::sent(
                    unique_flow_id,
                    self.params.src_port(flow),
                    self.params.dst_port,
                    Utc::now(),
                );
                let sent_at = Instant::now();

                if let Err(e) = self.driver.send_probe(ttl, flow).await {
                    warn!(ttl = ttl, flow = flow, error = %e, "probe send failed");
                    rec.error = Some(e.to_string());
                    hop.flows.insert(unique_flow_id, rec);
                    continue;
                }

                match self.await_reply(ttl, flow, sent_at, round, &mut rec).await {
                    Ok(reached) => *target_reached |= reached,
                    Err(e) => {
                        hop.flows.insert(unique_flow_id, rec);
                        return Err(e);
                    }
                }

                hop.flows.insert(unique_flow_id, rec);
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(())
    }

    /// Waits for the reply to the probe just sent and fills in `rec`.
    /// Returns whether the target itself answered.
    async fn await_reply(
        &mut self,
        ttl: u8,
        flow: u16,
        sent_at: Instant,
        round: u8,
        rec: &mut FlowRecord,
    ) -> Result<bool, TraceError> {
        let deadline = sent_at + self.timeout;

        match self.driver.receive_matching(deadline).await {
            Ok(reply) => {
                // Timing is taken here, on the thread that observed the frame.
                let rtt = sent_at.elapsed();
                rec.recv_time = Some(Utc::now());
                rec.rtt = Some(rtt);
                rec.response_ip = Some(reply.responder);
                rec.icmp_type = reply.icmp_type;
                rec.icmp_code = reply.icmp_code;

                trace!(
                    ttl = ttl,
                    flow = reply.flow,
                    responder = %reply.responder,
                    rtt_ms = rtt.as_secs_f64() * 1000.0,
                    "probe answered"
                );

                // Reverse lookups are slow; amortize across rounds.
                if round == 0 {
                    if let Some(resolver) = &self.resolver {
                        rec.hostname = resolver.reverse_lookup(reply.responder).await;
                    }
                }

                Ok(reply.is_dest)
            }
            Err(TraceError::ReadTimeout) => {
                trace!(ttl = ttl, flow = flow, "probe timed out");
                rec.error = Some("timeout".to_string());
                Ok(false)
            }
            Err(e) if e.is_retryable() => {
                // Drivers consume mismatches internally; a stray one here
                // still just means no answer for this probe.
                rec.error = Some("timeout".to_string());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases the capture handle and the raw socket. Idempotent.
    pub async fn close(&mut self) -> Result<(), TraceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.driver.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ProbeDriverInfo, ProbeReply};
    use crate::types::Protocol;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    /// Scripted driver: answers each (ttl, flow) probe according to a
    /// closure, standing in for routers along the path.
    struct ScriptedDriver<F>
    where
        F: FnMut(u8, u16) -> Option<ProbeReply> + Send,
    {
        respond: F,
        outstanding: Option<ProbeReply>,
        sent: Arc<AtomicUsize>,
        closed: usize,
    }

    impl<F> ScriptedDriver<F>
    where
        F: FnMut(u8, u16) -> Option<ProbeReply> + Send,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                outstanding: None,
                sent: Arc::new(AtomicUsize::new(0)),
                closed: 0,
            }
        }
    }

    #[async_trait]
    impl<F> ProbeDriver for ScriptedDriver<F>
    where
        F: FnMut(u8, u16) -> Option<ProbeReply> + Send,
    {
        fn driver_info(&self) -> ProbeDriverInfo {
            ProbeDriverInfo {
                protocol: Protocol::Udp,
            }
        }

        async fn send_probe(&mut self, ttl: u8, flow: u16) -> Result<(), TraceError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.outstanding = (self.respond)(ttl, flow);
            Ok(())
        }

        async fn receive_matching(&mut self, _deadline: Instant) -> Result<ProbeReply, TraceError> {
            match self.outstanding.take() {
                Some(reply) => Ok(reply),
                None => Err(TraceError::ReadTimeout),
            }
        }

        async fn close(&mut self) -> Result<(), TraceError> {
            self.closed += 1;
            Ok(())
        }
    }

    fn ttl_exceeded(flow: u16, responder: Ipv4Addr) -> ProbeReply {
        ProbeReply {
            flow,
            responder: IpAddr::V4(responder),
            icmp_type: Some(11),
            icmp_code: Some(0),
            is_dest: responder == TARGET,
        }
    }

    fn params(num_paths: u16, min_ttl: u8, max_ttl: u8, probe_count: u8) -> ProbeParams {
        ProbeParams {
            num_paths,
            min_ttl,
            max_ttl,
            probe_count,
            delay: Duration::ZERO,
            timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        }
    }

    fn engine<F>(driver: ScriptedDriver<F>, p: ProbeParams) -> ProbeEngine<ScriptedDriver<F>>
    where
        F: FnMut(u8, u16) -> Option<ProbeReply> + Send,
    {
        ProbeEngine::new(driver, IpAddr::V4(TARGET), IpAddr::V4(SRC), p).unwrap()
    }

    #[tokio::test]
    async fn test_stops_at_first_hop_when_target_answers() {
        // The target answers immediately; later TTLs must not be probed.
        let driver = ScriptedDriver::new(|_ttl, flow| Some(ttl_exceeded(flow, TARGET)));
        let sent = driver.sent.clone();

        let mut engine = engine(driver, params(1, 1, 3, 1));
        let result = engine.traceroute().await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(result.hops.len(), 1);
        let rec = &result.hops[&1].flows[&0];
        assert_eq!(rec.response_ip, Some(IpAddr::V4(TARGET)));
        assert!(rec.rtt.is_some());
        // A single flow can never look load balanced
        assert!(!result.analyze().has_load_balancing);
    }

    #[tokio::test]
    async fn test_single_responder_is_not_load_balancing() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let driver = ScriptedDriver::new(move |_ttl, flow| Some(ttl_exceeded(flow, router)));

        let mut engine = engine(driver, params(4, 1, 1, 1));
        let result = engine.traceroute().await.unwrap();

        let hop = &result.hops[&1];
        assert_eq!(hop.flows.len(), 4);
        assert!(hop
            .flows
            .values()
            .all(|f| f.response_ip == Some(IpAddr::V4(router))));
        assert!(!result.analyze().has_load_balancing);
    }

    #[tokio::test]
    async fn test_alternating_responders_flag_load_balancing() {
        // Routers alternate on source-port parity
        let driver = ScriptedDriver::new(|_ttl, flow| {
            let router = if flow % 2 == 0 {
                Ipv4Addr::new(10, 0, 0, 1)
            } else {
                Ipv4Addr::new(10, 0, 0, 2)
            };
            Some(ttl_exceeded(flow, router))
        });

        let mut engine = engine(driver, params(4, 1, 1, 1));
        let result = engine.traceroute().await.unwrap();

        let analysis = result.analyze();
        assert!(analysis.has_load_balancing);
        assert_eq!(analysis.load_balancing_hops, vec![1]);
    }

    #[tokio::test]
    async fn test_silent_network_records_all_timeouts() {
        let driver = ScriptedDriver::new(|_ttl, _flow| None);
        let sent = driver.sent.clone();

        let mut engine = engine(driver, params(2, 1, 5, 3));
        let result = engine.traceroute().await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 30);
        assert_eq!(result.hops.len(), 5);
        for hop in result.hops.values() {
            assert_eq!(hop.flows.len(), 6);
            for rec in hop.flows.values() {
                assert_eq!(rec.error.as_deref(), Some("timeout"));
                assert!(rec.recv_time.is_none());
            }
        }
        assert_eq!(result.packet_loss_rate(), 100.0);
    }

    #[tokio::test]
    async fn test_min_ttl_equals_max_ttl_probes_one_hop() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let driver = ScriptedDriver::new(move |_ttl, flow| Some(ttl_exceeded(flow, router)));
        let sent = driver.sent.clone();

        let mut engine = engine(driver, params(3, 7, 7, 2));
        let result = engine.traceroute().await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 6);
        assert_eq!(result.hops.len(), 1);
        assert!(result.hops.contains_key(&7));
    }

    #[tokio::test]
    async fn test_unique_flow_ids_distinguish_rounds() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let driver = ScriptedDriver::new(move |_ttl, flow| Some(ttl_exceeded(flow, router)));

        let mut engine = engine(driver, params(2, 1, 1, 3));
        let result = engine.traceroute().await.unwrap();

        let hop = &result.hops[&1];
        let ids: Vec<u16> = hop.flows.keys().copied().collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        // Source port depends only on the flow index, not the round
        assert_eq!(hop.flows[&0].src_port, hop.flows[&2].src_port);
        assert_eq!(hop.flows[&1].src_port, hop.flows[&5].src_port);
    }

    #[tokio::test]
    async fn test_capture_ended_returns_partial_result() {
        struct DyingDriver {
            sent: usize,
        }

        #[async_trait]
        impl ProbeDriver for DyingDriver {
            fn driver_info(&self) -> ProbeDriverInfo {
                ProbeDriverInfo {
                    protocol: Protocol::Udp,
                }
            }

            async fn send_probe(&mut self, _ttl: u8, _flow: u16) -> Result<(), TraceError> {
                self.sent += 1;
                Ok(())
            }

            async fn receive_matching(
                &mut self,
                _deadline: Instant,
            ) -> Result<ProbeReply, TraceError> {
                if self.sent <= 2 {
                    Ok(ttl_exceeded(0, Ipv4Addr::new(10, 0, 0, 1)))
                } else {
                    Err(TraceError::CaptureEnded { partial: None })
                }
            }

            async fn close(&mut self) -> Result<(), TraceError> {
                Ok(())
            }
        }

        let mut engine = ProbeEngine::new(
            DyingDriver { sent: 0 },
            IpAddr::V4(TARGET),
            IpAddr::V4(SRC),
            params(1, 1, 5, 1),
        )
        .unwrap();

        match engine.traceroute().await {
            Err(TraceError::CaptureEnded { partial: Some(partial) }) => {
                // Two hops answered before the capture died
                assert_eq!(partial.hops.len(), 3);
                assert!(partial.hops[&1].flows[&0].replied());
                assert!(partial.hops[&2].flows[&0].replied());
            }
            other => panic!("expected CaptureEnded with partial result, got {:?}", other.map(|r| r.hops.len())),
        }
    }

    #[tokio::test]
    async fn test_send_failure_is_recorded_not_fatal() {
        struct FlakySender {
            calls: usize,
        }

        #[async_trait]
        impl ProbeDriver for FlakySender {
            fn driver_info(&self) -> ProbeDriverInfo {
                ProbeDriverInfo {
                    protocol: Protocol::Udp,
                }
            }

            async fn send_probe(&mut self, _ttl: u8, flow: u16) -> Result<(), TraceError> {
                self.calls += 1;
                if flow == 0 {
                    Err(TraceError::from_send_io(std::io::Error::from(
                        std::io::ErrorKind::HostUnreachable,
                    )))
                } else {
                    Ok(())
                }
            }

            async fn receive_matching(
                &mut self,
                _deadline: Instant,
            ) -> Result<ProbeReply, TraceError> {
                Ok(ttl_exceeded(1, TARGET))
            }

            async fn close(&mut self) -> Result<(), TraceError> {
                Ok(())
            }
        }

        let mut engine = ProbeEngine::new(
            FlakySender { calls: 0 },
            IpAddr::V4(TARGET),
            IpAddr::V4(SRC),
            params(2, 1, 1, 1),
        )
        .unwrap();

        let result = engine.traceroute().await.unwrap();
        let hop = &result.hops[&1];
        assert!(hop.flows[&0].error.as_deref().unwrap().contains("host unreachable"));
        assert!(hop.flows[&1].replied());
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_at_construction() {
        let driver = ScriptedDriver::new(|_ttl, _flow| None);
        let bad = ProbeParams {
            num_paths: 0,
            ..Default::default()
        };
        assert!(matches!(
            ProbeEngine::new(driver, IpAddr::V4(TARGET), IpAddr::V4(SRC), bad),
            Err(TraceError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let driver = ScriptedDriver::new(|_ttl, _flow| None);
        let mut engine = engine(driver, params(1, 1, 1, 1));
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.driver.closed, 1);
    }
}
