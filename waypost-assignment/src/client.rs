//! The assignment client bootstrap loop.
//!
//! ```text
//! WaitingForAssignment ──CreateAssignment──► RunningAssignment
//!          ▲                                        │
//!          └────────── worker hands back ───────────┘
//! ```
//!
//! While waiting, the client owns the node list and polls the coordinator
//! every [`ASSIGNMENT_REQUEST_INTERVAL`]. A recognised assignment moves the
//! node list into a [`WorkerContext`] running on its own task; the client
//! only gets it back when that task finishes.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypost_core::{AssignmentType, Providers, read_local_port};
use waypost_transport::protocol::{Assignment, RequestAssignment};
use waypost_transport::{LimitedNodeList, NodeListConfig, Packet, PacketType};

use crate::error::ClientError;
use crate::factory::Workload;
use crate::worker::{WorkerContext, WorkerOutcome, WorkerTransport};

/// Period between assignment requests while waiting.
pub const ASSIGNMENT_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Bootstrap state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Polling the coordinator.
    WaitingForAssignment,
    /// A worker owns the node list.
    RunningAssignment,
}

/// What to ask for and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Type to request; `AllTypes` takes anything.
    pub assignment_type: AssignmentType,
    /// Pool served.
    pub pool: String,
    /// Wallet credited for the work.
    pub wallet_uuid: Option<Uuid>,
    /// Coordinator address.
    pub domain: SocketAddr,
    /// Shared-memory segment to re-read the coordinator port from.
    pub port_segment: Option<String>,
    /// Local bind address.
    pub bind: SocketAddr,
}

impl ClientConfig {
    /// Take any assignment from `domain`.
    pub fn new(domain: SocketAddr) -> Self {
        Self {
            assignment_type: AssignmentType::AllTypes,
            pool: String::new(),
            wallet_uuid: None,
            domain,
            port_segment: None,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

/// The worker-side bootstrap.
pub struct AssignmentClient<P: Providers> {
    config: ClientConfig,
    domain: SocketAddr,
    transport: Option<WorkerTransport<P>>,
    state: ClientState,
}

impl<P: Providers> AssignmentClient<P> {
    /// Bind the node list.
    pub async fn new(providers: P, config: ClientConfig) -> Result<Self, ClientError> {
        let mut node_list =
            LimitedNodeList::bind(providers, config.bind, NodeListConfig::default()).await?;
        let events = node_list.take_event_receiver().ok_or(ClientError::NodeListBusy)?;
        info!(
            domain = %config.domain,
            assignment_type = %config.assignment_type,
            pool = %config.pool,
            "assignment client ready"
        );
        Ok(Self {
            domain: config.domain,
            config,
            transport: Some(WorkerTransport { node_list, events }),
            state: ClientState::WaitingForAssignment,
        })
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Coordinator address, after port discovery.
    pub fn domain(&self) -> SocketAddr {
        self.domain
    }

    /// The node list, while no worker owns it.
    pub fn node_list(&self) -> Option<&LimitedNodeList<P>> {
        self.transport.as_ref().map(|transport| &transport.node_list)
    }

    fn transport(&self) -> Result<&WorkerTransport<P>, ClientError> {
        self.transport.as_ref().ok_or(ClientError::NodeListBusy)
    }

    /// Re-read the coordinator port from shared memory.
    ///
    /// Only for a coordinator on loopback; a remote one cannot have published
    /// into our segment.
    pub fn refresh_domain_port(&mut self) {
        let Some(segment) = &self.config.port_segment else {
            return;
        };
        if !self.domain.ip().is_loopback() {
            return;
        }
        match read_local_port(segment) {
            Ok(Some(port)) if port != self.domain.port() => {
                info!(old = self.domain.port(), new = port, "domain server port changed");
                self.domain.set_port(port);
            }
            Ok(_) => {}
            Err(error) => debug!(%error, segment, "cannot read local port segment"),
        }
    }

    /// Send one `RequestAssignment`.
    pub async fn send_assignment_request(&mut self) -> Result<(), ClientError> {
        self.refresh_domain_port();
        let request = RequestAssignment {
            assignment_type: self.config.assignment_type,
            pool: self.config.pool.clone(),
            wallet_uuid: self.config.wallet_uuid,
        };
        debug!(domain = %self.domain, "requesting assignment");
        self.transport()?
            .node_list
            .write_unverified_datagram(&request, self.domain)
            .await?;
        Ok(())
    }

    /// Handle one datagram while waiting.
    ///
    /// Returns the assignment and its workload when the datagram is a
    /// recognised `CreateAssignment` sent by the domain server.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Option<(Assignment, Workload)> {
        let node_list = &mut self.transport.as_mut()?.node_list;
        let view = node_list.verify_packet(datagram, from)?;
        if view.packet_type != PacketType::CreateAssignment {
            debug!(%from, packet_type = ?view.packet_type, "ignoring packet while waiting");
            return None;
        }
        if from != self.domain {
            debug!(%from, domain = %self.domain, "assignment from a stranger");
            return None;
        }

        let assignment = match Assignment::from_payload(view.payload) {
            Ok(assignment) => assignment,
            Err(error) => {
                debug!(%error, %from, "malformed assignment");
                return None;
            }
        };
        match Workload::from_assignment(&assignment) {
            Some(workload) => Some((assignment, workload)),
            None => {
                warn!(
                    assignment = %assignment.uuid,
                    assignment_type = %assignment.assignment_type,
                    "unrecognised assignment, requesting again"
                );
                None
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), ClientError> {
        Ok(self.transport()?.node_list.recv(buf).await?)
    }

    /// Receive and handle one datagram.
    pub async fn recv_assignment(&mut self) -> Result<Option<(Assignment, Workload)>, ClientError> {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let (len, from) = self.recv(&mut buf).await?;
        Ok(self.handle_datagram(&buf[..len], from))
    }

    /// Poll the coordinator until a recognised assignment arrives.
    pub async fn wait_for_assignment(&mut self) -> Result<(Assignment, Workload), ClientError> {
        let mut request_timer = interval(ASSIGNMENT_REQUEST_INTERVAL);
        request_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = request_timer.tick() => {
                    if let Err(error) = self.send_assignment_request().await {
                        warn!(%error, "assignment request failed");
                    }
                }
                received = self.recv(&mut buf) => {
                    let (len, from) = received?;
                    if let Some(next) = self.handle_datagram(&buf[..len], from) {
                        return Ok(next);
                    }
                }
            }
        }
    }

    /// Hand the node list to a worker for `assignment`.
    pub fn start_assignment(
        &mut self,
        assignment: Assignment,
        workload: Workload,
    ) -> Result<WorkerContext<P>, ClientError> {
        let transport = self.transport.take().ok_or(ClientError::NodeListBusy)?;
        self.state = ClientState::RunningAssignment;
        info!(assignment = %assignment.uuid, ?workload, "received assignment");
        Ok(WorkerContext::new(transport, assignment, workload, self.domain))
    }

    /// Take the node list back from a finished worker.
    pub fn finish_assignment(&mut self, transport: WorkerTransport<P>, outcome: &WorkerOutcome) {
        self.transport = Some(transport);
        self.state = ClientState::WaitingForAssignment;
        info!(?outcome, "waiting for assignment");
    }

    /// Run the bootstrap loop until `shutdown` resolves.
    ///
    /// A running worker is told to stop and joined before returning.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (assignment, workload) = tokio::select! {
                () = &mut shutdown => return Ok(()),
                next = self.wait_for_assignment() => next?,
            };

            let worker = self.start_assignment(assignment, workload)?;
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let mut handle = tokio::spawn(worker.run(async move {
                let _ = stop_rx.await;
            }));

            let (transport, outcome) = tokio::select! {
                () = &mut shutdown => {
                    let _ = stop_tx.send(());
                    let (transport, outcome) = handle.await?;
                    self.finish_assignment(transport, &outcome);
                    return Ok(());
                }
                joined = &mut handle => joined?,
            };
            self.finish_assignment(transport, &outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use waypost_core::{LocalPortSegment, MemoryNetwork, MemoryProviders, NetworkProvider};

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("socket address")
    }

    async fn client(
        network: &MemoryNetwork,
        config: ClientConfig,
    ) -> AssignmentClient<MemoryProviders> {
        AssignmentClient::new(MemoryProviders::new(network.clone(), 5), config)
            .await
            .expect("client")
    }

    fn create(assignment_type: AssignmentType) -> Vec<u8> {
        let assignment = Assignment::new(Uuid::from_u128(77), assignment_type, "");
        let payload = assignment.to_payload();
        waypost_transport::write_packet(PacketType::CreateAssignment, &payload, None)
            .expect("packet")
    }

    #[tokio::test]
    async fn test_request_reaches_domain() {
        let network = MemoryNetwork::new();
        let domain = network.bind(addr("127.0.0.1:40102")).await.expect("bind");
        let config = ClientConfig {
            assignment_type: AssignmentType::Agent,
            pool: "numerics".into(),
            ..ClientConfig::new(addr("127.0.0.1:40102"))
        };
        let mut client = client(&network, config).await;

        client.send_assignment_request().await.expect("send");
        let (datagram, _) = domain.try_recv_from().expect("request delivered");
        let view = waypost_transport::PacketView::parse(&datagram).expect("envelope");
        let request = RequestAssignment::from_payload(view.payload).expect("request");
        assert_eq!(request.assignment_type, AssignmentType::Agent);
        assert_eq!(request.pool, "numerics");
    }

    #[tokio::test]
    async fn test_unrecognised_assignment_keeps_waiting() {
        let network = MemoryNetwork::new();
        let mut client = client(&network, ClientConfig::new(addr("127.0.0.1:40102"))).await;
        let from = addr("127.0.0.1:40102");

        assert!(client.handle_datagram(&create(AssignmentType::AllTypes), from).is_none());
        let (assignment, workload) = client
            .handle_datagram(&create(AssignmentType::AvatarMixer), from)
            .expect("recognised");
        assert_eq!(assignment.uuid, Uuid::from_u128(77));
        assert_eq!(workload, Workload::AvatarMixer);
    }

    #[tokio::test]
    async fn test_assignment_from_stranger_is_ignored() {
        let network = MemoryNetwork::new();
        let mut client = client(&network, ClientConfig::new(addr("127.0.0.1:40102"))).await;

        let stranger = addr("127.0.0.1:40999");
        assert!(client
            .handle_datagram(&create(AssignmentType::AudioMixer), stranger)
            .is_none());
        assert_eq!(client.state(), ClientState::WaitingForAssignment);

        let (_, workload) = client
            .handle_datagram(&create(AssignmentType::AudioMixer), addr("127.0.0.1:40102"))
            .expect("assignment from the domain server");
        assert_eq!(workload, Workload::AudioMixer);
    }

    #[tokio::test]
    async fn test_node_list_moves_to_worker_and_back() {
        let network = MemoryNetwork::new();
        let mut client = client(&network, ClientConfig::new(addr("127.0.0.1:40102"))).await;
        let (assignment, workload) = client
            .handle_datagram(&create(AssignmentType::AudioMixer), addr("127.0.0.1:40102"))
            .expect("assignment");

        let worker = client.start_assignment(assignment.clone(), workload.clone()).expect("start");
        assert_eq!(client.state(), ClientState::RunningAssignment);
        assert!(client.node_list().is_none());
        assert!(matches!(client.send_assignment_request().await, Err(ClientError::NodeListBusy)));
        assert!(matches!(
            client.start_assignment(assignment, workload),
            Err(ClientError::NodeListBusy)
        ));

        client.finish_assignment(worker.finish(), &WorkerOutcome::Shutdown);
        assert_eq!(client.state(), ClientState::WaitingForAssignment);
        assert!(client.node_list().is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_port_discovery_follows_segment() {
        let network = MemoryNetwork::new();
        let segment = format!("/waypost-client-test-{}", std::process::id());
        let config = ClientConfig {
            port_segment: Some(segment.clone()),
            ..ClientConfig::new(addr("127.0.0.1:40102"))
        };
        let mut client = client(&network, config).await;

        client.refresh_domain_port();
        assert_eq!(client.domain().port(), 40102);

        let _published = LocalPortSegment::publish(&segment, 40555).expect("publish");
        client.refresh_domain_port();
        assert_eq!(client.domain(), addr("127.0.0.1:40555"));
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let network = MemoryNetwork::new();
        let client = client(&network, ClientConfig::new(addr("127.0.0.1:40102"))).await;
        client.run(async {}).await.expect("clean shutdown");
    }
}
