//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use ipnetwork::IpNetwork;
use itertools::Itertools;
use rumb_utils::mpls::Label;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::adjacency::AdjacencyDatabase;
use crate::debounce::Debouncer;
use crate::debug::Debug;
use crate::error::Error;
use crate::kv::{KvKey, KvStoreUpdate, Publication};
use crate::link_state::LinkState;
use crate::pending::PendingUpdates;
use crate::prefix::{
    PrefixDatabase, PrefixKey, PrefixType, ReceivedRouteDetail,
    ReceivedRouteFilter,
};
use crate::prefix_state::PrefixState;
use crate::rib_policy::{self, ActiveRibPolicy, RibPolicy};
use crate::route::{DecisionRouteDb, RibMplsEntry, RibUnicastEntry, RouteUpdate};
use crate::spf::{BestRoutes, SpfSolver};
use crate::Config;

// Initialization progresses through these states; route updates are only
// published once `Ready`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitializationState {
    WaitingPeers,
    WaitingInitialSync,
    WaitingAdjacencies,
    Ready,
}

// Per-area set of expected peers to add and remove.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AreaPeerEvent {
    pub peers_to_add: BTreeSet<String>,
    pub peers_to_del: BTreeSet<String>,
}

// One peer event, keyed by area.
pub type PeerEvent = BTreeMap<String, AreaPeerEvent>;

// Requests answered synchronously from the event loop.
#[derive(Debug)]
pub enum ApiRequest {
    SetRibPolicy(RibPolicy, oneshot::Sender<Result<(), Error>>),
    GetRibPolicy(oneshot::Sender<Result<RibPolicy, Error>>),
    ClearRibPolicy(oneshot::Sender<Result<(), Error>>),
    GetRouteDb(String, oneshot::Sender<Option<DecisionRouteDb>>),
    GetReceivedRoutes(
        ReceivedRouteFilter,
        oneshot::Sender<Vec<ReceivedRouteDetail>>,
    ),
    GetAdjacencyDatabases(
        oneshot::Sender<BTreeMap<String, BTreeMap<String, AdjacencyDatabase>>>,
    ),
    GetBestRoutesCache(oneshot::Sender<BTreeMap<IpNetwork, BestRoutes>>),
    GetCounters(oneshot::Sender<BTreeMap<String, i64>>),
}

// Handle used to query a running decision instance.
#[derive(Clone, Debug)]
pub struct DecisionApi {
    tx: UnboundedSender<ApiRequest>,
}

// Input endpoints of a decision instance.
#[derive(Clone, Debug)]
pub struct DecisionChannelsTx {
    pub kvstore: UnboundedSender<KvStoreUpdate>,
    pub static_routes: UnboundedSender<RouteUpdate>,
    pub peers: UnboundedSender<PeerEvent>,
    pub api: DecisionApi,
}

// Unified event consumed by the main loop.
enum Message {
    KvStore(KvStoreUpdate),
    StaticRoutes(RouteUpdate),
    Peers(PeerEvent),
    Api(ApiRequest),
    RebuildTimer,
    SavePolicyTimer,
    PolicyTtl,
    KvStoreClosed,
    StaticRoutesClosed,
    PeersClosed,
    ApiClosed,
    Stop,
}

// The decision orchestrator: consumes kv-store publications, static
// routes, peer events and API requests on a single-threaded cooperative
// loop, debounces bursts into one SPF computation, and publishes RIB
// deltas.
#[derive(Debug)]
pub struct Decision {
    config: Config,
    solver: SpfSolver,
    area_link_states: BTreeMap<String, LinkState>,
    prefix_state: PrefixState,
    pending_updates: PendingUpdates,
    // Last published RIB, the baseline of the next delta.
    route_db: DecisionRouteDb,
    initial_build_done: bool,
    rib_policy: Option<ActiveRibPolicy>,
    // Static routes bucketed by origin type; an update for one type only
    // replaces state of that type.
    static_unicast:
        BTreeMap<PrefixType, BTreeMap<IpNetwork, RibUnicastEntry>>,
    static_mpls: BTreeMap<PrefixType, BTreeMap<Label, RibMplsEntry>>,
    // Initialization gates.
    init_state: InitializationState,
    expected_peers: BTreeMap<String, BTreeSet<String>>,
    synced_areas: BTreeSet<String>,
    adjacency_db_synced: bool,
    // Timers.
    debouncer: Debouncer,
    save_policy_debouncer: Debouncer,
    // Local counters (solver statistics live in the solver).
    parse_errors: u64,
    rib_policy_invalidated_routes: u64,
    // Channels.
    routes_tx: UnboundedSender<RouteUpdate>,
    rx_kvstore: UnboundedReceiver<KvStoreUpdate>,
    rx_static_routes: UnboundedReceiver<RouteUpdate>,
    rx_peers: UnboundedReceiver<PeerEvent>,
    rx_api: UnboundedReceiver<ApiRequest>,
    kvstore_closed: bool,
    static_routes_closed: bool,
    peers_closed: bool,
    api_closed: bool,
}

// ===== impl DecisionApi =====

impl DecisionApi {
    pub async fn set_rib_policy(&self, policy: RibPolicy) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::SetRibPolicy(policy, tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)?
    }

    pub async fn get_rib_policy(&self) -> Result<RibPolicy, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetRibPolicy(tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)?
    }

    pub async fn clear_rib_policy(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::ClearRibPolicy(tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)?
    }

    // RIB snapshot for `node`: the last published RIB for the local
    // node, or a fresh computation for any other node.
    pub async fn get_route_db(
        &self,
        node: &str,
    ) -> Result<Option<DecisionRouteDb>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetRouteDb(node.to_owned(), tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)
    }

    pub async fn get_received_routes(
        &self,
        filter: ReceivedRouteFilter,
    ) -> Result<Vec<ReceivedRouteDetail>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetReceivedRoutes(filter, tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)
    }

    pub async fn get_adjacency_databases(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, AdjacencyDatabase>>, Error>
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetAdjacencyDatabases(tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)
    }

    pub async fn get_best_routes_cache(
        &self,
    ) -> Result<BTreeMap<IpNetwork, BestRoutes>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetBestRoutesCache(tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)
    }

    pub async fn counters(&self) -> Result<BTreeMap<String, i64>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ApiRequest::GetCounters(tx))
            .map_err(|_| Error::InstanceStopped)?;
        rx.await.map_err(|_| Error::InstanceStopped)
    }
}

// ===== impl Decision =====

impl Decision {
    pub fn new(
        config: Config,
        routes_tx: UnboundedSender<RouteUpdate>,
    ) -> (Decision, DecisionChannelsTx) {
        let (kvstore_tx, rx_kvstore) = mpsc::unbounded_channel();
        let (static_routes_tx, rx_static_routes) = mpsc::unbounded_channel();
        let (peers_tx, rx_peers) = mpsc::unbounded_channel();
        let (api_tx, rx_api) = mpsc::unbounded_channel();

        // Pick up a policy persisted by a previous incarnation.
        let rib_policy = if config.enable_rib_policy {
            rib_policy::load(&config.rib_policy_file)
        } else {
            None
        };

        let decision = Decision {
            solver: SpfSolver::new(config.clone()),
            area_link_states: Default::default(),
            prefix_state: Default::default(),
            pending_updates: PendingUpdates::new(&config.node_name),
            route_db: Default::default(),
            initial_build_done: false,
            rib_policy,
            static_unicast: Default::default(),
            static_mpls: Default::default(),
            init_state: InitializationState::WaitingPeers,
            expected_peers: Default::default(),
            synced_areas: Default::default(),
            adjacency_db_synced: false,
            debouncer: Debouncer::new(config.debounce_min, config.debounce_max),
            save_policy_debouncer: Debouncer::new(
                config.save_rib_policy_min,
                config.save_rib_policy_max,
            ),
            parse_errors: 0,
            rib_policy_invalidated_routes: 0,
            routes_tx,
            rx_kvstore,
            rx_static_routes,
            rx_peers,
            rx_api,
            kvstore_closed: false,
            static_routes_closed: false,
            peers_closed: false,
            api_closed: false,
            config,
        };
        let channels_tx = DecisionChannelsTx {
            kvstore: kvstore_tx,
            static_routes: static_routes_tx,
            peers: peers_tx,
            api: DecisionApi { tx: api_tx },
        };
        (decision, channels_tx)
    }

    // Main event loop. Runs until the input channels are closed; closing
    // them before initialization completes stops cleanly without
    // publishing anything.
    pub async fn run(mut self) {
        Debug::InstanceStart.log();

        loop {
            let policy_deadline =
                self.rib_policy.as_ref().map(|policy| policy.expires_at);

            let message = tokio::select! {
                biased;
                // Expired deadlines take precedence over queued input so
                // the debounce windows hold under load.
                _ = time::sleep_until(
                    policy_deadline.unwrap_or_else(Instant::now)),
                    if policy_deadline.is_some() =>
                {
                    Message::PolicyTtl
                }
                _ = time::sleep_until(self.debouncer.deadline()),
                    if self.debouncer.is_pending() =>
                {
                    Message::RebuildTimer
                }
                _ = time::sleep_until(self.save_policy_debouncer.deadline()),
                    if self.save_policy_debouncer.is_pending() =>
                {
                    Message::SavePolicyTimer
                }
                event = self.rx_peers.recv(),
                    if !self.peers_closed =>
                {
                    event.map(Message::Peers).unwrap_or(Message::PeersClosed)
                }
                // KvStore input stays queued until the initial peers are
                // known.
                update = self.rx_kvstore.recv(),
                    if !self.kvstore_closed
                        && self.init_state != InitializationState::WaitingPeers =>
                {
                    update
                        .map(Message::KvStore)
                        .unwrap_or(Message::KvStoreClosed)
                }
                update = self.rx_static_routes.recv(),
                    if !self.static_routes_closed =>
                {
                    update
                        .map(Message::StaticRoutes)
                        .unwrap_or(Message::StaticRoutesClosed)
                }
                request = self.rx_api.recv(), if !self.api_closed => {
                    request.map(Message::Api).unwrap_or(Message::ApiClosed)
                }
                else => Message::Stop,
            };

            match message {
                Message::Peers(event) => self.process_peer_event(event),
                Message::KvStore(update) => {
                    self.process_kvstore_update(update)
                }
                Message::StaticRoutes(update) => {
                    self.process_static_routes_update(update)
                }
                Message::Api(request) => self.process_api_request(request),
                Message::RebuildTimer => {
                    self.debouncer.reset();
                    self.rebuild_routes();
                }
                Message::SavePolicyTimer => {
                    self.save_policy_debouncer.reset();
                    self.save_rib_policy();
                }
                Message::PolicyTtl => self.process_rib_policy_expiry(),
                Message::KvStoreClosed => self.kvstore_closed = true,
                Message::StaticRoutesClosed => {
                    self.static_routes_closed = true
                }
                Message::PeersClosed => self.peers_closed = true,
                Message::ApiClosed => self.api_closed = true,
                Message::Stop => break,
            }

            if self.should_stop() {
                break;
            }
        }

        Debug::InstanceStop.log();
    }

    fn should_stop(&self) -> bool {
        let inputs_closed = self.kvstore_closed
            && self.static_routes_closed
            && self.peers_closed;
        // With the peer stream gone before the first peer event, the
        // initialization gates can never open.
        let stuck_waiting_peers = self.peers_closed
            && self.init_state == InitializationState::WaitingPeers;
        inputs_closed || stuck_waiting_peers
    }

    // ===== input processing =====

    fn process_peer_event(&mut self, event: PeerEvent) {
        for (area, area_event) in event {
            let peers = self.expected_peers.entry(area).or_default();
            peers.extend(area_event.peers_to_add);
            for peer in &area_event.peers_to_del {
                peers.remove(peer);
            }
        }
        if self.init_state == InitializationState::WaitingPeers {
            self.transition(InitializationState::WaitingInitialSync);
        }
        self.check_initialization();
    }

    fn process_kvstore_update(&mut self, update: KvStoreUpdate) {
        match update {
            KvStoreUpdate::Publication(publication) => {
                self.process_publication(publication)
            }
            KvStoreUpdate::InitialSync { area } => {
                self.synced_areas.insert(area);
                self.check_initialization();
            }
            KvStoreUpdate::AdjacencyDbSynced => {
                self.adjacency_db_synced = true;
            }
        }
    }

    fn process_publication(&mut self, publication: Publication) {
        let area = publication.area.clone();

        for (key, value) in &publication.key_vals {
            match KvKey::parse(key) {
                Some(KvKey::Adjacency(node)) => {
                    match value.decode_adjacency() {
                        Ok(db) if db.node == node => {
                            self.apply_adjacency_database(
                                &area,
                                db,
                                value.version,
                            );
                        }
                        Ok(db) => {
                            self.parse_errors += 1;
                            Error::KeyOriginMismatch(key.clone(), db.node)
                                .log();
                        }
                        Err(error) => {
                            self.parse_errors += 1;
                            Error::AdjacencyDecode(key.clone(), error).log();
                        }
                    }
                }
                Some(KvKey::Prefix(prefix_key)) => {
                    // The viewer learns its own originations from the
                    // static-route stream; redistributed copies of them
                    // are ignored entirely.
                    if prefix_key.node == self.config.node_name {
                        Debug::SelfOriginatedPrefixSkip(&prefix_key).log();
                        continue;
                    }
                    match value.decode_prefix() {
                        Ok(db) => {
                            self.apply_prefix_database(prefix_key, db)
                        }
                        Err(error) => {
                            self.parse_errors += 1;
                            Error::PrefixDecode(key.clone(), error).log();
                        }
                    }
                }
                None => (),
            }
        }

        for key in &publication.expired_keys {
            match KvKey::parse(key) {
                Some(KvKey::Adjacency(node)) => {
                    if let Some(link_state) =
                        self.area_link_states.get_mut(&area)
                    {
                        let change =
                            link_state.delete_adjacency_database(&node);
                        self.pending_updates
                            .apply_link_state_change(&node, &change, None);
                    }
                }
                Some(KvKey::Prefix(prefix_key)) => {
                    if prefix_key.node == self.config.node_name {
                        continue;
                    }
                    Debug::PrefixWithdraw(&prefix_key).log();
                    let changed = self.prefix_state.delete_prefix(&prefix_key);
                    self.pending_updates
                        .apply_prefix_state_change(changed, None);
                }
                None => (),
            }
        }

        self.check_initialization();
        self.schedule_rebuild();
    }

    // The envelope version is the node's generation: an empty adjacency
    // set carried by a strictly newer generation withdraws the node from
    // the link state (see `LinkState::update_adjacency_database`).
    fn apply_adjacency_database(
        &mut self,
        area: &str,
        db: AdjacencyDatabase,
        version: i64,
    ) {
        let node = db.node.clone();
        let perf_events = db.perf_events.clone();
        let link_state = self
            .area_link_states
            .entry(area.to_owned())
            .or_insert_with(|| LinkState::new(area));
        let change = link_state.update_adjacency_database(
            db,
            version,
            !self.adjacency_db_synced,
        );
        self.pending_updates.apply_link_state_change(
            &node,
            &change,
            perf_events.as_ref(),
        );
    }

    fn apply_prefix_database(
        &mut self,
        prefix_key: PrefixKey,
        db: PrefixDatabase,
    ) {
        let perf_events = db.perf_events.clone();
        let changed = if db.delete_prefix {
            Debug::PrefixWithdraw(&prefix_key).log();
            self.prefix_state.delete_prefix(&prefix_key)
        } else {
            let entry = db
                .prefix_entries
                .iter()
                .find(|entry| entry.prefix == prefix_key.prefix);
            let Some(entry) = entry else {
                self.parse_errors += 1;
                Error::KeyOriginMismatch(prefix_key.to_string(), db.node)
                    .log();
                return;
            };
            Debug::PrefixUpdate(&prefix_key).log();
            self.prefix_state.update_prefix(&prefix_key, entry.clone())
        };
        self.pending_updates
            .apply_prefix_state_change(changed, perf_events.as_ref());
    }

    fn process_static_routes_update(&mut self, update: RouteUpdate) {
        let prefix_type = update.prefix_type.unwrap_or(PrefixType::Config);

        let mut changed_prefixes = BTreeSet::new();
        let unicast = self.static_unicast.entry(prefix_type).or_default();
        for (prefix, entry) in update.unicast_routes_to_update {
            unicast.insert(prefix, entry);
            changed_prefixes.insert(prefix);
        }
        for prefix in update.unicast_routes_to_delete {
            unicast.remove(&prefix);
            changed_prefixes.insert(prefix);
        }

        let mpls_changed = !update.mpls_routes_to_update.is_empty()
            || !update.mpls_routes_to_delete.is_empty();
        let mpls = self.static_mpls.entry(prefix_type).or_default();
        for (label, entry) in update.mpls_routes_to_update {
            mpls.insert(label, entry);
        }
        for label in update.mpls_routes_to_delete {
            mpls.remove(&label);
        }

        self.solver
            .set_static_unicast_routes(self.merged_static_unicast());
        self.solver.set_static_mpls_routes(self.merged_static_mpls());

        if mpls_changed {
            self.pending_updates.set_needs_full_rebuild();
        }
        if !changed_prefixes.is_empty() {
            self.pending_updates.apply_prefix_state_change(
                changed_prefixes,
                update.perf_events.as_ref(),
            );
        }
        self.schedule_rebuild();
    }

    fn merged_static_unicast(
        &self,
    ) -> BTreeMap<IpNetwork, RibUnicastEntry> {
        self.static_unicast
            .values()
            .flatten()
            .map(|(prefix, entry)| (*prefix, entry.clone()))
            .collect()
    }

    fn merged_static_mpls(&self) -> BTreeMap<Label, RibMplsEntry> {
        self.static_mpls
            .values()
            .flatten()
            .map(|(label, entry)| (*label, entry.clone()))
            .collect()
    }

    // ===== API processing =====

    fn process_api_request(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::SetRibPolicy(policy, responder) => {
                let _ = responder.send(self.set_rib_policy(policy));
            }
            ApiRequest::GetRibPolicy(responder) => {
                let _ = responder.send(self.get_rib_policy());
            }
            ApiRequest::ClearRibPolicy(responder) => {
                let _ = responder.send(self.clear_rib_policy());
            }
            ApiRequest::GetRouteDb(node, responder) => {
                let route_db = if node == self.config.node_name {
                    Some(self.route_db.clone())
                } else {
                    // Foreign viewers get a fresh computation without
                    // the local static routes.
                    let mut config = self.config.clone();
                    config.node_name = node.clone();
                    SpfSolver::new(config).build_route_db(
                        &node,
                        &self.area_link_states,
                        &self.prefix_state,
                    )
                };
                let _ = responder.send(route_db);
            }
            ApiRequest::GetReceivedRoutes(filter, responder) => {
                let _ = responder
                    .send(self.prefix_state.get_received_routes(&filter));
            }
            ApiRequest::GetAdjacencyDatabases(responder) => {
                let databases = self
                    .area_link_states
                    .iter()
                    .map(|(area, link_state)| {
                        (area.clone(), link_state.adjacency_databases().clone())
                    })
                    .collect();
                let _ = responder.send(databases);
            }
            ApiRequest::GetBestRoutesCache(responder) => {
                let _ =
                    responder.send(self.solver.best_routes_cache().clone());
            }
            ApiRequest::GetCounters(responder) => {
                let _ = responder.send(self.counters());
            }
        }
    }

    fn set_rib_policy(&mut self, policy: RibPolicy) -> Result<(), Error> {
        if !self.config.enable_rib_policy {
            return Err(Error::RibPolicyDisabled);
        }
        policy.validate()?;
        Debug::RibPolicySet(policy.ttl_secs).log();
        self.rib_policy = Some(ActiveRibPolicy::new(policy));
        self.save_policy_debouncer.push();
        self.pending_updates.set_needs_full_rebuild();
        self.schedule_rebuild();
        Ok(())
    }

    fn get_rib_policy(&self) -> Result<RibPolicy, Error> {
        if !self.config.enable_rib_policy {
            return Err(Error::RibPolicyDisabled);
        }
        match &self.rib_policy {
            Some(policy) if !policy.is_expired() => Ok(policy.remaining()),
            _ => Err(Error::RibPolicyNotFound),
        }
    }

    fn clear_rib_policy(&mut self) -> Result<(), Error> {
        if !self.config.enable_rib_policy {
            return Err(Error::RibPolicyDisabled);
        }
        if self.rib_policy.take().is_some() {
            Debug::RibPolicyClear.log();
            self.save_policy_debouncer.push();
            self.pending_updates.set_needs_full_rebuild();
            self.schedule_rebuild();
        }
        Ok(())
    }

    fn process_rib_policy_expiry(&mut self) {
        if self
            .rib_policy
            .as_ref()
            .is_some_and(|policy| policy.is_expired())
        {
            Debug::RibPolicyExpired.log();
            self.rib_policy = None;
            self.save_policy_debouncer.push();
            self.pending_updates.set_needs_full_rebuild();
            self.schedule_rebuild();
        }
    }

    fn save_rib_policy(&self) {
        if let Err(error) = rib_policy::save(
            &self.config.rib_policy_file,
            self.rib_policy.as_ref(),
        ) {
            error.log();
        }
    }

    // ===== initialization =====

    fn transition(&mut self, new_state: InitializationState) {
        if self.init_state != new_state {
            self.init_state = new_state;
            Debug::InitializationStateChange(new_state).log();
        }
    }

    // Route computation unblocks once, per area with expected peers, the
    // initial-sync sentinel arrived and every expected peer shares a
    // bidirectionally visible adjacency with this node.
    fn check_initialization(&mut self) {
        if matches!(
            self.init_state,
            InitializationState::WaitingPeers | InitializationState::Ready
        ) {
            return;
        }

        if !self
            .expected_peers
            .keys()
            .all(|area| self.synced_areas.contains(area))
        {
            self.transition(InitializationState::WaitingInitialSync);
            return;
        }
        self.transition(InitializationState::WaitingAdjacencies);

        let all_adjacent =
            self.expected_peers.iter().all(|(area, peers)| {
                peers.iter().all(|peer| {
                    self.area_link_states.get(area).is_some_and(
                        |link_state| {
                            link_state.has_bidir_adjacency(
                                &self.config.node_name,
                                peer,
                            )
                        },
                    )
                })
            });
        if all_adjacent {
            self.transition(InitializationState::Ready);
            // Publish the initial RIB.
            self.pending_updates.set_needs_full_rebuild();
            self.debouncer.push();
        }
    }

    // ===== route computation =====

    fn schedule_rebuild(&mut self) {
        if self.init_state == InitializationState::Ready
            && self.pending_updates.needs_route_update()
        {
            self.debouncer.push();
        }
    }

    fn rebuild_routes(&mut self) {
        if self.init_state != InitializationState::Ready
            || !self.pending_updates.needs_route_update()
        {
            return;
        }
        let (needs_full_rebuild, updated_prefixes, perf_events) =
            self.pending_updates.take();
        let node_name = self.config.node_name.clone();

        let mut new_route_db = if needs_full_rebuild
            || !self.initial_build_done
        {
            self.initial_build_done = true;
            match self.solver.build_route_db(
                &node_name,
                &self.area_link_states,
                &self.prefix_state,
            ) {
                Some(route_db) => route_db,
                // The viewer isn't in any link state yet; only the
                // static routes can be offered.
                None => DecisionRouteDb {
                    unicast: self.merged_static_unicast(),
                    mpls: self.merged_static_mpls(),
                },
            }
        } else {
            let mut route_db = self.route_db.clone();
            self.solver.update_routes_for_prefixes(
                &node_name,
                &updated_prefixes,
                &self.area_link_states,
                &self.prefix_state,
                &mut route_db,
            );
            route_db
        };

        if let Some(active) = &self.rib_policy {
            if !active.is_expired() {
                self.rib_policy_invalidated_routes += rib_policy::apply_policy(
                    &mut new_route_db.unicast,
                    &active.policy,
                );
            }
        }

        let mut update = self.route_db.calculate_update(&new_route_db);
        update.perf_events = perf_events;
        Debug::RouteUpdatePublish(
            update.unicast_routes_to_update.len(),
            update.unicast_routes_to_delete.len(),
            update.mpls_routes_to_update.len(),
            update.mpls_routes_to_delete.len(),
        )
        .log();
        self.route_db = new_route_db;
        let _ = self.routes_tx.send(update);
    }

    // ===== counters =====

    fn counters(&self) -> BTreeMap<String, i64> {
        let mut counters = BTreeMap::new();
        let stats = &self.solver.stats;
        counters
            .insert("decision.spf_runs".to_owned(), stats.spf_runs as i64);
        counters.insert(
            "decision.route_build_runs".to_owned(),
            stats.route_build_runs as i64,
        );
        counters.insert(
            "decision.get_route_for_prefix".to_owned(),
            stats.get_route_for_prefix as i64,
        );
        counters.insert(
            "decision.duplicate_node_label.count.60".to_owned(),
            stats.duplicate_node_label.count(),
        );
        counters.insert(
            "decision.no_route_to_prefix.count.60".to_owned(),
            stats.no_route_to_prefix.count(),
        );
        counters.insert(
            "decision.skipped_mpls_route.count.60".to_owned(),
            stats.skipped_mpls_route.count(),
        );
        counters.insert(
            "decision.no_route_to_label.count.60".to_owned(),
            stats.no_route_to_label.count(),
        );

        let num_nodes = self
            .area_link_states
            .values()
            .flat_map(|link_state| link_state.nodes())
            .chain(std::iter::once(&self.config.node_name))
            .unique()
            .count();
        counters.insert("decision.num_nodes".to_owned(), num_nodes as i64);
        counters.insert(
            "decision.num_prefixes".to_owned(),
            self.prefix_state.num_prefixes() as i64,
        );
        counters.insert(
            "decision.num_partial_adjacencies".to_owned(),
            self.area_link_states
                .values()
                .map(|link_state| link_state.num_partial_adjacencies() as i64)
                .sum(),
        );
        counters.insert(
            "decision.num_complete_adjacencies".to_owned(),
            self.area_link_states
                .values()
                .map(|link_state| link_state.num_complete_adjacencies() as i64)
                .sum(),
        );
        counters.insert(
            "decision.rib_policy.invalidated_routes.count".to_owned(),
            self.rib_policy_invalidated_routes as i64,
        );
        counters.insert(
            "decision.parse_errors".to_owned(),
            self.parse_errors as i64,
        );

        // Propagation-time averages merged across areas.
        for (name, up) in [
            (
                "decision.linkstate.up.propagation_time_ms.avg.60",
                true,
            ),
            (
                "decision.linkstate.down.propagation_time_ms.avg.60",
                false,
            ),
        ] {
            let (mut sum, mut count) = (0, 0);
            for link_state in self.area_link_states.values() {
                let stats = if up {
                    link_state.up_propagation()
                } else {
                    link_state.down_propagation()
                };
                sum += stats.sum();
                count += stats.count();
            }
            let avg = if count == 0 { 0 } else { sum / count };
            counters.insert(name.to_owned(), avg);
        }

        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjacency::Adjacency;
    use crate::kv::Value;

    fn decision(node: &str) -> Decision {
        let (routes_tx, _routes_rx) = mpsc::unbounded_channel();
        let mut config = Config::new(node);
        config.enable_rib_policy = false;
        let (decision, _channels) = Decision::new(config, routes_tx);
        decision
    }

    fn adjacency(
        other_node: &str,
        if_name: &str,
        other_if_name: &str,
    ) -> Adjacency {
        Adjacency::new(
            other_node.to_owned(),
            if_name.to_owned(),
            other_if_name.to_owned(),
            format!("fe80::{}", other_node).parse().unwrap(),
            format!("192.168.0.{}", other_node).parse().unwrap(),
            10,
        )
    }

    fn adj_publication(area: &str, dbs: Vec<AdjacencyDatabase>) -> Publication {
        let mut publication = Publication::new(area);
        for db in dbs {
            publication.key_vals.insert(
                format!("adj:{}", db.node),
                Value::adjacency(1, &db),
            );
        }
        publication
    }

    #[test]
    fn test_initialization_gates() {
        let mut decision = decision("1");
        assert_eq!(decision.init_state, InitializationState::WaitingPeers);

        // Expect peer "2" in area "0".
        let event: PeerEvent = [(
            "0".to_owned(),
            AreaPeerEvent {
                peers_to_add: ["2".to_owned()].into(),
                peers_to_del: Default::default(),
            },
        )]
        .into();
        decision.process_peer_event(event);
        assert_eq!(
            decision.init_state,
            InitializationState::WaitingInitialSync
        );

        // Initial sync of the area moves on to waiting for adjacencies.
        decision.process_kvstore_update(KvStoreUpdate::InitialSync {
            area: "0".to_owned(),
        });
        assert_eq!(
            decision.init_state,
            InitializationState::WaitingAdjacencies
        );

        // A one-way adjacency isn't enough.
        decision.process_publication(adj_publication(
            "0",
            vec![AdjacencyDatabase::new(
                "1",
                1,
                vec![adjacency("2", "1/2", "2/1")],
            )],
        ));
        assert_eq!(
            decision.init_state,
            InitializationState::WaitingAdjacencies
        );

        // The reverse half unblocks initialization.
        decision.process_publication(adj_publication(
            "0",
            vec![AdjacencyDatabase::new(
                "2",
                2,
                vec![adjacency("1", "2/1", "1/2")],
            )],
        ));
        assert_eq!(decision.init_state, InitializationState::Ready);
        assert!(decision.debouncer.is_pending());
    }

    #[test]
    fn test_peer_down_removes_expectation() {
        let mut decision = decision("1");
        let event: PeerEvent = [(
            "0".to_owned(),
            AreaPeerEvent {
                peers_to_add: ["2".to_owned(), "3".to_owned()].into(),
                peers_to_del: Default::default(),
            },
        )]
        .into();
        decision.process_peer_event(event);
        decision.process_kvstore_update(KvStoreUpdate::InitialSync {
            area: "0".to_owned(),
        });
        decision.process_publication(adj_publication(
            "0",
            vec![
                AdjacencyDatabase::new(
                    "1",
                    1,
                    vec![adjacency("2", "1/2", "2/1")],
                ),
                AdjacencyDatabase::new(
                    "2",
                    2,
                    vec![adjacency("1", "2/1", "1/2")],
                ),
            ],
        ));
        // Still waiting for peer "3".
        assert_eq!(
            decision.init_state,
            InitializationState::WaitingAdjacencies
        );

        // Peer-down removes the expectation and unblocks.
        let event: PeerEvent = [(
            "0".to_owned(),
            AreaPeerEvent {
                peers_to_add: Default::default(),
                peers_to_del: ["3".to_owned()].into(),
            },
        )]
        .into();
        decision.process_peer_event(event);
        assert_eq!(decision.init_state, InitializationState::Ready);
    }

    #[test]
    fn test_initial_counters() {
        let decision = decision("1");
        let counters = decision.counters();
        assert_eq!(counters["decision.num_nodes"], 1);
        assert_eq!(counters["decision.num_prefixes"], 0);
        assert_eq!(counters["decision.spf_runs"], 0);
    }

    #[test]
    fn test_self_redistribution_suppression() {
        let mut decision = decision("1");
        // An empty peer event opens all gates; run the initial rebuild
        // so the scheduler is quiescent again.
        decision.process_peer_event(PeerEvent::default());
        assert_eq!(decision.init_state, InitializationState::Ready);
        decision.debouncer.reset();
        decision.rebuild_routes();

        let mut publication = Publication::new("0");
        let db = PrefixDatabase {
            node: "1".to_owned(),
            prefix_entries: vec![crate::prefix::PrefixEntry::new(
                "fc00::1/128".parse().unwrap(),
                PrefixType::Rib,
            )],
            perf_events: None,
            delete_prefix: false,
        };
        publication
            .key_vals
            .insert("prefix:1:0:fc00::1/128".to_owned(), Value::prefix(1, &db));
        decision.process_publication(publication);

        // Neither the prefix state nor the scheduler saw the update.
        assert_eq!(decision.prefix_state.num_prefixes(), 0);
        assert!(!decision.pending_updates.needs_route_update());
        assert!(!decision.debouncer.is_pending());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let mut decision = decision("1");
        decision.process_peer_event(PeerEvent::default());
        decision.debouncer.reset();
        decision.rebuild_routes();

        let mut publication = Publication::new("0");
        publication.key_vals.insert(
            "adj2:1".to_owned(),
            Value::new(1, "1".to_owned(), b"junk".to_vec()),
        );
        publication.key_vals.insert(
            "unrelated".to_owned(),
            Value::new(1, "1".to_owned(), b"junk".to_vec()),
        );
        decision.process_publication(publication);
        assert_eq!(decision.parse_errors, 0);
        assert!(!decision.pending_updates.needs_route_update());
    }

    #[test]
    fn test_corrupt_value_counted() {
        let mut decision = decision("1");
        decision.process_peer_event(PeerEvent::default());

        let mut publication = Publication::new("0");
        publication.key_vals.insert(
            "adj:9".to_owned(),
            Value::new(1, "9".to_owned(), b"not json".to_vec()),
        );
        decision.process_publication(publication);
        assert_eq!(decision.parse_errors, 1);
    }
}
