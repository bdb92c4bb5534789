use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use glam::{IVec3, Vec3};
use lodtrack_common::{ChunkKey, LodChunk, align_down};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::config::{ConfigError, TrackerConfig};
use crate::dominator::{Dominator, Transition, TransitionGroup, group_transitions};
use crate::error::TrackerError;
use crate::query::{LeafUpdate, SpatialQuery};
use crate::request::{ChunkProducer, DataRequest, RenderData};

/// Notifications emitted by a [`Tracker`], in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent<P> {
    ChunkAdded {
        chunk: LodChunk,
        payload: RenderData<P>,
    },
    ChunkRemoved {
        chunk: LodChunk,
    },
    /// Every dominator of the cycle has been started. Some may still be
    /// waiting on their incoming chunks.
    CycleComplete {
        coord: IVec3,
    },
    /// The cycle was aborted before any state changed.
    CycleFailed {
        coord: IVec3,
        error: TrackerError,
    },
}

/// Counters for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    /// Queued positions overwritten by a newer one before they ran.
    pub updates_coalesced: u64,
    pub requests_created: u64,
    pub requests_reused: u64,
    pub requests_cancelled: u64,
    pub dominators_started: u64,
    pub chunks_added: u64,
    pub chunks_removed: u64,
    pub rendered_chunks: usize,
    pub live_requests: usize,
    pub last_cycle_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Updating { queued: Option<Vec3> },
}

struct TrackerState<P: Clone + 'static> {
    phase: Phase,
    last_update_coord: Option<IVec3>,
    /// Bumped by `destroy`; cycles started in an older epoch are discarded.
    epoch: u64,
    rendered_chunks: BTreeMap<ChunkKey, LodChunk>,
    data_requests: BTreeMap<ChunkKey, DataRequest<P>>,
    dominators: BTreeMap<ChunkKey, Dominator<P>>,
    stats: TrackerStats,
}

type Payload<R> = <R as ChunkProducer>::Payload;

struct Shared<Q: SpatialQuery, R: ChunkProducer> {
    config: TrackerConfig,
    query: Q,
    producer: R,
    handle: RefCell<Option<Rc<Q::Handle>>>,
    state: RefCell<TrackerState<Payload<R>>>,
    events: mpsc::UnboundedSender<TrackerEvent<Payload<R>>>,
    busy: watch::Sender<bool>,
}

impl<Q: SpatialQuery, R: ChunkProducer> Shared<Q, R> {
    fn emit(&self, event: TrackerEvent<Payload<R>>) {
        if self.events.send(event).is_err() {
            tracing::trace!("tracker event receiver dropped");
        }
    }

    /// Dominator callback: remove outgoing chunks, then add incoming ones.
    fn apply_transition(&self, transition: Transition<Payload<R>>) {
        let mut events = Vec::with_capacity(transition.outgoing.len() + transition.incoming.len());
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            for chunk in transition.outgoing {
                state.rendered_chunks.remove(&chunk.key);
                state.stats.chunks_removed += 1;
                events.push(TrackerEvent::ChunkRemoved { chunk });
            }
            for (chunk, payload) in transition.incoming.into_iter().zip(transition.payloads) {
                state.rendered_chunks.insert(chunk.key, chunk.clone());
                state.stats.chunks_added += 1;
                events.push(TrackerEvent::ChunkAdded { chunk, payload });
            }
            state.stats.rendered_chunks = state.rendered_chunks.len();
        }
        tracing::trace!(base = %transition.base, "transition applied");
        for event in events {
            self.emit(event);
        }
    }
}

/// Single-flight LOD update scheduler.
///
/// Each [`update`](Tracker::update) that crosses a cell boundary runs one
/// cycle: query the leaf set, reconcile data requests, rebuild dominators.
/// Positions arriving during a cycle are coalesced to the latest one.
///
/// Cycles run as local tasks, so the tracker must be driven from within a
/// [`tokio::task::LocalSet`]. Clones share the same tracker.
pub struct Tracker<Q: SpatialQuery + 'static, R: ChunkProducer + 'static> {
    shared: Rc<Shared<Q, R>>,
}

impl<Q: SpatialQuery + 'static, R: ChunkProducer + 'static> Clone for Tracker<Q, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<Q: SpatialQuery + 'static, R: ChunkProducer + 'static> Tracker<Q, R> {
    pub fn new(
        config: TrackerConfig,
        query: Q,
        producer: R,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TrackerEvent<Payload<R>>>), ConfigError> {
        config.validate()?;
        let (events, receiver) = mpsc::unbounded_channel();
        let (busy, _) = watch::channel(false);
        let shared = Shared {
            config,
            query,
            producer,
            handle: RefCell::new(None),
            state: RefCell::new(TrackerState {
                phase: Phase::Idle,
                last_update_coord: None,
                epoch: 0,
                rendered_chunks: BTreeMap::new(),
                data_requests: BTreeMap::new(),
                dominators: BTreeMap::new(),
                stats: TrackerStats::default(),
            }),
            events,
            busy,
        };
        Ok((
            Self {
                shared: Rc::new(shared),
            },
            receiver,
        ))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Feed a viewer position. Never blocks.
    ///
    /// While idle, a position in the last processed grid cell is ignored.
    /// While a cycle runs, the position replaces any queued one and is
    /// processed when the cycle ends.
    pub fn update(&self, position: Vec3) {
        let coord = self.shared.config.grid_coord(position);
        let (previous, epoch) = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            if let Phase::Updating { queued } = &mut state.phase {
                if queued.replace(position).is_some() {
                    state.stats.updates_coalesced += 1;
                }
                return;
            }
            if state.last_update_coord == Some(coord) {
                return;
            }
            let previous = state.last_update_coord.replace(coord);
            state.phase = Phase::Updating { queued: None };
            (previous, state.epoch)
        };

        self.shared.busy.send_replace(true);
        let tracker = self.clone();
        let span = tracing::debug_span!("tracker_cycle", %coord);
        tokio::task::spawn_local(
            async move { tracker.run(position, coord, previous, epoch).await }.instrument(span),
        );
    }

    async fn run(self, position: Vec3, coord: IVec3, previous: Option<IVec3>, epoch: u64) {
        let started = Instant::now();
        let result = self.cycle(position, coord, epoch).await;

        let (result, queued) = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            // A destroy during the cycle discards its outcome, failed or not.
            let result = if state.epoch == epoch {
                result
            } else {
                Err(TrackerError::Destroyed)
            };
            match &result {
                Ok(()) => {
                    state.stats.cycles_completed += 1;
                    state.stats.last_cycle_time = started.elapsed();
                }
                Err(TrackerError::Destroyed) => {}
                Err(_) => {
                    state.last_update_coord = previous;
                    state.stats.cycles_failed += 1;
                }
            }
            let queued = match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Updating { queued } => queued,
                Phase::Idle => None,
            };
            (result, queued)
        };

        match result {
            Ok(()) => {
                tracing::debug!(elapsed = ?started.elapsed(), "cycle complete");
                self.shared.emit(TrackerEvent::CycleComplete { coord });
            }
            Err(TrackerError::Destroyed) => {
                tracing::debug!("cycle discarded after destroy");
            }
            Err(error) => {
                tracing::error!(%error, "update cycle failed; tracker state unchanged");
                self.shared.emit(TrackerEvent::CycleFailed { coord, error });
            }
        }

        if let Some(next) = queued {
            self.update(next);
        }
        if !self.is_updating() {
            self.shared.busy.send_replace(false);
        }
    }

    async fn cycle(&self, position: Vec3, coord: IVec3, epoch: u64) -> Result<(), TrackerError> {
        let handle = self.handle().await?;
        let update = self.shared.query.query_update(&*handle, position).await?;
        if self.shared.state.borrow().epoch != epoch {
            return Err(TrackerError::Destroyed);
        }

        // Plan and validate before touching any state.
        let leaves = parse_leaves(&update)?;
        let old: Vec<LodChunk> = self
            .shared
            .state
            .borrow()
            .rendered_chunks
            .values()
            .cloned()
            .collect();
        let new: Vec<LodChunk> = leaves.values().cloned().collect();
        let groups = group_transitions(&old, &new)?;
        tracing::debug!(
            leaves = leaves.len(),
            rendered = old.len(),
            groups = groups.len(),
            %coord,
            "planned cycle"
        );

        let mut requests = std::mem::take(&mut self.shared.state.borrow_mut().data_requests);
        self.reconcile(&mut requests, &leaves);

        let stale = std::mem::take(&mut self.shared.state.borrow_mut().dominators);
        for (_, mut dominator) in stale {
            dominator.cancel();
        }

        let mut dominators = self.build_dominators(groups, &mut requests);
        {
            let mut state = self.shared.state.borrow_mut();
            state.stats.live_requests = requests.len();
            state.data_requests = requests;
        }

        // Dominators with nothing pending fire synchronously and borrow the
        // state, so no borrow may be held here.
        for dominator in dominators.values_mut() {
            dominator.start();
        }

        let mut state = self.shared.state.borrow_mut();
        state.stats.dominators_started += dominators.len() as u64;
        state.dominators = dominators;
        Ok(())
    }

    async fn handle(&self) -> Result<Rc<Q::Handle>, TrackerError> {
        if let Some(handle) = self.shared.handle.borrow().as_ref() {
            return Ok(Rc::clone(handle));
        }
        let params = self.shared.config.handle_params();
        let handle = Rc::new(self.shared.query.create_handle(params).await?);
        *self.shared.handle.borrow_mut() = Some(Rc::clone(&handle));
        Ok(handle)
    }

    /// Keep requests whose chunk is lod-equal to a new leaf, cancel the
    /// rest, and create requests for leaves that have none.
    fn reconcile(
        &self,
        requests: &mut BTreeMap<ChunkKey, DataRequest<Payload<R>>>,
        leaves: &BTreeMap<ChunkKey, LodChunk>,
    ) {
        let (mut reused, mut cancelled, mut created) = (0u64, 0u64, 0u64);

        requests.retain(|key, request| match leaves.get(key) {
            Some(leaf) if leaf.lod_equals(&request.chunk()) => {
                request.replace_node(leaf.clone());
                reused += 1;
                true
            }
            _ => {
                request.cancel();
                cancelled += 1;
                false
            }
        });

        for (key, leaf) in leaves {
            if !requests.contains_key(key) {
                requests.insert(*key, DataRequest::create(leaf.clone(), &self.shared.producer));
                created += 1;
            }
        }

        tracing::debug!(reused, cancelled, created, "reconciled data requests");
        let mut state = self.shared.state.borrow_mut();
        state.stats.requests_reused += reused;
        state.stats.requests_cancelled += cancelled;
        state.stats.requests_created += created;
    }

    fn build_dominators(
        &self,
        groups: BTreeMap<ChunkKey, TransitionGroup>,
        requests: &mut BTreeMap<ChunkKey, DataRequest<Payload<R>>>,
    ) -> BTreeMap<ChunkKey, Dominator<Payload<R>>> {
        groups
            .into_iter()
            .map(|(base, group)| {
                let incoming = group
                    .incoming
                    .into_iter()
                    .map(|chunk| {
                        let request = requests
                            .entry(chunk.key)
                            .or_insert_with(|| {
                                DataRequest::create(chunk.clone(), &self.shared.producer)
                            })
                            .clone();
                        (chunk, request)
                    })
                    .collect();

                let weak: Weak<Shared<Q, R>> = Rc::downgrade(&self.shared);
                let on_load = move |transition: Transition<Payload<R>>| {
                    if let Some(shared) = weak.upgrade() {
                        shared.apply_transition(transition);
                    }
                };
                (base, Dominator::new(base, group.outgoing, incoming, on_load))
            })
            .collect()
    }

    /// True while a cycle is in flight.
    pub fn is_updating(&self) -> bool {
        matches!(self.shared.state.borrow().phase, Phase::Updating { .. })
    }

    /// Resolves once no cycle is in flight and none is queued.
    pub async fn idle(&self) {
        let mut rx = self.shared.busy.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub fn last_update_coord(&self) -> Option<IVec3> {
        self.shared.state.borrow().last_update_coord
    }

    /// Currently visible chunks, in key order.
    pub fn rendered_chunks(&self) -> Vec<LodChunk> {
        self.shared
            .state
            .borrow()
            .rendered_chunks
            .values()
            .cloned()
            .collect()
    }

    pub fn data_request(&self, key: ChunkKey) -> Option<DataRequest<Payload<R>>> {
        self.shared.state.borrow().data_requests.get(&key).cloned()
    }

    /// Dominators of the current cycle that have not fired yet.
    pub fn pending_dominators(&self) -> usize {
        self.shared
            .state
            .borrow()
            .dominators
            .values()
            .filter(|dominator| !dominator.is_fired())
            .count()
    }

    pub fn stats(&self) -> TrackerStats {
        self.shared.state.borrow().stats.clone()
    }

    /// Wait until every live data request has settled.
    pub async fn wait_for_load(&self) -> Vec<(LodChunk, RenderData<Payload<R>>)> {
        let requests: Vec<_> = self
            .shared
            .state
            .borrow()
            .data_requests
            .values()
            .cloned()
            .collect();
        let mut loaded = Vec::with_capacity(requests.len());
        for request in requests {
            let data = request.wait_for_load().await;
            loaded.push((request.chunk(), data));
        }
        loaded
    }

    /// Cancel everything, remove every rendered chunk and reset.
    ///
    /// A cycle in flight is discarded when it resumes; the tracker can be
    /// updated again afterwards.
    pub fn destroy(&self) {
        let (dominators, requests, rendered) = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            state.epoch += 1;
            state.last_update_coord = None;
            if let Phase::Updating { queued } = &mut state.phase {
                *queued = None;
            }
            state.stats.rendered_chunks = 0;
            state.stats.live_requests = 0;
            (
                std::mem::take(&mut state.dominators),
                std::mem::take(&mut state.data_requests),
                std::mem::take(&mut state.rendered_chunks),
            )
        };
        *self.shared.handle.borrow_mut() = None;

        drop(dominators);
        for request in requests.values() {
            request.cancel();
        }
        tracing::debug!(
            rendered = rendered.len(),
            requests = requests.len(),
            "tracker destroyed"
        );

        let removed = rendered.len() as u64;
        for chunk in rendered.into_values() {
            self.shared.emit(TrackerEvent::ChunkRemoved { chunk });
        }
        self.shared.state.borrow_mut().stats.chunks_removed += removed;
    }
}

/// Leaf chunks of a query result, keyed by identity.
///
/// Rejects duplicates and cells that are not size-aligned powers of two.
pub fn parse_leaves(update: &LeafUpdate) -> Result<BTreeMap<ChunkKey, LodChunk>, TrackerError> {
    let mut leaves = BTreeMap::new();
    for cell in update.leaf_cells.iter().filter(|cell| cell.is_leaf) {
        let chunk = cell.to_chunk();
        let key = chunk.key;
        if key.size <= 0 || key.size & (key.size - 1) != 0 {
            return Err(TrackerError::MalformedLeaf {
                key,
                reason: "size is not a positive power of two",
            });
        }
        if align_down(key.min, key.size) != key.min {
            return Err(TrackerError::MalformedLeaf {
                key,
                reason: "min corner is not aligned to the cell size",
            });
        }
        if leaves.insert(key, chunk).is_some() {
            return Err(TrackerError::DuplicateLeaf(key));
        }
    }
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::sync::{Semaphore, oneshot};
    use tokio::task::LocalSet;

    use super::*;
    use crate::error::QueryError;
    use crate::query::{HandleParams, LeafCellSpec, LocalHandle, LocalOctreeQuery};
    use crate::request::{ChunkPayload, RequestData};

    const CHUNK: f32 = 16.0;

    fn config(lods: u32, min_lod_range: i32) -> TrackerConfig {
        TrackerConfig {
            chunk_size: CHUNK,
            lods,
            min_lod_range,
            track_y: false,
        }
    }

    fn at(x: i32, z: i32) -> Vec3 {
        Vec3::new(x as f32 * CHUNK + 1.0, 0.0, z as f32 * CHUNK + 1.0)
    }

    async fn flush() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn drain<P>(events: &mut mpsc::UnboundedReceiver<TrackerEvent<P>>) -> Vec<TrackerEvent<P>> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Local octree query that records positions, can be gated, and can be
    /// told to fail or to return a canned leaf set once.
    struct ScriptedQuery {
        inner: LocalOctreeQuery,
        positions: RefCell<Vec<Vec3>>,
        gate: Option<Rc<Semaphore>>,
        fail_next: Cell<bool>,
        reply_next: RefCell<Option<LeafUpdate>>,
    }

    impl ScriptedQuery {
        fn new() -> Self {
            Self {
                inner: LocalOctreeQuery::new(CHUNK),
                positions: RefCell::new(Vec::new()),
                gate: None,
                fail_next: Cell::new(false),
                reply_next: RefCell::new(None),
            }
        }

        fn gated(gate: &Rc<Semaphore>) -> Self {
            Self {
                gate: Some(Rc::clone(gate)),
                ..Self::new()
            }
        }
    }

    impl SpatialQuery for Rc<ScriptedQuery> {
        type Handle = LocalHandle;

        async fn create_handle(&self, params: HandleParams) -> Result<LocalHandle, QueryError> {
            self.inner.create_handle(params).await
        }

        async fn query_update(
            &self,
            handle: &LocalHandle,
            position: Vec3,
        ) -> Result<LeafUpdate, QueryError> {
            self.positions.borrow_mut().push(position);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail_next.replace(false) {
                return Err(QueryError::Unavailable("injected".to_string()));
            }
            if let Some(update) = self.reply_next.borrow_mut().take() {
                return Ok(update);
            }
            self.inner.query_update(handle, position).await
        }
    }

    /// Never accepts; counts requests.
    #[derive(Default)]
    struct CountingProducer {
        calls: Rc<Cell<usize>>,
    }

    impl ChunkProducer for CountingProducer {
        type Payload = ();

        fn request_data(&self, _request: &mut RequestData<'_, ()>) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    /// Accepts every request; the test resolves them by key.
    #[derive(Default)]
    struct ManualProducer {
        senders: Rc<RefCell<BTreeMap<ChunkKey, oneshot::Sender<u32>>>>,
    }

    impl ChunkProducer for ManualProducer {
        type Payload = u32;

        fn request_data(&self, request: &mut RequestData<'_, u32>) {
            let (tx, rx) = oneshot::channel();
            self.senders.borrow_mut().insert(request.chunk().key, tx);
            request.accept(rx);
        }
    }

    fn key(x: i32, y: i32, z: i32) -> ChunkKey {
        ChunkKey::new(IVec3::new(x, y, z), 1)
    }

    #[tokio::test]
    async fn first_update_adds_chunk_then_completes() {
        LocalSet::new()
            .run_until(async {
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), LocalOctreeQuery::new(CHUNK), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                assert!(tracker.is_updating());
                tracker.idle().await;

                let events = drain(&mut events);
                assert_eq!(events.len(), 2);
                match &events[0] {
                    TrackerEvent::ChunkAdded { chunk, payload } => {
                        assert_eq!(chunk.key, key(0, 0, 0));
                        assert_eq!(*payload, Some(ChunkPayload::Placeholder));
                    }
                    other => panic!("unexpected event {other:?}"),
                }
                assert_eq!(events[1], TrackerEvent::CycleComplete { coord: IVec3::ZERO });
                assert_eq!(tracker.rendered_chunks().len(), 1);
                assert_eq!(tracker.stats().cycles_completed, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn crossing_a_boundary_swaps_chunks() {
        LocalSet::new()
            .run_until(async {
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), LocalOctreeQuery::new(CHUNK), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                tracker.idle().await;
                drain(&mut events);

                tracker.update(at(1, 0));
                tracker.idle().await;
                let events = drain(&mut events);
                assert_eq!(
                    events,
                    vec![
                        TrackerEvent::ChunkRemoved {
                            chunk: LodChunk::new(IVec3::ZERO, 1, [1; 8])
                        },
                        TrackerEvent::ChunkAdded {
                            chunk: LodChunk::new(IVec3::new(1, 0, 0), 1, [1; 8]),
                            payload: Some(ChunkPayload::Placeholder),
                        },
                        TrackerEvent::CycleComplete {
                            coord: IVec3::new(1, 0, 0)
                        },
                    ]
                );
                let rendered = tracker.rendered_chunks();
                assert_eq!(rendered.len(), 1);
                assert_eq!(rendered[0].key, key(1, 0, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn same_cell_update_is_ignored() {
        LocalSet::new()
            .run_until(async {
                let query = Rc::new(ScriptedQuery::new());
                let (tracker, _events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                tracker.idle().await;

                tracker.update(Vec3::new(15.0, 300.0, 2.0));
                assert!(!tracker.is_updating());
                assert_eq!(query.positions.borrow().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn updates_during_a_cycle_coalesce_to_the_latest() {
        LocalSet::new()
            .run_until(async {
                let gate = Rc::new(Semaphore::new(0));
                let query = Rc::new(ScriptedQuery::gated(&gate));
                let (tracker, _events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();

                tracker.update(at(0, 0));
                flush().await;
                tracker.update(at(1, 0));
                tracker.update(at(2, 0));
                assert_eq!(query.positions.borrow().len(), 1);

                gate.add_permits(2);
                tracker.idle().await;

                assert_eq!(*query.positions.borrow(), vec![at(0, 0), at(2, 0)]);
                let stats = tracker.stats();
                assert_eq!(stats.cycles_completed, 2);
                assert_eq!(stats.updates_coalesced, 1);
                assert_eq!(tracker.last_update_coord(), Some(IVec3::new(2, 0, 0)));
            })
            .await;
    }

    #[tokio::test]
    async fn lod_equal_requests_are_reused() {
        LocalSet::new()
            .run_until(async {
                let producer = CountingProducer::default();
                let calls = Rc::clone(&producer.calls);
                let (tracker, _events) =
                    Tracker::new(config(1, 1), LocalOctreeQuery::new(CHUNK), producer).unwrap();

                tracker.update(at(0, 0));
                tracker.idle().await;
                assert_eq!(calls.get(), 27);

                tracker.update(at(1, 0));
                tracker.idle().await;
                assert_eq!(calls.get(), 36);

                let stats = tracker.stats();
                assert_eq!(stats.requests_reused, 18);
                assert_eq!(stats.requests_cancelled, 9);
                assert_eq!(stats.live_requests, 27);

                let rendered = tracker.rendered_chunks();
                assert_eq!(rendered.len(), 27);
                assert!(rendered.iter().all(|chunk| (0..=2).contains(&chunk.min().x)));
            })
            .await;
    }

    #[tokio::test]
    async fn failed_cycle_restores_state_and_recovers() {
        LocalSet::new()
            .run_until(async {
                let query = Rc::new(ScriptedQuery::new());
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                tracker.idle().await;
                drain(&mut events);

                query.fail_next.set(true);
                tracker.update(at(1, 0));
                tracker.idle().await;

                let failed = drain(&mut events);
                assert_eq!(failed.len(), 1);
                assert!(matches!(
                    &failed[0],
                    TrackerEvent::CycleFailed { coord, error: TrackerError::Query(_) }
                        if *coord == IVec3::new(1, 0, 0)
                ));
                assert!(!tracker.is_updating());
                assert_eq!(tracker.last_update_coord(), Some(IVec3::ZERO));
                assert_eq!(tracker.rendered_chunks()[0].key, key(0, 0, 0));
                assert_eq!(tracker.stats().cycles_failed, 1);

                // Same position retries instead of being treated as a no-op.
                tracker.update(at(1, 0));
                tracker.idle().await;
                assert_eq!(query.positions.borrow().len(), 3);
                assert_eq!(tracker.rendered_chunks()[0].key, key(1, 0, 0));
            })
            .await;
    }

    fn leaf(min: [i32; 3], size: i32) -> LeafCellSpec {
        LeafCellSpec {
            min,
            size,
            is_leaf: true,
            lod_array: [size; 8],
        }
    }

    #[tokio::test]
    async fn malformed_leaf_set_leaves_state_untouched() {
        LocalSet::new()
            .run_until(async {
                let query = Rc::new(ScriptedQuery::new());
                let producer = ManualProducer::default();
                let senders = Rc::clone(&producer.senders);
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), producer).unwrap();
                tracker.update(at(0, 0));
                tracker.idle().await;
                drain(&mut events);
                let request = tracker.data_request(key(0, 0, 0)).unwrap();
                let stats = tracker.stats();

                let bad_updates = [
                    (
                        vec![leaf([1, 0, 0], 1), leaf([1, 0, 0], 1)],
                        TrackerError::DuplicateLeaf(key(1, 0, 0)),
                    ),
                    (
                        vec![leaf([1, 0, 0], 2)],
                        TrackerError::MalformedLeaf {
                            key: ChunkKey::new(IVec3::new(1, 0, 0), 2),
                            reason: "min corner is not aligned to the cell size",
                        },
                    ),
                ];
                for (leaf_cells, expected) in bad_updates {
                    *query.reply_next.borrow_mut() = Some(LeafUpdate { leaf_cells });
                    tracker.update(at(1, 0));
                    tracker.idle().await;

                    assert_eq!(
                        drain(&mut events),
                        vec![TrackerEvent::CycleFailed {
                            coord: IVec3::new(1, 0, 0),
                            error: expected,
                        }]
                    );
                    assert!(!tracker.is_updating());
                    assert_eq!(tracker.last_update_coord(), Some(IVec3::ZERO));
                    assert!(tracker.rendered_chunks().is_empty());
                    assert_eq!(tracker.pending_dominators(), 1);
                    let kept = tracker.data_request(key(0, 0, 0)).unwrap();
                    assert_eq!(kept.chunk(), request.chunk());
                    assert!(!kept.is_cancelled());
                    assert!(!kept.is_settled());
                    assert_eq!(senders.borrow().len(), 1);
                    assert_eq!(tracker.stats().requests_created, stats.requests_created);
                    assert_eq!(tracker.stats().requests_cancelled, 0);
                }
                assert_eq!(tracker.stats().cycles_failed, 2);

                tracker.update(at(1, 0));
                tracker.idle().await;
                assert!(request.is_cancelled());
                resolve_all(&senders);
                flush().await;
                let rendered = tracker.rendered_chunks();
                assert_eq!(rendered.len(), 1);
                assert_eq!(rendered[0].key, key(1, 0, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn queued_position_runs_after_a_failure() {
        LocalSet::new()
            .run_until(async {
                let gate = Rc::new(Semaphore::new(0));
                let query = Rc::new(ScriptedQuery::gated(&gate));
                query.fail_next.set(true);
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();

                tracker.update(at(0, 0));
                flush().await;
                tracker.update(at(3, 0));
                gate.add_permits(2);
                tracker.idle().await;

                let events = drain(&mut events);
                assert!(matches!(events[0], TrackerEvent::CycleFailed { .. }));
                assert_eq!(
                    events.last(),
                    Some(&TrackerEvent::CycleComplete {
                        coord: IVec3::new(3, 0, 0)
                    })
                );
                assert_eq!(tracker.rendered_chunks()[0].key, key(3, 0, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn chunks_appear_only_once_loaded() {
        LocalSet::new()
            .run_until(async {
                let producer = ManualProducer::default();
                let senders = Rc::clone(&producer.senders);
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), LocalOctreeQuery::new(CHUNK), producer).unwrap();

                tracker.update(at(0, 0));
                tracker.idle().await;
                assert_eq!(
                    drain(&mut events),
                    vec![TrackerEvent::CycleComplete { coord: IVec3::ZERO }]
                );
                assert!(tracker.rendered_chunks().is_empty());
                assert_eq!(tracker.pending_dominators(), 1);

                let tx = senders.borrow_mut().remove(&key(0, 0, 0)).unwrap();
                tx.send(7).unwrap();
                let loaded = tracker.wait_for_load().await;
                assert_eq!(loaded.len(), 1);
                flush().await;

                assert_eq!(
                    drain(&mut events),
                    vec![TrackerEvent::ChunkAdded {
                        chunk: LodChunk::new(IVec3::ZERO, 1, [1; 8]),
                        payload: Some(ChunkPayload::Loaded(7)),
                    }]
                );
                assert_eq!(tracker.pending_dominators(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn disjoint_groups_swap_independently() {
        LocalSet::new()
            .run_until(async {
                let producer = ManualProducer::default();
                let senders = Rc::clone(&producer.senders);
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), LocalOctreeQuery::new(CHUNK), producer).unwrap();

                tracker.update(at(0, 0));
                tracker.idle().await;
                let tx = senders.borrow_mut().remove(&key(0, 0, 0)).unwrap();
                tx.send(1).unwrap();
                flush().await;
                drain(&mut events);

                tracker.update(at(1, 0));
                tracker.idle().await;
                // The old chunk's own group has no incoming chunk and swaps out
                // immediately; the new chunk waits for its payload.
                assert_eq!(
                    drain(&mut events),
                    vec![
                        TrackerEvent::ChunkRemoved {
                            chunk: LodChunk::new(IVec3::ZERO, 1, [1; 8])
                        },
                        TrackerEvent::CycleComplete {
                            coord: IVec3::new(1, 0, 0)
                        },
                    ]
                );

                // The old request was cancelled.
                assert!(tracker.data_request(key(0, 0, 0)).is_none());
                let tx = senders.borrow_mut().remove(&key(1, 0, 0)).unwrap();
                tx.send(2).unwrap();
                flush().await;
                assert_eq!(tracker.rendered_chunks()[0].key, key(1, 0, 0));
            })
            .await;
    }

    fn resolve_all(senders: &RefCell<BTreeMap<ChunkKey, oneshot::Sender<u32>>>) {
        for (_, tx) in std::mem::take(&mut *senders.borrow_mut()) {
            let _ = tx.send(0);
        }
    }

    #[tokio::test]
    async fn coarsening_waits_for_the_coarse_chunk() {
        LocalSet::new()
            .run_until(async {
                let producer = ManualProducer::default();
                let senders = Rc::clone(&producer.senders);
                let (tracker, mut events) =
                    Tracker::new(config(3, 0), LocalOctreeQuery::new(CHUNK), producer).unwrap();

                tracker.update(at(0, 0));
                tracker.idle().await;
                resolve_all(&senders);
                flush().await;
                assert_eq!(tracker.rendered_chunks().len(), 15);
                drain(&mut events);

                // Moving two cells along x turns the fine block at the origin
                // into a single size-2 leaf.
                tracker.update(at(2, 0));
                tracker.idle().await;
                let coarse = ChunkKey::new(IVec3::ZERO, 2);
                let is_rendered = |wanted: ChunkKey| {
                    tracker
                        .rendered_chunks()
                        .iter()
                        .any(|chunk| chunk.key == wanted)
                };
                assert!(is_rendered(key(0, 0, 0)));
                assert!(!is_rendered(coarse));

                let tx = senders.borrow_mut().remove(&coarse).unwrap();
                tx.send(5).unwrap();
                flush().await;

                assert!(!is_rendered(key(0, 0, 0)));
                assert!(is_rendered(coarse));
                let events = drain(&mut events);
                let removed_fine = events
                    .iter()
                    .filter(|event| {
                        matches!(event, TrackerEvent::ChunkRemoved { chunk }
                            if chunk.size() == 1 && chunk.min().x < 2)
                    })
                    .count();
                assert_eq!(removed_fine, 8);
                assert!(events.iter().any(|event| matches!(
                    event,
                    TrackerEvent::ChunkAdded { chunk, payload: Some(ChunkPayload::Loaded(5)) }
                        if chunk.key == coarse
                )));
            })
            .await;
    }

    #[tokio::test]
    async fn destroy_removes_everything() {
        LocalSet::new()
            .run_until(async {
                let (tracker, mut events) =
                    Tracker::new(config(1, 1), LocalOctreeQuery::new(CHUNK), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                tracker.idle().await;
                drain(&mut events);
                let request = tracker.data_request(key(0, 0, 0)).unwrap();

                tracker.destroy();
                let removed = drain(&mut events);
                assert_eq!(removed.len(), 27);
                assert!(removed
                    .iter()
                    .all(|event| matches!(event, TrackerEvent::ChunkRemoved { .. })));
                assert!(tracker.rendered_chunks().is_empty());
                assert!(tracker.data_request(key(0, 0, 0)).is_none());
                assert!(request.is_cancelled());
                assert_eq!(tracker.last_update_coord(), None);

                // The tracker can be driven again.
                tracker.update(at(0, 0));
                tracker.idle().await;
                assert_eq!(tracker.rendered_chunks().len(), 27);
            })
            .await;
    }

    #[tokio::test]
    async fn destroy_discards_cycle_in_flight() {
        LocalSet::new()
            .run_until(async {
                let gate = Rc::new(Semaphore::new(0));
                let query = Rc::new(ScriptedQuery::gated(&gate));
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();

                tracker.update(at(0, 0));
                flush().await;
                tracker.destroy();
                gate.add_permits(1);
                tracker.idle().await;

                assert!(drain(&mut events).is_empty());
                assert!(tracker.rendered_chunks().is_empty());
                assert_eq!(tracker.stats().cycles_failed, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn destroy_during_a_failing_cycle_resets_position() {
        LocalSet::new()
            .run_until(async {
                let gate = Rc::new(Semaphore::new(0));
                let query = Rc::new(ScriptedQuery::gated(&gate));
                let (tracker, mut events) =
                    Tracker::new(config(1, 0), Rc::clone(&query), CountingProducer::default())
                        .unwrap();
                tracker.update(at(0, 0));
                gate.add_permits(1);
                tracker.idle().await;

                query.fail_next.set(true);
                tracker.update(at(1, 0));
                flush().await;
                tracker.destroy();
                drain(&mut events);
                gate.add_permits(1);
                tracker.idle().await;

                assert!(drain(&mut events).is_empty());
                assert_eq!(tracker.last_update_coord(), None);
                assert_eq!(tracker.stats().cycles_failed, 0);

                // The old position is not a no-op after destroy.
                tracker.update(at(0, 0));
                assert!(tracker.is_updating());
                gate.add_permits(1);
                tracker.idle().await;
                assert_eq!(tracker.rendered_chunks().len(), 1);
                assert_eq!(tracker.last_update_coord(), Some(IVec3::ZERO));
            })
            .await;
    }

    #[test]
    fn parse_leaves_filters_and_validates() {
        let cell = |min: [i32; 3], size: i32, is_leaf: bool| LeafCellSpec {
            min,
            size,
            is_leaf,
            lod_array: [size; 8],
        };

        let update = LeafUpdate {
            leaf_cells: vec![cell([0, 0, 0], 2, false), cell([0, 0, 0], 1, true)],
        };
        let leaves = parse_leaves(&update).unwrap();
        assert_eq!(leaves.keys().copied().collect::<Vec<_>>(), vec![key(0, 0, 0)]);

        let duplicate = LeafUpdate {
            leaf_cells: vec![cell([1, 0, 0], 1, true), cell([1, 0, 0], 1, true)],
        };
        assert_eq!(
            parse_leaves(&duplicate),
            Err(TrackerError::DuplicateLeaf(key(1, 0, 0)))
        );

        let unaligned = LeafUpdate {
            leaf_cells: vec![cell([1, 0, 0], 2, true)],
        };
        assert!(matches!(
            parse_leaves(&unaligned),
            Err(TrackerError::MalformedLeaf { .. })
        ));

        let odd_size = LeafUpdate {
            leaf_cells: vec![cell([0, 0, 0], 3, true)],
        };
        assert!(matches!(
            parse_leaves(&odd_size),
            Err(TrackerError::MalformedLeaf { .. })
        ));
    }
}
