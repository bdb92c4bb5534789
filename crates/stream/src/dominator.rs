use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use glam::IVec3;
use lodtrack_common::{ChunkKey, LodChunk, align_down};
use tokio::task::JoinHandle;

use crate::error::TrackerError;
use crate::request::{DataRequest, RenderData};

/// Outgoing and incoming chunks that share a dominating cell.
///
/// Grouping is the unit of atomic swap: nothing in a group becomes visible
/// or disappears until every incoming chunk has its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGroup {
    pub base: ChunkKey,
    pub outgoing: Vec<LodChunk>,
    pub incoming: Vec<LodChunk>,
}

impl TransitionGroup {
    fn new(base: ChunkKey) -> Self {
        Self {
            base,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }
}

/// Delivered to a dominator's callback when it fires.
/// `payloads[i]` belongs to `incoming[i]`.
#[derive(Debug, Clone)]
pub struct Transition<P> {
    pub base: ChunkKey,
    pub outgoing: Vec<LodChunk>,
    pub incoming: Vec<LodChunk>,
    pub payloads: Vec<RenderData<P>>,
}

/// Leaf lookup by containment for a set of size-aligned cells.
struct LeafIndex<'a> {
    by_key: HashMap<ChunkKey, &'a LodChunk>,
    sizes: BTreeSet<i32>,
}

impl<'a> LeafIndex<'a> {
    fn new(chunks: &'a [LodChunk]) -> Self {
        Self {
            by_key: chunks.iter().map(|chunk| (chunk.key, chunk)).collect(),
            sizes: chunks.iter().map(LodChunk::size).collect(),
        }
    }

    fn containing(&self, point: IVec3) -> Option<&'a LodChunk> {
        self.sizes.iter().find_map(|&size| {
            self.by_key
                .get(&ChunkKey::new(align_down(point, size), size))
                .copied()
        })
    }
}

/// Group every chunk of `old` (outgoing) and `new` (incoming) by its
/// dominating cell: the larger of the old and new leaves containing the
/// chunk's min corner.
///
/// Both sets must consist of size-aligned cells. Pure: nothing is mutated,
/// so a caller can reject the whole plan before touching its own state.
pub fn group_transitions(
    old: &[LodChunk],
    new: &[LodChunk],
) -> Result<BTreeMap<ChunkKey, TransitionGroup>, TrackerError> {
    let old_index = LeafIndex::new(old);
    let new_index = LeafIndex::new(new);
    let mut groups: BTreeMap<ChunkKey, TransitionGroup> = BTreeMap::new();

    let tagged = old
        .iter()
        .map(|chunk| (chunk, true))
        .chain(new.iter().map(|chunk| (chunk, false)));

    for (chunk, outgoing) in tagged {
        let point = chunk.min();
        let base = match (old_index.containing(point), new_index.containing(point)) {
            (Some(a), Some(b)) if b.size() > a.size() => b.key,
            (Some(a), _) => a.key,
            (None, Some(b)) => b.key,
            (None, None) => return Err(TrackerError::NoLeafMatch(chunk.key)),
        };

        let group = groups
            .entry(base)
            .or_insert_with(|| TransitionGroup::new(base));
        if outgoing {
            group.outgoing.push(chunk.clone());
        } else {
            group.incoming.push(chunk.clone());
        }
    }
    Ok(groups)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominatorState {
    Created,
    Waiting,
    Fired,
    Cancelled,
}

type OnLoad<P> = Box<dyn FnOnce(Transition<P>)>;

/// Barrier over one [`TransitionGroup`]: fires its callback once, after
/// every incoming chunk's request has settled.
///
/// Cancelling (or dropping) a dominator detaches it; the requests it was
/// waiting on are untouched.
pub struct Dominator<P: Clone + 'static> {
    base: ChunkKey,
    outgoing: Vec<LodChunk>,
    incoming: Vec<(LodChunk, DataRequest<P>)>,
    on_load: Option<OnLoad<P>>,
    state: Rc<Cell<DominatorState>>,
    waiter: Option<JoinHandle<()>>,
}

impl<P: Clone + 'static> Dominator<P> {
    pub fn new(
        base: ChunkKey,
        outgoing: Vec<LodChunk>,
        incoming: Vec<(LodChunk, DataRequest<P>)>,
        on_load: impl FnOnce(Transition<P>) + 'static,
    ) -> Self {
        Self {
            base,
            outgoing,
            incoming,
            on_load: Some(Box::new(on_load)),
            state: Rc::new(Cell::new(DominatorState::Created)),
            waiter: None,
        }
    }

    pub fn base(&self) -> ChunkKey {
        self.base
    }

    pub fn outgoing(&self) -> &[LodChunk] {
        &self.outgoing
    }

    pub fn incoming(&self) -> impl Iterator<Item = &LodChunk> {
        self.incoming.iter().map(|(chunk, _)| chunk)
    }

    pub fn state(&self) -> DominatorState {
        self.state.get()
    }

    pub fn is_fired(&self) -> bool {
        self.state.get() == DominatorState::Fired
    }

    /// Fire now if nothing is pending, otherwise wait on a local task.
    ///
    /// Requests already settled contribute their payload immediately. Only
    /// the first call has any effect.
    pub fn start(&mut self) {
        if self.state.get() != DominatorState::Created {
            return;
        }
        let Some(on_load) = self.on_load.take() else {
            return;
        };

        let mut transition = Transition {
            base: self.base,
            outgoing: self.outgoing.clone(),
            incoming: self.incoming.iter().map(|(chunk, _)| chunk.clone()).collect(),
            payloads: self
                .incoming
                .iter()
                .map(|(_, request)| request.settled().flatten())
                .collect(),
        };
        let pending: Vec<(usize, DataRequest<P>)> = self
            .incoming
            .iter()
            .enumerate()
            .filter(|(_, (_, request))| !request.is_settled())
            .map(|(index, (_, request))| (index, request.clone()))
            .collect();

        if pending.is_empty() {
            self.state.set(DominatorState::Fired);
            on_load(transition);
            return;
        }

        tracing::trace!(base = %self.base, pending = pending.len(), "dominator waiting");
        self.state.set(DominatorState::Waiting);
        let state = Rc::clone(&self.state);
        self.waiter = Some(tokio::task::spawn_local(async move {
            for (index, request) in pending {
                transition.payloads[index] = request.wait_for_load().await;
            }
            if state.get() == DominatorState::Waiting {
                state.set(DominatorState::Fired);
                on_load(transition);
            }
        }));
    }

    /// Detach. The callback will never run after this returns.
    pub fn cancel(&mut self) {
        if self.state.get() == DominatorState::Fired {
            return;
        }
        self.state.set(DominatorState::Cancelled);
        self.on_load = None;
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
    }
}

impl<P: Clone + 'static> Drop for Dominator<P> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<P: Clone + 'static> fmt::Debug for Dominator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dominator")
            .field("base", &self.base)
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.incoming.len())
            .field("state", &self.state.get())
            .finish()
    }
}
