//! Round-robin distribution.
//!
//! Each group has a rotating start cursor. A new client starts at the
//! group's cursor (which then advances by one), tries every target of the
//! group once in order, wrapping around, and then moves on to the next
//! group. A client that exhausts every group goes back to the dispatcher.

use super::connector::{ConnectHandler, Connector};
use super::{AlgorithmContext, DistributionAlgorithm};
use crate::backend::Target;
use crate::proxy::{Client, Connection};
use crate::util::{HandleId, ShutdownSignal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct RoundRobin {
    ctx: AlgorithmContext,
    connector: Arc<Connector>,
    /// Next start index, per group.
    cursors: Mutex<Vec<usize>>,
    clients: Mutex<HashMap<HandleId, ClientState>>,
}

/// Where a client is in its walk over the groups.
///
/// Tries `next` and advances, wrapping within the group, until it has
/// tried `last`; then moves to the next group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClientState {
    group: usize,
    next: usize,
    last: usize,
}

impl RoundRobin {
    pub fn new(ctx: AlgorithmContext) -> Self {
        let connector = Arc::new(Connector::new("round_robin", ctx.connect_timeout, ctx.metrics.clone()));
        Self {
            ctx,
            connector,
            cursors: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Take the start index for `group` and advance its cursor.
    ///
    /// Returns the index and the group's size, or `None` if the group does
    /// not exist.
    fn take_start_index(&self, group: usize) -> Option<(usize, usize)> {
        let len = self.ctx.registry.group(group)?.len();
        let mut cursors = self.cursors.lock();
        if cursors.len() <= group {
            cursors.resize(group + 1, 0);
        }

        // The group may have shrunk since the cursor was stored.
        let index = if cursors[group] < len { cursors[group] } else { 0 };
        cursors[group] = if index + 1 < len { index + 1 } else { 0 };
        Some((index, len))
    }

    fn enter_group(&self, state: &mut ClientState, group: usize) {
        state.group = group;
        match self.take_start_index(group) {
            Some((index, len)) => {
                state.next = index;
                state.last = if index > 0 { index - 1 } else { len.saturating_sub(1) };
            }
            None => {
                state.next = 0;
                state.last = 0;
            }
        }
    }

    fn new_client_state(&self) -> ClientState {
        let mut state = ClientState {
            group: 0,
            next: 0,
            last: 0,
        };
        self.enter_group(&mut state, 0);
        state
    }

    /// Advance `state` by one target, or return `None` once every group
    /// has been walked.
    ///
    /// The position is re-validated against the group's current size on
    /// every step, since groups can change while a client is being placed.
    fn next_target(&self, state: &mut ClientState) -> Option<Arc<Target>> {
        loop {
            let targets = self.ctx.registry.group(state.group)?.targets();
            if targets.is_empty() {
                self.enter_group(state, state.group + 1);
                continue;
            }

            let len = targets.len();
            if state.next >= len {
                state.next = 0;
            }
            if state.last >= len {
                state.last = len - 1;
            }

            let target = Arc::clone(&targets[state.next]);
            if state.next == state.last {
                self.enter_group(state, state.group + 1);
            } else {
                state.next = if state.next + 1 >= len { 0 } else { state.next + 1 };
            }
            return Some(target);
        }
    }

    /// Every target a new client would be offered, in order, disabled ones
    /// included. Advances the group cursors like a real client would.
    pub fn traversal(&self) -> Vec<Arc<Target>> {
        let mut state = self.new_client_state();
        std::iter::from_fn(|| self.next_target(&mut state)).collect()
    }

    /// Walk to the next enabled target and start connecting, or give the
    /// client back to the dispatcher.
    fn try_next_target(&self, client: Client, mut state: ClientState) {
        loop {
            match self.next_target(&mut state) {
                Some(target) if target.is_enabled() => {
                    self.clients.lock().insert(client.id(), state);
                    self.connector.initiate_connection(client, target);
                    return;
                }
                Some(target) => {
                    trace!(client = %client.peer(), target = %target.address(), "skipping disabled target");
                }
                None => {
                    debug!(client = %client.peer(), "tried every target without success");
                    self.ctx.dispatcher.offer_unconnected(client);
                    return;
                }
            }
        }
    }
}

impl DistributionAlgorithm for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn try_to_connect(&self, client: Client) {
        let state = self.new_client_state();
        self.try_next_target(client, state);
    }

    fn table_sizes(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("client_states", self.clients.lock().len()),
            ("group_cursors", self.cursors.lock().len()),
            ("pending_connections", self.connector.pending_count()),
            ("failed_connections", self.connector.failed_count()),
        ]
    }

    fn start(self: Arc<Self>, shutdown: &ShutdownSignal) {
        let connector = Arc::clone(&self.connector);
        connector.start(self, shutdown);
    }
}

impl ConnectHandler for RoundRobin {
    fn on_connected(&self, connection: Connection) {
        self.clients.lock().remove(&connection.client().id());
        self.ctx.dispatcher.offer_finished(connection);
    }

    fn on_failed(&self, client: Client, _target: Arc<Target>) {
        let state = self.clients.lock().remove(&client.id());
        match state {
            Some(state) => self.try_next_target(client, state),
            None => self.ctx.dispatcher.offer_unconnected(client),
        }
    }

    fn on_abandoned(&self, client: HandleId) {
        self.clients.lock().remove(&client);
        self.ctx.dispatcher.offer_abandoned(client);
    }
}
