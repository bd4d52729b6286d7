//! Per-engine channel routing table
//!
//! Each engine owns its own registry; nothing here is process-global. A
//! channel routes either to a direct handler or to one slot of a join-all
//! bag. Registering a channel again replaces its previous route, and any bag
//! that loses a channel this way is dropped along with its buffered frames.

use crate::bag::{Bag, BagHandler, BagId, DEFAULT_SLOT_DEPTH};
use codec::{Channel, FrameView};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Callback for a single frame
///
/// The view aliases the consumer's scratch buffer and is only valid for the
/// duration of the call; use [`FrameView::to_frame`] to keep the data.
pub type Handler = Arc<dyn Fn(&FrameView<'_>) + Send + Sync>;

#[derive(Clone)]
pub enum Route {
    Direct(Handler),
    Bag { bag: BagId, slot: usize },
}

pub struct Registry {
    routes: HashMap<Channel, Route>,
    bags: HashMap<BagId, Bag>,
    next_bag: BagId,
    bag_depth: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            bags: HashMap::new(),
            next_bag: 0,
            bag_depth: DEFAULT_SLOT_DEPTH,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot depth for bags registered from now on
    pub fn set_bag_depth(&mut self, depth: usize) {
        self.bag_depth = depth;
    }

    pub fn subscribe(&mut self, channel: Channel, handler: Handler) {
        self.drop_bags_touching(&[channel]);
        self.routes.insert(channel, Route::Direct(handler));
    }

    /// Route every channel in `channels` to one shared bag
    pub fn subscribe_all(&mut self, channels: &[Channel], handler: BagHandler) -> BagId {
        self.drop_bags_touching(channels);

        let id = self.next_bag;
        self.next_bag = self.next_bag.wrapping_add(1);
        for (slot, channel) in channels.iter().enumerate() {
            self.routes.insert(*channel, Route::Bag { bag: id, slot });
        }
        self.bags
            .insert(id, Bag::new(channels.to_vec(), self.bag_depth, handler));
        id
    }

    /// Remove every route for `channels`; returns how many existed
    pub fn unsubscribe(&mut self, channels: &[Channel]) -> usize {
        let existing = channels
            .iter()
            .filter(|channel| self.routes.contains_key(*channel))
            .count();
        self.drop_bags_touching(channels);
        for channel in channels {
            self.routes.remove(channel);
        }
        existing
    }

    pub fn route(&self, channel: Channel) -> Option<&Route> {
        self.routes.get(&channel)
    }

    pub fn bag_mut(&mut self, id: BagId) -> Option<&mut Bag> {
        self.bags.get_mut(&id)
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.routes.contains_key(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.routes.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    pub fn bag_count(&self) -> usize {
        self.bags.len()
    }

    /// Discard partial join-all generations; returns the frames dropped
    pub fn clear_partial_generations(&mut self) -> usize {
        self.bags.values_mut().map(Bag::clear).sum()
    }

    fn drop_bags_touching(&mut self, channels: &[Channel]) {
        let doomed: Vec<BagId> = self
            .bags
            .iter()
            .filter(|(_, bag)| channels.iter().any(|c| bag.touches(*c)))
            .map(|(id, _)| *id)
            .collect();

        for id in doomed {
            if let Some(mut bag) = self.bags.remove(&id) {
                let discarded = bag.clear();
                for channel in bag.channels() {
                    let owned = matches!(
                        self.routes.get(channel),
                        Some(Route::Bag { bag: owner, .. }) if *owner == id
                    );
                    if owned {
                        self.routes.remove(channel);
                    }
                }
                debug!(bag = id, discarded, "join-all bag dropped");
            }
        }
    }
}
