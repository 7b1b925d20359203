//! The interface tracking sees of the background refiner.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::warn;

use super::messages::NewKeyFrameMsg;
use super::shared_state::SharedState;

pub trait MappingBackend: Send {
    /// Hand a keyframe over. Never blocks.
    fn enqueue(&self, msg: NewKeyFrameMsg);

    /// Keyframes waiting to be processed.
    fn queue_length(&self) -> usize;

    /// The refiner is waiting for work.
    fn is_idle(&self) -> bool;

    /// True if the refiner structurally changed the map since the last call.
    fn map_updated_since_last_check(&self) -> bool;
}

/// Backend feeding the local mapping thread through an unbounded channel.
pub struct ChannelBackend {
    sender: Sender<NewKeyFrameMsg>,
    shared: Arc<SharedState>,
}

impl ChannelBackend {
    pub fn new(sender: Sender<NewKeyFrameMsg>, shared: Arc<SharedState>) -> Self {
        Self { sender, shared }
    }
}

impl MappingBackend for ChannelBackend {
    fn enqueue(&self, msg: NewKeyFrameMsg) {
        if self.sender.send(msg).is_err() {
            warn!("Local mapping is gone, dropping keyframe {}", msg.keyframe_id);
        }
    }

    fn queue_length(&self) -> usize {
        self.sender.len()
    }

    fn is_idle(&self) -> bool {
        self.sender.is_empty() && self.shared.is_refiner_idle()
    }

    fn map_updated_since_last_check(&self) -> bool {
        self.shared.take_map_updated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_channel_backend_reports_queue_and_flag() {
        let shared = SharedState::new(1.2, 8);
        let (tx, rx) = unbounded();
        let backend = ChannelBackend::new(tx, Arc::clone(&shared));
        assert!(backend.is_idle());

        backend.enqueue(NewKeyFrameMsg {
            keyframe_id: KeyFrameId::new(0),
            map_index: 0,
            timestamp: 0.0,
        });
        assert_eq!(backend.queue_length(), 1);
        assert!(!backend.is_idle());
        assert_eq!(rx.recv().unwrap().keyframe_id, KeyFrameId::new(0));

        shared.set_map_updated();
        assert!(backend.map_updated_since_last_check());
        assert!(!backend.map_updated_since_last_check());
    }
}
