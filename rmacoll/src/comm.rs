use crate::component::RmaCollComponent;
use crate::config::RmaCollConfig;
use crate::error::{Result, RmaCollError};
use crate::transport::Transport;
use crate::types::{Rank, Tag};
use std::sync::{Arc, Mutex};

struct CommState {
    next_tag: Tag,
    registered: bool,
}

/// Per-communicator state shared by every request built on it.
///
/// Holds the rank's transport, the component that progresses its requests,
/// and the exchange-tag counter. Tags count down from `tag_base` and wrap
/// back to it after `tag_end`.
pub struct CommContext {
    transport: Arc<dyn Transport>,
    component: Arc<RmaCollComponent>,
    config: RmaCollConfig,
    state: Mutex<CommState>,
}

impl CommContext {
    /// Create a communicator context using the component's configuration.
    pub fn new(transport: Arc<dyn Transport>, component: Arc<RmaCollComponent>) -> Arc<Self> {
        let config = component.config().clone();
        Self::with_config(transport, component, config)
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        component: Arc<RmaCollComponent>,
        config: RmaCollConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CommState {
                next_tag: config.tag_base,
                registered: false,
            }),
            transport,
            component,
            config,
        })
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.transport.world_size()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn component(&self) -> &Arc<RmaCollComponent> {
        &self.component
    }

    pub fn config(&self) -> &RmaCollConfig {
        &self.config
    }

    /// Reserve the exchange tag for a new request.
    ///
    /// The first reservation on a communicator registers it with the
    /// component.
    pub(crate) fn reserve_tag(&self) -> Result<Tag> {
        let (tag, first) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RmaCollError::LockPoisoned("comm state"))?;
            let tag = state.next_tag;
            state.next_tag = if tag <= self.config.tag_end {
                self.config.tag_base
            } else {
                tag - 1
            };
            let first = !state.registered;
            state.registered = true;
            (tag, first)
        };
        if first {
            self.component.register_comm(self.rank());
        }
        Ok(tag)
    }

    /// Tag the next request will receive.
    pub fn peek_tag(&self) -> Result<Tag> {
        Ok(self
            .state
            .lock()
            .map_err(|_| RmaCollError::LockPoisoned("comm state"))?
            .next_tag)
    }
}

impl std::fmt::Debug for CommContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackFabric;

    #[test]
    fn test_tags_count_down_and_wrap() {
        let fabric = LoopbackFabric::new(1);
        let component = RmaCollComponent::new(RmaCollConfig::default());
        let config = RmaCollConfig {
            tag_base: -26,
            tag_end: -28,
            ..RmaCollConfig::default()
        };
        let comm = CommContext::with_config(fabric.transport(0).unwrap(), component, config);
        let tags: Vec<Tag> = (0..5).map(|_| comm.reserve_tag().unwrap()).collect();
        assert_eq!(tags, vec![-26, -27, -28, -26, -27]);
    }

    #[test]
    fn test_first_reservation_registers() {
        let fabric = LoopbackFabric::new(2);
        let component = RmaCollComponent::new(RmaCollConfig::default());
        let c0 = CommContext::new(fabric.transport(0).unwrap(), Arc::clone(&component));
        let c1 = CommContext::new(fabric.transport(1).unwrap(), Arc::clone(&component));
        assert_eq!(component.registered_comms(), 0);
        assert!(!component.is_progress_registered());
        c0.reserve_tag().unwrap();
        c0.reserve_tag().unwrap();
        assert_eq!(component.registered_comms(), 1);
        assert!(component.is_progress_registered());
        c1.reserve_tag().unwrap();
        assert_eq!(component.registered_comms(), 2);
    }
}
