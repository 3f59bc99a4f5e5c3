//! [`Gateway`] implementation over the in-memory [`Registry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use videoroom_loopback::{AnnouncementMode, LoopbackGateway, TrackDelivery};
//!
//! let gateway = LoopbackGateway::builder()
//!     .suppress_join_publishers()
//!     .announcements(AnnouncementMode::Buffered)
//!     .track_delivery(TrackDelivery::All)
//!     .build();
//!
//! // Hand `Arc::new(gateway.clone())` to every session under test, then
//! // assert on `gateway.live_handles()` and `gateway.request_count(..)`.
//! ```

use crate::config::{AnnouncementMode, LoopbackConfig, TrackDelivery};
use crate::room::{Registry, RequestRecord};

use async_trait::async_trait;
use common::error::{GatewayError, GatewayResult};
use common::gateway::{Attachment, Gateway, GatewaySession, PluginHandle};
use common::media::{LocalStream, MediaConstraints, MediaTrack};
use common::types::{HandleId, PeerId, RoomId};
use common::videoroom::{Jsep, Request, VIDEOROOM_PLUGIN};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

struct Shared {
    config: LoopbackConfig,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process videoroom gateway. Clones share the same rooms.
#[derive(Clone)]
pub struct LoopbackGateway {
    shared: Arc<Shared>,
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackGateway {
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    #[must_use]
    pub fn builder() -> LoopbackGatewayBuilder {
        LoopbackGatewayBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &LoopbackConfig {
        &self.shared.config
    }

    /// Handles attached and not yet released.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.shared.registry().live_handles()
    }

    /// Connections opened and not yet destroyed.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.shared.registry().live_connections()
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.shared.registry().requests()
    }

    /// Number of requests named `request` (see `Request::name`).
    #[must_use]
    pub fn request_count(&self, request: &str) -> usize {
        self.requests()
            .iter()
            .filter(|record| record.request == request)
            .count()
    }

    /// Feeds currently joined to `room`.
    #[must_use]
    pub fn feeds(&self, room: RoomId) -> Vec<PeerId> {
        self.shared.registry().feeds(room)
    }

    /// Drop the media of every subscriber to `feed`, as when their peer
    /// connections fail. Returns how many subscribers were affected.
    pub fn hang_up_subscribers(&self, feed: PeerId) -> usize {
        self.shared.registry().hang_up_subscribers(feed)
    }
}

/// Builder for [`LoopbackGateway`].
#[derive(Debug, Default)]
pub struct LoopbackGatewayBuilder {
    config: LoopbackConfig,
}

impl LoopbackGatewayBuilder {
    #[must_use]
    pub fn suppress_join_publishers(mut self) -> Self {
        self.config.suppress_join_publishers = true;
        self
    }

    #[must_use]
    pub fn announcements(mut self, mode: AnnouncementMode) -> Self {
        self.config.announcements = mode;
        self
    }

    #[must_use]
    pub fn track_delivery(mut self, delivery: TrackDelivery) -> Self {
        self.config.track_delivery = delivery;
        self
    }

    #[must_use]
    pub fn fail_connect(mut self) -> Self {
        self.config.fail_connect = true;
        self
    }

    #[must_use]
    pub fn fail_attach(mut self) -> Self {
        self.config.fail_attach = true;
        self
    }

    #[must_use]
    pub fn reject_join(mut self, code: u32, reason: impl Into<String>) -> Self {
        self.config.reject_join = Some((code, reason.into()));
        self
    }

    #[must_use]
    pub fn fail_answer(mut self) -> Self {
        self.config.fail_answer = true;
        self
    }

    #[must_use]
    pub fn build(self) -> LoopbackGateway {
        LoopbackGateway::new(self.config)
    }
}

#[async_trait]
impl Gateway for LoopbackGateway {
    async fn connect(&self) -> GatewayResult<Arc<dyn GatewaySession>> {
        if self.shared.config.fail_connect {
            return Err(GatewayError::Unreachable("connection refused".to_string()));
        }
        let id = self.shared.registry().open_connection();
        Ok(Arc::new(LoopbackConnection {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct LoopbackConnection {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl GatewaySession for LoopbackConnection {
    async fn attach(&self, plugin: &str, opaque_id: &str) -> GatewayResult<Attachment> {
        if self.shared.config.fail_attach {
            return Err(GatewayError::Attach("plugin unavailable".to_string()));
        }
        if plugin != VIDEOROOM_PLUGIN {
            return Err(GatewayError::Attach(format!("unknown plugin {plugin}")));
        }
        let (id, events) = self.shared.registry().attach(self.id, opaque_id)?;
        Ok(Attachment {
            handle: Arc::new(LoopbackHandle {
                id,
                shared: Arc::clone(&self.shared),
            }),
            events,
        })
    }

    async fn destroy(&self) -> GatewayResult<()> {
        self.shared.registry().close_connection(self.id)
    }
}

struct LoopbackHandle {
    id: HandleId,
    shared: Arc<Shared>,
}

#[async_trait]
impl PluginHandle for LoopbackHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    async fn send(&self, request: Request, jsep: Option<Jsep>) -> GatewayResult<()> {
        self.shared
            .registry()
            .send(&self.shared.config, self.id, request, jsep)
    }

    async fn create_offer(
        &self,
        stream: &LocalStream,
        _media: MediaConstraints,
    ) -> GatewayResult<Jsep> {
        self.shared.registry().create_offer(self.id, stream)
    }

    async fn create_answer(&self, offer: &Jsep, _media: MediaConstraints) -> GatewayResult<Jsep> {
        let result = self
            .shared
            .registry()
            .create_answer(&self.shared.config, self.id, offer);
        if let Err(e) = &result {
            warn!(target: "loopback.room", handle = %self.id, error = %e, "Answer failed");
        }
        result
    }

    async fn handle_remote_jsep(&self, _jsep: &Jsep) -> GatewayResult<()> {
        if self.shared.registry().is_attached(self.id) {
            Ok(())
        } else {
            Err(GatewayError::Closed)
        }
    }

    fn receivers(&self) -> Vec<MediaTrack> {
        self.shared.registry().receivers(self.id)
    }

    async fn detach(&self) -> GatewayResult<()> {
        self.shared.registry().detach(self.id)
    }
}
