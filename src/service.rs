//! Assembled calling service
//!
//! [`CallService`] wires the signaling channel, session manager and
//! collaborator seams into one running unit for a single local user:
//! open the channel, spawn the manager, pump inbound signals into it.
//! [`CallService::shutdown`] (or drop of the last handle holder calling
//! it) ends live calls and closes the channel on every exit path.

use crate::identity::{MemoryDirectory, UserDirectory, UserId};
use crate::manager::{
    CallError, CallManagerConfig, CallManagerHandle, CallSessionManager, ManagerDeps,
};
use crate::negotiation::{MediaDevices, PeerTransportFactory, StaticMediaDevices};
use crate::presence::{MemoryPresence, PresenceTracker};
use crate::signaling::{SignalingChannel, SignalingError, SignalingTransport};
use crate::store::{MemorySessionStore, SessionStore};
use crate::types::{CallEvent, CallId, CallType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[cfg(not(feature = "webrtc"))]
use crate::negotiation::LoopbackPeerTransport;

fn default_transport_factory() -> PeerTransportFactory {
    #[cfg(feature = "webrtc")]
    {
        crate::webrtc_transport::WebRtcPeerTransport::factory(Vec::new())
    }
    #[cfg(not(feature = "webrtc"))]
    {
        LoopbackPeerTransport::factory()
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder<T: SignalingTransport> {
    local_user: UserId,
    transport: Arc<T>,
    transport_factory: PeerTransportFactory,
    devices: Arc<dyn MediaDevices>,
    store: Arc<dyn SessionStore>,
    presence: Arc<dyn PresenceTracker>,
    directory: Arc<dyn UserDirectory>,
    config: CallManagerConfig,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Start building a service for `local_user` over the given
    /// signaling transport
    #[must_use]
    pub fn new(local_user: UserId, transport: Arc<T>) -> Self {
        Self {
            local_user,
            transport,
            transport_factory: default_transport_factory(),
            devices: Arc::new(StaticMediaDevices::granted()),
            store: Arc::new(MemorySessionStore::new()),
            presence: Arc::new(MemoryPresence::new()),
            directory: Arc::new(MemoryDirectory::new()),
            config: CallManagerConfig::default(),
        }
    }

    /// Use a custom peer-transport factory
    #[must_use]
    pub fn transport_factory(mut self, factory: PeerTransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Use a custom capture device layer
    #[must_use]
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }

    /// Use a custom session store
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Use a custom presence tracker
    #[must_use]
    pub fn presence(mut self, presence: Arc<dyn PresenceTracker>) -> Self {
        self.presence = presence;
        self
    }

    /// Use a custom user directory
    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Override the manager configuration
    #[must_use]
    pub fn config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the signaling channel, spawn the manager and start the
    /// inbound signal pump
    ///
    /// # Errors
    ///
    /// Returns error if the signaling channel cannot be opened
    pub async fn start(self) -> Result<CallService<T>, SignalingError> {
        let channel = Arc::new(SignalingChannel::open(self.transport, self.local_user.clone()).await?);
        let manager = CallSessionManager::spawn(
            ManagerDeps {
                local_user: self.local_user.clone(),
                channel: Arc::clone(&channel),
                transport_factory: self.transport_factory,
                devices: self.devices,
                store: self.store,
                presence: self.presence,
                directory: self.directory,
            },
            self.config,
        );

        let pump_channel = Arc::clone(&channel);
        let pump_manager = manager.clone();
        let pump = tokio::spawn(async move {
            while let Some(envelope) = pump_channel.recv().await {
                if pump_manager.deliver_signal(envelope).await.is_err() {
                    break;
                }
            }
            tracing::debug!("signal pump stopped");
        });

        tracing::info!(user = %self.local_user, "call service started");
        Ok(CallService {
            local_user: self.local_user,
            channel,
            manager,
            pump: parking_lot::Mutex::new(Some(pump)),
        })
    }
}

/// A running calling endpoint for one local user
pub struct CallService<T: SignalingTransport> {
    local_user: UserId,
    channel: Arc<SignalingChannel<T>>,
    manager: CallManagerHandle,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T: SignalingTransport> CallService<T> {
    /// The local user this service belongs to
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.subscribe_events()
    }

    /// Place a call; resolves once the offer has been delivered
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallInProgress`] if a call is already live,
    /// [`CallError::Media`] when local capture fails, and
    /// [`CallError::Signaling`] when the offer cannot be delivered
    pub async fn start_call(
        &self,
        callee: UserId,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        self.manager.start_call(callee, call_type).await
    }

    /// Accept a ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown or not ringing inbound
    pub async fn accept_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.manager.accept_call(call_id).await
    }

    /// Decline a ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown or not ringing inbound
    pub async fn decline_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.manager.decline_call(call_id).await
    }

    /// Hang up or cancel a call; idempotent for finished calls
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallNotFound`] for a never-seen id
    pub async fn end_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.manager.end_call(call_id).await
    }

    /// End live calls, stop the manager and close the signaling channel
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.channel.close().await;
        tracing::info!(user = %self.local_user, "call service stopped");
    }
}
