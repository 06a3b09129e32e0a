use std::{collections::HashMap, fmt, io, net::SocketAddr};

use interlink_client::{Answer, ChannelConfig, ChannelError, OutboundChannel};
use interlink_common::{
    codec::{probe_cipher, Secret},
    config::{CommConfig, PeerAddress},
    error::{CapabilityMissing, ConnectError},
    platform_socket::PlatformListener,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    connection::ConnectionHandler,
    registry::{ListenerRegistry, RegistryError, SharedHandler},
};

/// Connections accepted per tick at most
const MAX_ACCEPTS_PER_TICK: usize = 32;

/// Identifies an outbound channel tracked by the server
pub type ChannelId = Uuid;

/// Lifecycle of the listening side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening; outbound channels still work
    Disabled,
    /// Accepting connections
    Listening,
    /// Terminal; nothing can be re-enabled
    ShutDown,
}

/// Why the server could not start listening
#[derive(Debug, Error)]
pub enum EnableError {
    /// The cipher is unusable on this platform
    #[error(transparent)]
    CapabilityMissing(#[from] CapabilityMissing),
    /// Listening without a secret is refused
    #[error("no shared secret configured")]
    MissingSecret,
    /// The port could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr:   SocketAddr,
        #[source]
        source: io::Error,
    },
    /// [`CommunicationServer::on_shutdown`] already ran
    #[error("server has been shut down")]
    ShutDown,
}

/// Inter-controller communication endpoint.
///
/// Owns the listening socket, the inbound connection handlers, the listener
/// registry and every outbound channel created through it. Nothing happens
/// outside [`CommunicationServer::tick`], which the host calls once per loop
/// iteration.
pub struct CommunicationServer {
    config:      CommConfig,
    state:       ServerState,
    listener:    Option<PlatformListener>,
    connections: Vec<ConnectionHandler>,
    channels:    HashMap<ChannelId, OutboundChannel>,
    registry:    ListenerRegistry,
}

impl fmt::Debug for CommunicationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationServer")
            .field("state", &self.state)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections.len())
            .field("channels", &self.channels.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl CommunicationServer {
    /// Creates a disabled server. Call [`CommunicationServer::enable`] to
    /// start listening.
    pub fn new(config: CommConfig) -> Self {
        Self {
            config,
            state: ServerState::Disabled,
            listener: None,
            connections: Vec::new(),
            channels: HashMap::new(),
            registry: ListenerRegistry::new(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Lifecycle state
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(PlatformListener::local_addr)
    }

    /// Starts listening on the configured address. A no-op when already
    /// listening. On failure the server stays disabled and the host keeps
    /// running.
    pub fn enable(&mut self) -> Result<(), EnableError> {
        match self.state {
            ServerState::ShutDown => return Err(EnableError::ShutDown),
            ServerState::Listening => return Ok(()),
            ServerState::Disabled => {}
        }

        if let Err(e) = probe_cipher(self.config.scheme) {
            tracing::error!("Communication server not started: {}", e);
            return Err(e.into());
        }
        if self.config.secret.is_empty() {
            tracing::error!("Communication server not started: no shared secret configured");
            return Err(EnableError::MissingSecret);
        }

        let addr = self.config.bind_socket_addr();
        let listener = PlatformListener::bind(addr).map_err(|source| {
            tracing::error!("Communication server not started: failed to bind {}: {}", addr, source);
            EnableError::Bind { addr, source }
        })?;

        tracing::info!(
            scheme = %self.config.scheme,
            secret = %self.config.secret.fingerprint(),
            "✓ Communication server listening on {}",
            listener.local_addr()
        );
        self.listener = Some(listener);
        self.state = ServerState::Listening;
        Ok(())
    }

    /// Stops accepting. Open connections and outbound channels are kept.
    pub fn disable(&mut self) {
        if let Some(listener) = self.listener.take() {
            tracing::info!("Communication server stopped listening on {}", listener.local_addr());
        }
        if self.state == ServerState::Listening {
            self.state = ServerState::Disabled;
        }
    }

    /// Applies a new configuration, re-binding when it is enabled.
    ///
    /// Connections accepted earlier keep the secret they were accepted with.
    pub fn reconfigure(&mut self, config: CommConfig) -> Result<(), EnableError> {
        if self.state == ServerState::ShutDown {
            return Err(EnableError::ShutDown);
        }

        self.disable();
        self.config = config;
        tracing::debug!(enabled = self.config.enabled, port = self.config.port, "Configuration applied");

        if self.config.enabled {
            self.enable()
        } else {
            Ok(())
        }
    }

    /// Registers a handler on the server's registry
    pub fn register_listener<M: Into<String>>(
        &mut self,
        method: M,
        handler: SharedHandler,
    ) -> Result<(), RegistryError> {
        self.registry.register(method, handler)
    }

    /// Removes every mapping of `handler`; returns how many were removed
    pub fn unregister_listener(&mut self, handler: &SharedHandler) -> usize {
        self.registry.unregister(handler)
    }

    /// The listener registry
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Mutable access to the listener registry
    pub fn registry_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.registry
    }

    /// Opens a channel to `peer` and tracks it so that
    /// [`CommunicationServer::tick`] drives it. Scheme, connect timeout and
    /// frame limit come from the server configuration.
    pub fn create_outbound_channel<S: Into<Secret>>(
        &mut self,
        peer: PeerAddress,
        secret: S,
    ) -> Result<ChannelId, ConnectError> {
        let config = ChannelConfig::from_comm(&self.config, secret);
        let channel = OutboundChannel::connect_with(peer, &config)?;

        let id = Uuid::new_v4();
        tracing::debug!(channel = %id, peer = %channel.peer(), "Tracking outbound channel");
        self.channels.insert(id, channel);
        Ok(id)
    }

    /// A tracked channel. Channels that closed on their own are forgotten on
    /// the next [`CommunicationServer::tick`] and return `None` afterwards.
    pub fn channel(&self, id: ChannelId) -> Option<&OutboundChannel> {
        self.channels.get(&id)
    }

    /// A tracked channel, mutably
    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut OutboundChannel> {
        self.channels.get_mut(&id)
    }

    /// Issues a call on a tracked channel. An unknown id behaves like a
    /// closed channel.
    pub fn call<F>(
        &mut self,
        id: ChannelId,
        on_result: F,
        method: &str,
        data: Value,
    ) -> Result<(), ChannelError>
    where
        F: FnOnce(Answer) + 'static,
    {
        self.channels
            .get_mut(&id)
            .ok_or(ChannelError::Closed)?
            .call(on_result, method, data)
    }

    /// Closes and forgets a tracked channel. Returns `false` if it was not
    /// tracked: never created, closed here before, or pruned by a tick after
    /// the peer hung up.
    pub fn close_outbound_channel(&mut self, id: ChannelId) -> bool {
        match self.channels.remove(&id) {
            Some(mut channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Accepted connections still open
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tracked outbound channels
    pub fn outbound_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// One cooperative pass over every socket the server owns
    pub fn tick(&mut self) {
        if self.state == ServerState::ShutDown {
            return;
        }

        self.accept_pending();

        for connection in self.connections.iter_mut() {
            connection.poll(&self.registry);
        }
        self.connections.retain(|connection| !connection.is_closed());

        for channel in self.channels.values_mut() {
            channel.tick();
        }
        self.channels.retain(|id, channel| {
            if !channel.is_open() {
                tracing::info!(channel = %id, peer = %channel.peer(), "Outbound channel closed, no longer tracked");
            }
            channel.is_open()
        });
    }

    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        for _ in 0..MAX_ACCEPTS_PER_TICK {
            match listener.accept() {
                Ok(Some((stream, peer))) => {
                    let handler = ConnectionHandler::new(stream, peer, self.config.codec());
                    tracing::info!(connection = %handler.id(), peer = %peer, "New connection accepted");
                    self.connections.push(handler);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Host shutdown hook: closes the listener, every inbound connection and
    /// every tracked outbound channel. The server cannot be enabled again.
    pub fn on_shutdown(&mut self) {
        if self.state == ServerState::ShutDown {
            return;
        }

        self.listener = None;
        let connections = self.connections.len();
        for connection in self.connections.iter_mut() {
            connection.close();
        }
        self.connections.clear();

        let channels = self.channels.len();
        for channel in self.channels.values_mut() {
            channel.close();
        }
        self.channels.clear();

        self.state = ServerState::ShutDown;
        tracing::info!(connections, channels, "✓ Communication server shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn loopback_config() -> CommConfig {
        CommConfig::new()
            .with_enabled(true)
            .with_secret("unit-secret")
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0)
    }

    #[test]
    fn new_server_is_disabled() {
        let server = CommunicationServer::new(loopback_config());
        assert_eq!(server.state(), ServerState::Disabled);
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn enable_binds_and_disable_releases() {
        let mut server = CommunicationServer::new(loopback_config());
        server.enable().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(server.local_addr().is_some());

        // enabling twice is harmless
        server.enable().unwrap();

        server.disable();
        assert_eq!(server.state(), ServerState::Disabled);
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn empty_secret_is_refused() {
        let mut server = CommunicationServer::new(loopback_config().with_secret(""));
        assert!(matches!(server.enable(), Err(EnableError::MissingSecret)));
        assert_eq!(server.state(), ServerState::Disabled);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn occupied_port_leaves_server_disabled() {
        let mut first = CommunicationServer::new(loopback_config());
        first.enable().unwrap();
        let port = first.local_addr().unwrap().port();

        // SO_REUSEADDR does not allow a second bind on a listening port here
        let mut second = CommunicationServer::new(loopback_config().with_port(port));
        assert!(matches!(second.enable(), Err(EnableError::Bind { .. })));
        assert_eq!(second.state(), ServerState::Disabled);
    }

    #[test]
    fn reconfigure_with_disabled_config_stops_listening() {
        let mut server = CommunicationServer::new(loopback_config());
        server.enable().unwrap();

        server.reconfigure(loopback_config().with_enabled(false)).unwrap();
        assert_eq!(server.state(), ServerState::Disabled);
        assert!(!server.config().enabled);
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut server = CommunicationServer::new(loopback_config());
        server.enable().unwrap();
        server.on_shutdown();

        assert_eq!(server.state(), ServerState::ShutDown);
        assert_eq!(server.local_addr(), None);
        assert!(matches!(server.enable(), Err(EnableError::ShutDown)));
        assert!(matches!(server.reconfigure(loopback_config()), Err(EnableError::ShutDown)));
        // ticking after shutdown does nothing
        server.tick();
    }

    #[test]
    fn unknown_channel_id_behaves_as_closed() {
        let mut server = CommunicationServer::new(loopback_config());
        let id = Uuid::new_v4();

        assert!(!server.close_outbound_channel(id));
        let result = server.call(id, |_| {}, "Ping", Value::Null);
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
