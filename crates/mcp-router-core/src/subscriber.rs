//! Registry watch handling
//!
//! Watch callbacks only push `NamingEvent`s into a bounded channel. A single
//! consumer task applies them to the `InstanceCache`, so cache writes coming
//! from pushes never race with each other.

use std::sync::Arc;

use dashmap::DashSet;
use mcp_router_api::{EventListener, NamingClient, NamingEvent, ServiceKey};
use mcp_router_common::{Result, ShutdownSignal};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::InstanceCache;

/// Listener handed to the registry backend; forwards events to the consumer.
struct ChannelListener {
    sender: mpsc::Sender<NamingEvent>,
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: NamingEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropped registry change event: {}", e);
        }
    }
}

pub struct RegistrySubscriber {
    naming: Arc<dyn NamingClient>,
    cache: Arc<InstanceCache>,
    subscriptions: DashSet<ServiceKey>,
    listener: Arc<ChannelListener>,
    receiver: Mutex<Option<mpsc::Receiver<NamingEvent>>>,
}

impl RegistrySubscriber {
    pub fn new(naming: Arc<dyn NamingClient>, cache: Arc<InstanceCache>, buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        Self {
            naming,
            cache,
            subscriptions: DashSet::new(),
            listener: Arc::new(ChannelListener { sender }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Subscribe to `key` once. Returns `Ok(false)` when a subscription already exists.
    pub async fn ensure_subscribed(&self, key: &ServiceKey) -> Result<bool> {
        // insert is the atomic check-and-set
        if !self.subscriptions.insert(key.clone()) {
            return Ok(false);
        }

        let listener: Arc<dyn EventListener> = self.listener.clone();
        match self
            .naming
            .subscribe(&key.service_name, &key.group, listener)
            .await
        {
            Ok(()) => {
                info!("Subscribed to service changes: {}", key);
                Ok(true)
            }
            Err(e) => {
                self.subscriptions.remove(key);
                warn!("Failed to subscribe to {}: {}", key, e);
                Err(e.into())
            }
        }
    }

    pub async fn unsubscribe(&self, key: &ServiceKey) -> Result<()> {
        if self.subscriptions.remove(key).is_none() {
            return Ok(());
        }
        self.naming
            .unsubscribe(&key.service_name, &key.group)
            .await?;
        info!("Unsubscribed from service changes: {}", key);
        Ok(())
    }

    pub fn is_subscribed(&self, key: &ServiceKey) -> bool {
        self.subscriptions.contains(key)
    }

    pub fn subscriptions(&self) -> Vec<ServiceKey> {
        self.subscriptions.iter().map(|k| k.key().clone()).collect()
    }

    /// Overwrite the cached view with the routable instances of the event.
    pub fn apply(&self, event: NamingEvent) {
        let key = ServiceKey::new(event.service_name, event.group);
        let total = event.instances.len();
        let routable: Vec<_> = event
            .instances
            .into_iter()
            .filter(|i| i.is_routable())
            .collect();
        debug!(
            "Applying registry change: service={}, routable={}, total={}",
            key,
            routable.len(),
            total
        );
        self.cache.put(key, routable);
    }

    /// Consume change events until shutdown. Only the first call gets the receiver.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let receiver = self.receiver.lock().take();
        let Some(mut receiver) = receiver else {
            warn!("Registry subscriber consumer is already running");
            return;
        };

        info!("Registry subscriber started");
        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Registry subscriber stopped");
    }

    /// Unsubscribe from everything; used on shutdown.
    pub async fn unsubscribe_all(&self) {
        for key in self.subscriptions() {
            if let Err(e) = self.unsubscribe(&key).await {
                warn!("Failed to unsubscribe from {}: {}", key, e);
            }
        }
    }
}
