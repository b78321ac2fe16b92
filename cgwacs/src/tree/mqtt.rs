use core::{
    convert::Infallible,
    str::FromStr as _,
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use cgwacs_common::{
    Payload, Topic, TreePath,
    meta::{self, MetaField},
};
use compact_str::{CompactString, ToCompactString as _};
use mqtt_endpoint_tokio::mqtt_ep::{
    self, Endpoint,
    packet::v5_0,
    role,
    transport::{TcpTransport, connect_helper},
};
use mqtt_protocol_core::mqtt::packet::{
    Property, Qos, SubEntry, SubOpts, SubscriptionIdentifier,
    v5_0::{Connack, Publish},
};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{InboundWrite, TreeClient, Writes};
use crate::{Error, Result, ServiceName};

pub(crate) type SubscriptionHandler = Box<dyn FnMut(PublishEvent) -> bool + Send + Sync>;

/// How long a claim waits for the retained owner of a service name.
pub const CLAIM_WINDOW: Duration = Duration::from_millis(500);

/// The value tree as served by an MQTT v5 broker.
///
/// A service name is claimed by publishing the connection's client id
/// retained under `$meta/owner`. A name owned by another client id is refused;
/// a name left behind by an earlier run with the same client id is taken over.
///
/// [`handle`](Self::handle) must be running for writes and claims to be
/// delivered.
pub struct MqttTree {
    endpoint: Endpoint<role::Client>,
    client_id: CompactString,
    next_payload_id: AtomicU16,
    // key could be SubscriptionIdentifier if it implemented Ord
    sub_handlers: Mutex<BTreeMap<u32, SubscriptionHandler>>,
    services: Mutex<BTreeMap<ServiceName, ServiceClaim>>,
}

/// What has to be undone when a service is released.
#[derive(Debug, Default)]
struct ServiceClaim {
    writes_sub: u32,
    published: BTreeSet<TreePath>,
}

#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub sub_id: Option<SubscriptionIdentifier>,
    pub topic: Topic,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOpts {
    pub qos: Qos,
    pub retain: bool,
}

impl PublishOpts {
    pub const fn metadata() -> Self {
        Self { qos: Qos::AtLeastOnce, retain: true }
    }

    pub const fn value() -> Self {
        Self { qos: Qos::AtLeastOnce, retain: true }
    }
}

/// Turns a publish on a service's writes filter into an [`InboundWrite`].
///
/// Returns `None` for anything that is not a well-formed write.
fn write_event(ev: PublishEvent) -> Option<InboundWrite> {
    match ev.topic {
        Topic::Write { path, .. } => match serde_json::from_value::<Payload>(ev.payload) {
            Ok(payload) => Some(InboundWrite { path, value: payload.value }),
            Err(e) => {
                tracing::warn!(%path, "Failed to deserialize write: {e}");
                None
            }
        },
        topic => {
            tracing::error!("Received write on unexpected topic: {topic}");
            None
        }
    }
}

/// Whether a retained owner keeps `client_id` from claiming a name.
fn claimed_elsewhere(client_id: &str, owner: Option<&meta::Owner>) -> bool {
    owner.is_some_and(|owner| owner.0 != client_id)
}

impl MqttTree {
    pub async fn connect(client_id: &str, addr: &str) -> Result<Arc<Self>> {
        let endpoint = mqtt_ep::endpoint::Endpoint::<role::Client>::new(mqtt_ep::Version::V5_0);

        let tcp_stream = connect_helper::connect_tcp(addr, None).await?;
        let transport = TcpTransport::from_stream(tcp_stream);
        endpoint
            .attach(transport, mqtt_ep::endpoint::Mode::Client)
            .await?;

        let connect = v5_0::Connect::builder()
            .client_id(client_id)
            .map_err(|_| Error::MqttPacketField("client_id"))?
            .build()
            .map_err(|_| Error::MqttPacketField("connect"))?;

        endpoint.send(connect).await?;

        let packet = endpoint.recv().await?;
        let connack: Connack = packet.try_into().map_err(Error::MqttPacketField)?;
        tracing::debug!("Received CONNACK: {connack:?}");

        Ok(MqttTree {
            endpoint,
            client_id: client_id.to_compact_string(),
            next_payload_id: AtomicU16::new(1),
            sub_handlers: Mutex::new(BTreeMap::new()),
            services: Mutex::new(BTreeMap::new()),
        }
        .into())
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn next_payload_id(&self) -> u16 {
        loop {
            let id = self.next_payload_id.fetch_add(1, Ordering::Relaxed);

            if id != 0 {
                break id;
            }
        }
    }

    fn next_subscription_id(&self) -> Result<SubscriptionIdentifier> {
        // max value is 2^28 - 1 (min value is also 1)
        SubscriptionIdentifier::new(self.next_payload_id() as u32)
            .map_err(|_| Error::MqttPacketField("subscription_identifier"))
    }

    async fn recv(&self) -> Result<PublishEvent> {
        loop {
            let packet = self.endpoint.recv().await?;

            let publish: Result<Publish, _> = packet.try_into();
            if let Ok(publish) = publish {
                let sub_id = publish.props.iter().find_map(|p| {
                    if let Property::SubscriptionIdentifier(id) = p {
                        Some(id.clone())
                    } else {
                        None
                    }
                });

                let topic = Topic::from_str(publish.topic_name()).map_err(Error::BadTopic)?;

                let payload: serde_json::Value =
                    serde_json::from_slice(publish.payload().as_slice())?;

                break Ok(PublishEvent { sub_id, topic, payload });
            }
        }
    }

    /// Receive loop dispatching incoming publishes to subscription handlers.
    ///
    /// Malformed messages are logged and skipped; only connection errors end
    /// the loop.
    pub async fn handle(&self) -> Result<Infallible> {
        loop {
            let event = match self.recv().await {
                Ok(event) => event,
                Err(e @ (Error::BadTopic(_) | Error::SerdeJson(_))) => {
                    tracing::warn!("Ignoring malformed message: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            tracing::debug!("Handling publish event: {event:#?}");

            if let Some(sub_id) = event.sub_id.clone() {
                let mut handlers = self.sub_handlers.lock().await;

                if let Some(handler) = handlers.get_mut(&sub_id.val()) {
                    let retain = handler(event);

                    if !retain {
                        tracing::debug!("Removing subscription handler for ID {}", sub_id.val());
                        handlers.remove(&sub_id.val());
                    }
                }
            }
        }
    }

    /// Subscribes to `topic` and returns the subscription id `handler` is
    /// registered under.
    async fn subscribe_with_handler(&self, topic: Topic, handler: SubscriptionHandler) -> Result<u32> {
        let sub_id = self.next_subscription_id()?;

        let subscribe = v5_0::Subscribe::builder()
            .packet_id(self.next_payload_id())
            .props(vec![Property::SubscriptionIdentifier(sub_id.clone())])
            .entries(vec![SubEntry::new(
                topic.to_string(),
                SubOpts::new().set_qos(Qos::AtLeastOnce),
            )?])
            .build()?;

        tracing::info!("Subscribing to topic '{topic}'");

        // register before sending so no early write slips past
        self.sub_handlers.lock().await.insert(sub_id.val(), handler);

        let sent: Result<()> = async {
            self.endpoint
                .register_packet_id(subscribe.packet_id())
                .await?;
            self.endpoint.send(subscribe).await?;
            Ok(())
        }
        .await;

        if let Err(e) = sent {
            self.sub_handlers.lock().await.remove(&sub_id.val());
            return Err(e);
        }

        Ok(sub_id.val())
    }

    /// Drops the handler of `sub_id` and unsubscribes from `topic`.
    async fn unsubscribe(&self, sub_id: u32, topic: Topic) -> Result<()> {
        self.sub_handlers.lock().await.remove(&sub_id);

        let unsubscribe = v5_0::Unsubscribe::builder()
            .packet_id(self.next_payload_id())
            .entries(vec![topic.to_string()])?
            .build()?;

        tracing::info!("Unsubscribing from topic '{topic}'");

        self.endpoint
            .register_packet_id(unsubscribe.packet_id())
            .await?;

        self.endpoint.send(unsubscribe).await?;

        Ok(())
    }

    pub async fn publish_raw(
        &self,
        topic: Topic,
        payload: impl Serialize,
        opts: PublishOpts,
    ) -> Result<()> {
        let payload = serde_json::to_string(&payload)?;

        tracing::debug!("Publishing to topic {topic}: {payload}");

        self.send_publish(topic, payload, opts).await
    }

    /// Removes the retained message of `topic` from the broker.
    async fn clear_retained(&self, topic: Topic) -> Result<()> {
        tracing::debug!("Clearing retained topic {topic}");

        self.send_publish(topic, String::new(), PublishOpts::metadata())
            .await
    }

    async fn send_publish(&self, topic: Topic, payload: String, opts: PublishOpts) -> Result<()> {
        let publish = v5_0::Publish::builder()
            .topic_name(topic.to_string())?
            .payload(payload)
            .qos(opts.qos)
            .retain(opts.retain)
            .packet_id(self.next_payload_id())
            .build()?;

        if let Some(packet_id) = publish.packet_id() {
            self.endpoint.register_packet_id(packet_id).await?;
        }

        self.endpoint.send(publish).await?;

        Ok(())
    }

    pub async fn publish_service_meta<T: MetaField>(
        &self,
        service: &ServiceName,
        meta: T,
    ) -> Result<()> {
        self.publish_raw(meta_topic::<T>(service), meta, PublishOpts::metadata())
            .await
    }

    /// Reads the retained owner of `service`, if the broker has one.
    async fn current_owner(&self, service: &ServiceName) -> Result<Option<meta::Owner>> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        let handler: SubscriptionHandler = Box::new(move |ev| {
            match serde_json::from_value::<meta::Owner>(ev.payload) {
                Ok(owner) => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(owner);
                    }
                }
                Err(e) => tracing::warn!(topic = %ev.topic, "Ignoring malformed owner: {e}"),
            }
            tx.is_some()
        });

        let topic = meta_topic::<meta::Owner>(service);
        let sub_id = self.subscribe_with_handler(topic.clone(), handler).await?;

        let owner = tokio::time::timeout(CLAIM_WINDOW, rx).await.ok().and_then(Result::ok);

        self.unsubscribe(sub_id, topic).await?;

        Ok(owner)
    }

    async fn claim(&self, service: &ServiceName, tx: mpsc::UnboundedSender<InboundWrite>) -> Result<u32> {
        let owner = self.current_owner(service).await?;
        if claimed_elsewhere(&self.client_id, owner.as_ref()) {
            tracing::warn!(%service, owner = ?owner, "Service is owned by another client");
            return Err(Error::ServiceTaken(service.clone()));
        }

        let handler: SubscriptionHandler =
            Box::new(move |ev| write_event(ev).is_none_or(|write| tx.send(write).is_ok()));

        let writes_sub = self
            .subscribe_with_handler(Topic::Writes { service: service.clone() }, handler)
            .await?;

        let announced = async {
            self.publish_service_meta(service, meta::Owner(self.client_id.clone()))
                .await?;
            self.publish_service_meta(service, meta::Status::Online).await
        };

        if let Err(e) = announced.await {
            let _ = self
                .unsubscribe(writes_sub, Topic::Writes { service: service.clone() })
                .await;
            return Err(e);
        }

        Ok(writes_sub)
    }
}

fn meta_topic<T: MetaField>(service: &ServiceName) -> Topic {
    Topic::ServiceMeta {
        service: service.clone(),
        key: CompactString::const_new(T::KEY),
    }
}

impl TreeClient for MqttTree {
    async fn register_service(&self, service: &ServiceName) -> Result<Writes> {
        {
            let mut services = self.services.lock().await;
            if services.contains_key(service) {
                return Err(Error::ServiceTaken(service.clone()));
            }
            services.insert(service.clone(), ServiceClaim::default());
        }

        let (tx, rx) = mpsc::unbounded_channel();

        match self.claim(service, tx).await {
            Ok(writes_sub) => {
                if let Some(claim) = self.services.lock().await.get_mut(service) {
                    claim.writes_sub = writes_sub;
                }
                Ok(rx)
            }
            Err(e) => {
                self.services.lock().await.remove(service);
                Err(e)
            }
        }
    }

    async fn publish(&self, service: &ServiceName, path: &TreePath, payload: &Payload) -> Result<()> {
        let topic = Topic::Value { service: service.clone(), path: path.clone() };
        self.publish_raw(topic, payload, PublishOpts::value()).await?;

        if let Some(claim) = self.services.lock().await.get_mut(service) {
            claim.published.insert(path.clone());
        }

        Ok(())
    }

    async fn unregister_service(&self, service: &ServiceName) -> Result<()> {
        let Some(claim) = self.services.lock().await.remove(service) else {
            return Err(Error::UnknownService(service.clone()));
        };

        // closes the writes channel
        self.unsubscribe(claim.writes_sub, Topic::Writes { service: service.clone() })
            .await?;

        for path in claim.published {
            self.clear_retained(Topic::Value { service: service.clone(), path })
                .await?;
        }

        self.publish_service_meta(service, meta::Status::Offline)
            .await?;
        self.clear_retained(meta_topic::<meta::Owner>(service)).await
    }
}
