use super::registry::API_VERSION;
use super::{DeviceChannel, MessagingConnector};
use crate::connection_string::{ConnectionString, URI_COMPONENT};
use crate::errors::{Error, Result};
use crate::model::{PropertyBag, TelemetryMessage};
use async_trait::async_trait;
use percent_encoding::utf8_percent_encode;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const KEEP_ALIVE_SECS: u64 = 30;
const REQUEST_CHANNEL_CAPACITY: usize = 10;
const TWIN_RESPONSE_TOPIC: &str = "$iothub/twin/res/";

/// Opens one MQTT session per call, authenticated as the target device.
#[derive(Debug)]
pub struct MqttConnector {
    credentials: ConnectionString,
    port: u16,
    sas_ttl: Duration,
    next_request_id: AtomicU64,
}

impl MqttConnector {
    pub fn new(credentials: ConnectionString, port: u16, sas_ttl: Duration) -> Self {
        Self {
            credentials,
            port,
            sas_ttl,
            next_request_id: AtomicU64::new(1),
        }
    }

    fn options_for(&self, device_id: &str) -> Result<MqttOptions> {
        resolve_device(&self.credentials, device_id)?;

        let password = self
            .credentials
            .sas_token(&self.credentials.device_resource(device_id), self.sas_ttl)?;
        let username = format!(
            "{}/{}/?api-version={}",
            self.credentials.host_name,
            device_id,
            API_VERSION
        );

        let mut options = MqttOptions::new(device_id, &self.credentials.host_name, self.port);
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_clean_session(true);
        options.set_credentials(username, password);
        options.set_transport(Transport::tls_with_default_config());
        Ok(options)
    }
}

/// A device credential may only act for its own device; a hub policy
/// credential may act for any device.
fn resolve_device(credentials: &ConnectionString, device_id: &str) -> Result<()> {
    match credentials.device_id.as_deref() {
        Some(own) if own != device_id => Err(Error::InvalidInput(format!(
            "device credential is for {:?}, not {:?}",
            own, device_id
        ))),
        _ => Ok(()),
    }
}

fn telemetry_topic(device_id: &str, message: &TelemetryMessage) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        utf8_percent_encode(message.content_type, URI_COMPONENT),
        utf8_percent_encode(message.content_encoding, URI_COMPONENT)
    )
}

fn reported_patch_topic(request_id: u64) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", request_id)
}

/// Parses `$iothub/twin/res/{status}/?$rid={rid}[&...]` into status and rid.
fn parse_twin_response(topic: &str) -> Option<(u16, u64)> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_TOPIC)?;
    let (status, query) = rest.split_once("/?")?;
    let status = status.parse().ok()?;
    let rid = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?
        .parse()
        .ok()?;
    Some((status, rid))
}

#[async_trait]
impl MessagingConnector for MqttConnector {
    async fn connect(&self, device_id: &str) -> Result<Box<dyn DeviceChannel>> {
        let options = self.options_for(device_id)?;
        info!(
            "Connecting device {} to {}:{}",
            device_id, self.credentials.host_name, self.port
        );

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let channel = MqttDeviceChannel::open(device_id, options, request_id).await?;
        Ok(Box::new(channel))
    }
}

/// Session state. Dropping the event loop closes the socket.
pub struct MqttDeviceChannel {
    device_id: String,
    client: AsyncClient,
    eventloop: EventLoop,
    request_id: u64,
    /// Set once the event loop has reported a connection error.
    connection_lost: bool,
}

impl MqttDeviceChannel {
    async fn open(device_id: &str, options: MqttOptions, request_id: u64) -> Result<Self> {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let mut channel = Self {
            device_id: device_id.to_string(),
            client,
            eventloop,
            request_id,
            connection_lost: false,
        };

        channel
            .poll_until(|packet| matches!(packet, Packet::ConnAck(_)).then_some(()))
            .await?;
        debug!("Device {} connected", device_id);
        Ok(channel)
    }

    async fn poll_until<T>(
        &mut self,
        mut matcher: impl FnMut(&Packet) -> Option<T>,
    ) -> Result<T> {
        loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    self.connection_lost = true;
                    return Err(e.into());
                }
            };
            match event {
                Event::Incoming(packet) => {
                    if let Some(value) = matcher(&packet) {
                        return Ok(value);
                    }
                }
                Event::Outgoing(_) => {}
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for MqttDeviceChannel {
    async fn send_event(&mut self, message: TelemetryMessage) -> Result<()> {
        let topic = telemetry_topic(&self.device_id, &message);
        debug!("Publishing {} bytes to {}", message.body.len(), topic);

        self.client
            .publish(topic, QoS::AtLeastOnce, false, message.body)
            .await?;
        self.poll_until(|packet| matches!(packet, Packet::PubAck(_)).then_some(()))
            .await
    }

    async fn update_reported_properties(&mut self, reported: PropertyBag) -> Result<()> {
        let request_id = self.request_id;
        let body = serde_json::to_vec(&reported)?;

        self.client
            .subscribe(format!("{}#", TWIN_RESPONSE_TOPIC), QoS::AtMostOnce)
            .await?;
        self.poll_until(|packet| matches!(packet, Packet::SubAck(_)).then_some(()))
            .await?;

        self.client
            .publish(reported_patch_topic(request_id), QoS::AtMostOnce, false, body)
            .await?;

        let status = self
            .poll_until(|packet| match packet {
                Packet::Publish(publish) => parse_twin_response(&publish.topic)
                    .filter(|(_, rid)| *rid == request_id)
                    .map(|(status, _)| status),
                _ => None,
            })
            .await?;

        if (200..300).contains(&status) {
            Ok(())
        } else {
            warn!(
                "Reported property update for {} rejected with status {}",
                self.device_id, status
            );
            Err(Error::Backend(format!(
                "reported property update rejected with status {}",
                status
            )))
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if this.connection_lost {
            // Polling again would reconnect and replay unacknowledged publishes
            debug!("Dropping lost session for device {}", this.device_id);
            return Ok(());
        }

        this.client.disconnect().await?;
        loop {
            match this.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => continue,
                // The broker may drop the socket first
                Err(_) => break,
            }
        }
        debug!("Device {} disconnected", this.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    const REPORTED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/?$rid=";

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum BrokerMode {
        /// Acknowledge everything and answer reported patches with this status.
        Answer(u16),
        /// Drop the first connection as soon as it publishes.
        DropOnFirstPublish,
    }

    #[derive(Debug, Clone)]
    struct Published {
        connection: usize,
        topic: String,
        payload: Vec<u8>,
    }

    /// Plain-TCP MQTT 3.1.1 endpoint speaking just enough of the protocol.
    struct FakeBroker {
        addr: SocketAddr,
        connections: Arc<AtomicUsize>,
        published: Arc<Mutex<Vec<Published>>>,
    }

    impl FakeBroker {
        async fn start(mode: BrokerMode) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let connections = Arc::new(AtomicUsize::new(0));
            let published = Arc::new(Mutex::new(Vec::new()));

            let (counter, log) = (connections.clone(), published.clone());
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, index, mode, log.clone()));
                }
            });

            Self {
                addr,
                connections,
                published,
            }
        }

        async fn open_channel(&self) -> MqttDeviceChannel {
            let options = MqttOptions::new("dev-1", self.addr.ip().to_string(), self.addr.port());
            MqttDeviceChannel::open("dev-1", options, 7).await.unwrap()
        }

        async fn published(&self) -> Vec<Published> {
            self.published.lock().await.clone()
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let (mut len, mut shift) = (0usize, 0);
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn encode_packet(header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
        out.extend_from_slice(body);
        out
    }

    fn twin_response(status: u16, rid: u64) -> Vec<u8> {
        let topic = format!("{}{}/?$rid={}", TWIN_RESPONSE_TOPIC, status, rid);
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        encode_packet(0x30, &body)
    }

    async fn serve(
        mut stream: TcpStream,
        index: usize,
        mode: BrokerMode,
        log: Arc<Mutex<Vec<Published>>>,
    ) {
        while let Some((header, body)) = read_packet(&mut stream).await {
            let reply = match header >> 4 {
                // CONNECT
                1 => vec![0x20, 0x02, 0x00, 0x00],
                // PUBLISH
                3 => {
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).to_string();
                    let qos = (header >> 1) & 0x03;
                    let offset = 2 + topic_len + if qos > 0 { 2 } else { 0 };
                    log.lock().await.push(Published {
                        connection: index,
                        topic: topic.clone(),
                        payload: body[offset..].to_vec(),
                    });

                    let puback = (qos > 0)
                        .then(|| vec![0x40, 0x02, body[2 + topic_len], body[3 + topic_len]]);
                    match (mode, topic.strip_prefix(REPORTED_PATCH_PREFIX)) {
                        (BrokerMode::DropOnFirstPublish, _) if index == 0 => return,
                        (BrokerMode::Answer(status), Some(rid)) => {
                            let rid: u64 = rid.parse().unwrap();
                            let mut reply = twin_response(500, rid + 1000);
                            reply.extend(twin_response(status, rid));
                            reply
                        }
                        _ => puback.unwrap_or_default(),
                    }
                }
                // SUBSCRIBE
                8 => vec![0x90, 0x03, body[0], body[1], 0x00],
                // PINGREQ
                12 => vec![0xd0, 0x00],
                // DISCONNECT
                14 => return,
                _ => Vec::new(),
            };

            if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    fn telemetry(value: serde_json::Value) -> TelemetryMessage {
        TelemetryMessage::json(value.as_object().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_send_event_waits_for_puback() {
        let broker = FakeBroker::start(BrokerMode::Answer(204)).await;
        let mut channel = broker.open_channel().await;

        channel
            .send_event(telemetry(json!({"temp": 21.5})))
            .await
            .unwrap();
        Box::new(channel).close().await.unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].topic,
            "devices/dev-1/messages/events/$.ct=application%2Fjson&$.ce=utf-8"
        );
        assert_eq!(published[0].payload, br#"{"temp":21.5}"#.to_vec());
        assert_eq!(broker.connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_session_is_not_replayed_on_close() {
        let broker = FakeBroker::start(BrokerMode::DropOnFirstPublish).await;
        let mut channel = broker.open_channel().await;

        let outcome = channel.send_event(telemetry(json!({"temp": 21.5}))).await;
        assert!(matches!(outcome, Err(Error::Connection(_))));
        Box::new(channel).close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.connections.load(Ordering::SeqCst), 1);
        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].connection, 0);
    }

    #[tokio::test]
    async fn test_reported_update_matches_request_id() {
        let broker = FakeBroker::start(BrokerMode::Answer(204)).await;
        let mut channel = broker.open_channel().await;

        let mut reported = PropertyBag::new();
        reported.merge(json!({"firmware": "2.0.1"}).as_object().unwrap());
        channel.update_reported_properties(reported).await.unwrap();
        Box::new(channel).close().await.unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, reported_patch_topic(7));
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&published[0].payload).unwrap(),
            json!({"firmware": "2.0.1"})
        );
    }

    #[tokio::test]
    async fn test_reported_update_rejected_by_hub() {
        let broker = FakeBroker::start(BrokerMode::Answer(400)).await;
        let mut channel = broker.open_channel().await;

        let outcome = channel.update_reported_properties(PropertyBag::new()).await;
        assert!(matches!(outcome, Err(Error::Backend(_))));
        Box::new(channel).close().await.unwrap();
    }

    fn policy_credentials() -> ConnectionString {
        "HostName=hub.example.net;SharedAccessKeyName=device;SharedAccessKey=c2VjcmV0"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_telemetry_topic_carries_content_properties() {
        let message = TelemetryMessage::json(json!({"temp": 21.5}).as_object().unwrap()).unwrap();

        assert_eq!(
            telemetry_topic("dev-1", &message),
            "devices/dev-1/messages/events/$.ct=application%2Fjson&$.ce=utf-8"
        );
    }

    #[test]
    fn test_parse_twin_response() {
        assert_eq!(
            parse_twin_response("$iothub/twin/res/204/?$rid=7&$version=12"),
            Some((204, 7))
        );
        assert_eq!(parse_twin_response("$iothub/twin/res/400/?$rid=3"), Some((400, 3)));
        assert_eq!(parse_twin_response("$iothub/twin/res/204/"), None);
        assert_eq!(parse_twin_response("devices/d/messages/events/"), None);
    }

    #[test]
    fn test_reported_patch_topic() {
        assert_eq!(
            reported_patch_topic(9),
            "$iothub/twin/PATCH/properties/reported/?$rid=9"
        );
    }

    #[test]
    fn test_device_credential_is_bound_to_its_device() {
        let device: ConnectionString = "HostName=h;DeviceId=dev-1;SharedAccessKey=c2VjcmV0"
            .parse()
            .unwrap();

        assert!(resolve_device(&device, "dev-1").is_ok());
        assert!(matches!(
            resolve_device(&device, "dev-2"),
            Err(Error::InvalidInput(_))
        ));
        assert!(resolve_device(&policy_credentials(), "any-device").is_ok());
    }

    #[test]
    fn test_options_for_device() {
        let connector = MqttConnector::new(policy_credentials(), 8883, Duration::from_secs(60));
        let options = connector.options_for("dev-1").unwrap();

        assert_eq!(options.client_id(), "dev-1");
        assert_eq!(options.broker_address(), ("hub.example.net".to_string(), 8883));
        let (username, password) = options.credentials().unwrap();
        assert_eq!(username, "hub.example.net/dev-1/?api-version=2021-04-12");
        assert!(password.starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev-1"));
    }
}
