//! GATT channel to a connected companion phone
//!
//! Request/response exchanges write the request to an endpoint's
//! characteristic and read the same characteristic back. Chunked responses
//! and device pushes arrive as notifications, which a single router task
//! fans out to whoever registered for that endpoint.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as _, CentralEvent, CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use usmessage_core::protocol::{ChunkAssembler, Frame};
use usmessage_core::transport::{Channel, Endpoint};
use usmessage_core::{Device, LinkMonitor, Result, SyncError};

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::protocol::GattLayout;

// ----------------------------------------------------------------------------
// Notification Routing
// ----------------------------------------------------------------------------

struct Route {
    id: u64,
    endpoint: Endpoint,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Router {
    next_id: AtomicU64,
    routes: Mutex<Vec<Route>>,
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, Vec<Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, endpoint: Endpoint) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Route {
            id,
            endpoint,
            sender,
        });
        (id, receiver)
    }

    fn unregister(&self, id: u64) {
        self.lock().retain(|route| route.id != id);
    }

    fn dispatch(&self, endpoint: Endpoint, value: Vec<u8>) {
        self.lock().retain(|route| {
            route.endpoint != endpoint || route.sender.send(value.clone()).is_ok()
        });
    }

    fn close_all(&self) {
        self.lock().clear();
    }
}

/// Removes a transfer's route when it ends or is cancelled
///
/// A transfer that did not finish leaves `aborted` set, since the device may
/// still be streaming its remaining chunks.
struct RouteGuard<'a> {
    router: &'a Router,
    id: u64,
    aborted: &'a AtomicBool,
    finished: bool,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.router.unregister(self.id);
        if !self.finished {
            self.aborted.store(true, Ordering::Release);
        }
    }
}

/// Discard chunks until the endpoint stays quiet for `settle`
async fn drain_stale(chunks: &mut mpsc::UnboundedReceiver<Vec<u8>>, settle: Duration) -> usize {
    let mut discarded = 0;
    while let Ok(Some(_)) = tokio::time::timeout(settle, chunks.recv()).await {
        discarded += 1;
    }
    discarded
}

/// Feed routed chunks into `assembler` until the transfer completes
///
/// With `resync` set, frames that cannot open a transfer are skipped as
/// leftovers of an earlier one.
async fn receive_transfer(
    chunks: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    assembler: &mut ChunkAssembler,
    mut resync: bool,
) -> Result<Vec<u8>> {
    while let Some(bytes) = chunks.recv().await {
        let frame = Frame::decode(&bytes)?;
        if resync {
            if !frame.starts_transfer() {
                debug!("Skipping frame left over from an earlier transfer");
                continue;
            }
            resync = false;
        }
        if let Some(complete) = assembler.push(frame)? {
            return Ok(complete);
        }
    }
    error!(
        "Link closed after {} bytes of a chunked transfer",
        assembler.received()
    );
    Err(SyncError::LinkLost)
}

// ----------------------------------------------------------------------------
// BLE Channel
// ----------------------------------------------------------------------------

/// Open GATT link implementing the core [`Channel`] contract
pub struct BleChannel {
    device: Device,
    peripheral: Peripheral,
    config: BleTransportConfig,
    characteristics: [Option<Characteristic>; Endpoint::COUNT],
    router: Arc<Router>,
    transfer_aborted: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BleChannel {
    /// Connect, discover the companion service and start link supervision
    pub async fn connect(
        adapter: &Adapter,
        peripheral: Peripheral,
        device: Device,
        config: BleTransportConfig,
        monitor: LinkMonitor,
    ) -> std::result::Result<Self, BleTransportError> {
        let connected =
            tokio::time::timeout(config.connection_timeout, peripheral.connect()).await;
        match connected {
            Ok(Ok(())) => info!("GATT connection to {} established", device.name),
            Ok(Err(e)) => return Err(BleTransportError::ConnectionFailed(e.to_string())),
            Err(_) => {
                return Err(BleTransportError::ConnectionTimeout(config.connection_timeout));
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            disconnect_quietly(&peripheral).await;
            return Err(e.into());
        }
        let available = peripheral.characteristics();
        let characteristics = match resolve_characteristics(&config.layout, &available) {
            Ok(characteristics) => characteristics,
            Err(e) => {
                disconnect_quietly(&peripheral).await;
                return Err(e);
            }
        };

        let channel = Self {
            device,
            peripheral,
            config,
            characteristics,
            router: Arc::new(Router::default()),
            transfer_aborted: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };
        if let Err(e) = channel.start_supervision(adapter, monitor).await {
            disconnect_quietly(&channel.peripheral).await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Subscribe notify characteristics and spawn the router and link watcher
    async fn start_supervision(
        &self,
        adapter: &Adapter,
        monitor: LinkMonitor,
    ) -> std::result::Result<(), BleTransportError> {
        for characteristic in self.characteristics.iter().flatten() {
            if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                self.peripheral
                    .subscribe(characteristic)
                    .await
                    .map_err(|e| BleTransportError::SubscriptionFailed(e.to_string()))?;
            }
        }

        let mut notifications = self.peripheral.notifications().await?;
        let router = self.router.clone();
        let layout = self.config.layout;
        let stream_monitor = monitor.clone();
        let routing = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                match layout.endpoint(&notification.uuid) {
                    Some(endpoint) => router.dispatch(endpoint, notification.value),
                    None => {
                        debug!("Notification from unknown characteristic {}", notification.uuid)
                    }
                }
            }
            router.close_all();
            stream_monitor.signal_lost("notification stream ended");
        });

        let mut events = adapter.events().await?;
        let peripheral_id = self.peripheral.id();
        let watching = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("Peripheral disconnected");
                        monitor.signal_lost("peripheral disconnected");
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(routing);
        tasks.push(watching);
        Ok(())
    }

    fn characteristic(&self, endpoint: Endpoint) -> Result<&Characteristic> {
        self.characteristics[endpoint.index()]
            .as_ref()
            .ok_or_else(|| {
                SyncError::unsupported(format!("{} endpoint on this device", endpoint))
            })
    }

    async fn write(&self, characteristic: &Characteristic, payload: &[u8]) -> Result<()> {
        self.peripheral
            .write(characteristic, payload, self.config.write_mode.write_type())
            .await
            .map_err(|e| SyncError::from(BleTransportError::from(e)))
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.router.close_all();
    }
}

/// Map each endpoint to its characteristic; messages is mandatory
fn resolve_characteristics(
    layout: &GattLayout,
    available: &BTreeSet<Characteristic>,
) -> std::result::Result<[Option<Characteristic>; Endpoint::COUNT], BleTransportError> {
    let mut resolved: [Option<Characteristic>; Endpoint::COUNT] = Default::default();
    let mut service_seen = false;
    for characteristic in available {
        if characteristic.service_uuid != layout.service {
            continue;
        }
        service_seen = true;
        if let Some(endpoint) = layout.endpoint(&characteristic.uuid) {
            resolved[endpoint.index()] = Some(characteristic.clone());
        }
    }

    if !service_seen {
        return Err(BleTransportError::ServiceNotFound);
    }
    if resolved[Endpoint::Messages.index()].is_none() {
        return Err(BleTransportError::CharacteristicNotFound {
            characteristic: layout.messages.to_string(),
        });
    }
    Ok(resolved)
}

async fn disconnect_quietly(peripheral: &Peripheral) {
    if let Err(e) = peripheral.disconnect().await {
        debug!("Disconnect after failed setup: {}", e);
    }
}

#[async_trait]
impl Channel for BleChannel {
    fn device(&self) -> Device {
        self.device.clone()
    }

    async fn request(&self, endpoint: Endpoint, payload: &[u8]) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(endpoint)?;
        self.write(characteristic, payload).await?;

        let response = self
            .peripheral
            .read(characteristic)
            .await
            .map_err(|e| SyncError::from(BleTransportError::from(e)))?;
        if response.is_empty() {
            return Err(SyncError::malformed("empty read from characteristic"));
        }
        debug!("Read {} bytes from {} endpoint", response.len(), endpoint);
        Ok(response)
    }

    async fn request_large(
        &self,
        endpoint: Endpoint,
        payload: &[u8],
        max_chunk_payload: usize,
    ) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(endpoint)?;
        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(SyncError::unsupported(format!(
                "chunked transfer on {} endpoint",
                endpoint
            )));
        }

        // Listen before writing so the first chunk cannot be missed
        let (id, mut chunks) = self.router.register(endpoint);
        let mut route = RouteGuard {
            router: &self.router,
            id,
            aborted: &self.transfer_aborted,
            finished: false,
        };

        let resync = self.transfer_aborted.swap(false, Ordering::AcqRel);
        if resync {
            let discarded = drain_stale(&mut chunks, self.config.stale_chunk_settle).await;
            if discarded > 0 {
                warn!("Discarded {} chunk(s) of an aborted transfer", discarded);
            }
        }
        self.write(characteristic, payload).await?;

        let mut assembler = ChunkAssembler::new(max_chunk_payload);
        let complete = receive_transfer(&mut chunks, &mut assembler, resync).await?;
        route.finished = true;
        debug!("Chunked transfer finished: {} bytes", complete.len());
        Ok(complete)
    }

    async fn subscribe(&self, endpoint: Endpoint) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let characteristic = self.characteristic(endpoint)?;
        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(SyncError::unsupported(format!("push on {} endpoint", endpoint)));
        }
        let (_, receiver) = self.router.register(endpoint);
        Ok(receiver)
    }

    async fn close(&self) -> Result<()> {
        self.stop_tasks();
        info!("Closing GATT connection to {}", self.device.name);
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| SyncError::from(BleTransportError::from(e)))
    }
}

impl Drop for BleChannel {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl std::fmt::Debug for BleChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleChannel")
            .field("device", &self.device.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ATTACHMENTS_CHARACTERISTIC_UUID, MESSAGES_CHARACTERISTIC_UUID, USMESSAGE_SERVICE_UUID,
    };
    use uuid::Uuid;

    fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn test_resolve_requires_messages_characteristic() {
        let layout = GattLayout::default();
        let available = BTreeSet::from([characteristic(
            USMESSAGE_SERVICE_UUID,
            ATTACHMENTS_CHARACTERISTIC_UUID,
            CharPropFlags::NOTIFY | CharPropFlags::WRITE,
        )]);

        let result = resolve_characteristics(&layout, &available);
        assert!(matches!(
            result,
            Err(BleTransportError::CharacteristicNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_ignores_foreign_services() {
        let layout = GattLayout::default();
        let available = BTreeSet::from([characteristic(
            Uuid::from_u128(0x180F),
            MESSAGES_CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::WRITE,
        )]);

        assert!(matches!(
            resolve_characteristics(&layout, &available),
            Err(BleTransportError::ServiceNotFound)
        ));
    }

    #[test]
    fn test_resolve_maps_endpoints() {
        let layout = GattLayout::default();
        let available = BTreeSet::from([
            characteristic(
                USMESSAGE_SERVICE_UUID,
                MESSAGES_CHARACTERISTIC_UUID,
                CharPropFlags::READ | CharPropFlags::WRITE,
            ),
            characteristic(
                USMESSAGE_SERVICE_UUID,
                ATTACHMENTS_CHARACTERISTIC_UUID,
                CharPropFlags::NOTIFY | CharPropFlags::WRITE,
            ),
        ]);

        let resolved = resolve_characteristics(&layout, &available).unwrap();
        assert!(resolved[Endpoint::Messages.index()].is_some());
        assert!(resolved[Endpoint::Attachments.index()].is_some());
        assert!(resolved[Endpoint::Notifications.index()].is_none());
    }

    #[tokio::test]
    async fn test_router_fans_out_by_endpoint() {
        let router = Router::default();
        let (_, mut pushes) = router.register(Endpoint::Notifications);
        let (transfer, mut chunks) = router.register(Endpoint::Attachments);

        router.dispatch(Endpoint::Attachments, b"chunk".to_vec());
        router.dispatch(Endpoint::Notifications, b"push".to_vec());
        assert_eq!(chunks.recv().await.unwrap(), b"chunk");
        assert_eq!(pushes.recv().await.unwrap(), b"push");

        let aborted = AtomicBool::new(false);
        {
            let _guard = RouteGuard {
                router: &router,
                id: transfer,
                aborted: &aborted,
                finished: false,
            };
        }
        router.dispatch(Endpoint::Attachments, b"late".to_vec());
        assert!(chunks.recv().await.is_none());
        assert!(aborted.load(Ordering::Acquire));
    }

    fn data(sequence: u32, payload: &[u8]) -> Vec<u8> {
        Frame::Data {
            sequence,
            payload: payload.to_vec(),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_finished_transfer_is_not_marked_aborted() {
        let router = Router::default();
        let aborted = AtomicBool::new(false);
        let (id, _chunks) = router.register(Endpoint::Attachments);
        {
            let mut guard = RouteGuard {
                router: &router,
                id,
                aborted: &aborted,
                finished: false,
            };
            guard.finished = true;
        }
        assert!(!aborted.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_stale_chunks_are_drained_before_next_transfer() {
        let router = Router::default();
        let (_, mut chunks) = router.register(Endpoint::Attachments);
        router.dispatch(Endpoint::Attachments, data(3, b"old"));
        router.dispatch(Endpoint::Attachments, Frame::End.encode());

        let discarded = drain_stale(&mut chunks, Duration::from_millis(20)).await;
        assert_eq!(discarded, 2);

        router.dispatch(Endpoint::Attachments, data(0, b"new"));
        router.dispatch(Endpoint::Attachments, Frame::End.encode());
        let mut assembler = ChunkAssembler::new(244);
        let payload = receive_transfer(&mut chunks, &mut assembler, false)
            .await
            .unwrap();
        assert_eq!(payload, b"new");
    }

    #[tokio::test]
    async fn test_resync_skips_leftovers_arriving_after_the_drain() {
        let router = Router::default();
        let (_, mut chunks) = router.register(Endpoint::Attachments);
        router.dispatch(Endpoint::Attachments, data(7, b"tail"));
        router.dispatch(Endpoint::Attachments, Frame::End.encode());
        router.dispatch(Endpoint::Attachments, Frame::Header { total_len: 4 }.encode());
        router.dispatch(Endpoint::Attachments, data(0, b"ABCD"));
        router.dispatch(Endpoint::Attachments, Frame::End.encode());

        let mut assembler = ChunkAssembler::new(244);
        let payload = receive_transfer(&mut chunks, &mut assembler, true)
            .await
            .unwrap();
        assert_eq!(payload, b"ABCD");
    }

    #[tokio::test]
    async fn test_oversized_chunk_fails_transfer() {
        let router = Router::default();
        let (_, mut chunks) = router.register(Endpoint::Attachments);
        router.dispatch(Endpoint::Attachments, data(0, &[0u8; 32]));

        let mut assembler = ChunkAssembler::new(16);
        let result = receive_transfer(&mut chunks, &mut assembler, false).await;
        assert!(matches!(result, Err(SyncError::MalformedTransfer { .. })));
    }
}
