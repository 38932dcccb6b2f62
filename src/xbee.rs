//! XBee request/response correlation engine.
//!
//! The radio side of the gateway is event driven: replies are not temporally
//! coupled to the requests that caused them, may never arrive at all, and
//! several logical requests can be in flight at once. This module turns that
//! into a single awaitable operation — send a command frame, get back its
//! matching response or a timeout/transport error — safe for any number of
//! concurrent callers.
//!
//! Each outgoing frame is keyed by its one-byte frame id in a pending table.
//! The read task matches decoded replies against the table; a per-request
//! timer rejects entries that never get one. Removal from the table is the
//! claim that decides which of the two settles a request, so a reply and a
//! timeout can never both win. Frames that match nothing, and asynchronous
//! codec or transport faults, are handed to the observer callback registered
//! at construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{ApiMode, XBeeApiCodec};
use crate::error::Error;
use crate::frames::{hex_encode, ApiFrame};
use crate::transport::{Transport, SUPPORTED_BAUD_RATES};
use crate::Result;

/// Default reply timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Events delivered to the observer callback: either an unsolicited frame or
/// an asynchronous fault, never both at once.
#[derive(Debug)]
pub enum XBeeEvent {
    /// A decoded frame that did not settle any pending request
    Frame(ApiFrame),
    /// A codec or transport fault not attributable to a single request
    Error(Error),
}

/// Observer callback type
pub type XBeeCallback = Box<dyn Fn(XBeeEvent) + Send + Sync>;

/// Options accepted by [`XBee::create`]
pub struct XBeeOptions {
    /// Serial device path
    pub port: String,
    /// Serial baud rate
    pub baud: u32,
    /// Radio API mode, 1 or 2
    pub api_mode: u8,
    /// Observer for unsolicited frames and asynchronous errors
    pub callback: Option<XBeeCallback>,
    /// Default reply timeout for [`XBee::transmit`]
    pub timeout: Duration,
}

impl XBeeOptions {
    /// Options for the given device with the customary defaults
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            api_mode: 2,
            callback: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the API mode
    pub fn with_api_mode(mut self, api_mode: u8) -> Self {
        self.api_mode = api_mode;
        self
    }

    /// Set the observer callback
    pub fn with_callback(mut self, callback: impl Fn(XBeeEvent) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Set the default reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One outstanding transmit awaiting its reply
struct PendingRequest {
    created_at: Instant,
    timeout: JoinHandle<()>,
    settle: oneshot::Sender<Result<ApiFrame>>,
}

struct PendingTable {
    by_id: HashMap<u8, PendingRequest>,
    next_id: u8,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            next_id: 1,
        }
    }

    /// Grant the next frame id not currently awaiting a reply.
    ///
    /// Rolls over 1..=255; id 0 means "no reply requested" on this radio
    /// protocol and is never granted.
    fn allocate_id(&mut self) -> Result<u8> {
        for _ in 0..=u8::MAX {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u8::MAX {
                1
            } else {
                self.next_id + 1
            };
            if candidate != 0 && !self.by_id.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::IdsExhausted)
    }
}

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The correlation engine. Owns the serial transport and the pending-request
/// table for its whole lifetime; callers only hold its public operations.
pub struct XBee {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<Mutex<PendingTable>>,
    open: Arc<AtomicBool>,
    api_mode: ApiMode,
    default_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl XBee {
    /// Validate `options`, open the transport, and return a ready engine.
    ///
    /// Each option is checked in turn and rejected with a descriptive error
    /// before anything is opened; an open failure propagates the device
    /// error and produces no engine.
    pub async fn create<T: Transport>(mut transport: T, mut options: XBeeOptions) -> Result<Self> {
        if options.port.trim().is_empty() {
            return Err(Error::InvalidArgument("Bad or missing arguments"));
        }
        if !SUPPORTED_BAUD_RATES.contains(&options.baud) {
            return Err(Error::InvalidArgument("Invalid baudRate"));
        }
        let api_mode = ApiMode::try_from(options.api_mode)?;
        let callback = options
            .callback
            .take()
            .ok_or(Error::InvalidArgument("Bad or missing callback"))?;

        let stream = transport.open(&options.port, options.baud).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let open = Arc::new(AtomicBool::new(true));

        let write_open = open.clone();
        let write_task = tokio::spawn(async move {
            while let Some(data) = writer_rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::warn!("serial write failed: {}", e);
                    break;
                }
            }
            write_open.store(false, Ordering::SeqCst);
        });

        let read_pending = pending.clone();
        let read_open = open.clone();
        let read_task = tokio::spawn(async move {
            let mut codec = XBeeApiCodec::new(api_mode);
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        callback(XBeeEvent::Error(Error::TransportClosed));
                        break;
                    }
                    Ok(n) => {
                        codec.push(&buf[..n]);
                        while let Some(decoded) = codec.decode() {
                            match decoded {
                                Ok(frame) => dispatch_frame(frame, &read_pending, &callback),
                                Err(e) => callback(XBeeEvent::Error(e)),
                            }
                        }
                    }
                    Err(e) => {
                        callback(XBeeEvent::Error(Error::Io(e)));
                        break;
                    }
                }
            }
            read_open.store(false, Ordering::SeqCst);
            reject_all(&read_pending, || Error::TransportClosed);
            tracing::debug!("serial read task finished");
        });

        Ok(Self {
            writer_tx,
            pending,
            open,
            api_mode,
            default_timeout: options.timeout,
            tasks: Mutex::new(vec![write_task, read_task]),
        })
    }

    /// Whether the transport is still usable
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a command frame and wait for its correlated reply with the
    /// default timeout
    pub async fn transmit(&self, frame: ApiFrame) -> Result<ApiFrame> {
        self.transmit_with_timeout(frame, self.default_timeout).await
    }

    /// Send a command frame and wait for its correlated reply.
    ///
    /// The frame id is assigned if the caller did not supply one; a supplied
    /// id that is still awaiting a reply is rejected outright. Exactly one
    /// of reply, timeout, or transport failure settles the call.
    pub async fn transmit_with_timeout(
        &self,
        mut frame: ApiFrame,
        timeout: Duration,
    ) -> Result<ApiFrame> {
        XBeeApiCodec::validate(&frame)?;
        if !self.is_open() {
            return Err(Error::TransportNotOpen);
        }

        let (settle_tx, settle_rx) = oneshot::channel();
        let (id, encoded) = {
            let mut table = lock(&self.pending);
            let id = match frame.id {
                Some(id) if table.by_id.contains_key(&id) => {
                    return Err(Error::DuplicateFrameId(id))
                }
                Some(id) => id,
                None => table.allocate_id()?,
            };
            frame.id = Some(id);
            let encoded = XBeeApiCodec::encode(&frame, self.api_mode)?;
            let timer = spawn_timeout(id, timeout, self.pending.clone());
            table.by_id.insert(
                id,
                PendingRequest {
                    created_at: Instant::now(),
                    timeout: timer,
                    settle: settle_tx,
                },
            );
            (id, encoded)
        };
        tracing::trace!(id, frame_type = frame.frame_type, "transmit");

        if self.writer_tx.send(encoded).await.is_err() {
            if let Some(entry) = lock(&self.pending).by_id.remove(&id) {
                entry.timeout.abort();
            }
            return Err(Error::TransportNotOpen);
        }

        match settle_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Adapt a JSON request message from the bus into a [`transmit`] call.
    ///
    /// The `type` and `id` fields may be numbers, decimal strings, or
    /// `0x`-prefixed hex strings; anything else is rejected before a frame
    /// is built.
    ///
    /// [`transmit`]: Self::transmit
    pub async fn transmit_mqtt_message(&self, message: &str) -> Result<ApiFrame> {
        let mut value: Value = serde_json::from_str(message)?;
        normalize_message(&mut value)?;
        let frame: ApiFrame = serde_json::from_value(value)?;
        if !XBeeApiCodec::supports(frame.frame_type) {
            return Err(Error::unsupported(format!("0x{:02X}", frame.frame_type)));
        }
        self.transmit(frame).await
    }

    /// The gateway radio's 64-bit address as a 16-digit hex string
    pub async fn local_address(&self) -> Result<String> {
        let high = self.at_command_data("SH").await?;
        let low = self.at_command_data("SL").await?;
        Ok(format!("{}{}", hex_encode(&high), hex_encode(&low)))
    }

    /// The gateway radio's node-identifier string
    pub async fn node_identifier(&self) -> Result<String> {
        let data = self.at_command_data("NI").await?;
        Ok(String::from_utf8_lossy(&data).trim().to_string())
    }

    async fn at_command_data(&self, command: &str) -> Result<Vec<u8>> {
        let reply = self.transmit(ApiFrame::at_command(command)).await?;
        let status = reply.get_u64("commandStatus").unwrap_or(0) as u8;
        if status != 0 {
            return Err(Error::AtCommandFailed {
                command: command.to_string(),
                status,
            });
        }
        Ok(reply.get_bytes("commandData").unwrap_or_default())
    }

    /// Shut the engine down: abort the IO tasks and reject every request
    /// still awaiting a reply. Idempotent; the engine cannot be reopened.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::info!("closing XBee engine");
        }
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for task in drained {
            task.abort();
        }
        reject_all(&self.pending, || Error::TransportClosed);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.pending).by_id.len()
    }
}

/// Settle the matching pending request, or forward the frame as unsolicited.
/// Removal from the table is the atomic claim: whoever removes the entry is
/// the only one allowed to settle it.
fn dispatch_frame(frame: ApiFrame, pending: &Arc<Mutex<PendingTable>>, callback: &XBeeCallback) {
    if let Some(id) = frame.id {
        let claimed = lock(pending).by_id.remove(&id);
        if let Some(entry) = claimed {
            entry.timeout.abort();
            tracing::trace!(
                id,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                "reply matched"
            );
            let _ = entry.settle.send(Ok(frame));
            return;
        }
    }
    callback(XBeeEvent::Frame(frame));
}

fn spawn_timeout(id: u8, timeout: Duration, pending: Arc<Mutex<PendingTable>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let expired = lock(&pending).by_id.remove(&id);
        if let Some(entry) = expired {
            tracing::debug!(
                id,
                waited_ms = entry.created_at.elapsed().as_millis() as u64,
                "request timed out"
            );
            let _ = entry.settle.send(Err(Error::Timeout));
        }
    })
}

fn reject_all(pending: &Arc<Mutex<PendingTable>>, make_error: impl Fn() -> Error) {
    let drained: Vec<PendingRequest> = {
        let mut table = lock(pending);
        table.by_id.drain().map(|(_, entry)| entry).collect()
    };
    for entry in drained {
        entry.timeout.abort();
        let _ = entry.settle.send(Err(make_error()));
    }
}

/// Normalize the `type` and `id` fields of an inbound request, each of which
/// may be a JSON number, a decimal string, or a `0x`-prefixed hex string.
fn normalize_message(value: &mut Value) -> Result<()> {
    let object = value.as_object_mut().ok_or(Error::InvalidFrame)?;
    if let Some(frame_type) = object.get_mut("type") {
        match numeric_field(frame_type) {
            Some(n) => *frame_type = Value::from(n),
            None => return Err(Error::unsupported(frame_type.to_string())),
        }
    }
    if let Some(id) = object.get_mut("id") {
        match numeric_field(id) {
            Some(n) => *id = Value::from(n),
            None => return Err(Error::InvalidFrame),
        }
    }
    Ok(())
}

fn numeric_field(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u8::from_str_radix(hex, 16).ok()
            } else {
                s.parse::<u8>().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameType;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    struct MockTransport {
        stream: Option<DuplexStream>,
        fail: Option<Error>,
    }

    impl MockTransport {
        fn pair() -> (Self, DuplexStream) {
            let (near, far) = duplex(4096);
            (
                Self {
                    stream: Some(near),
                    fail: None,
                },
                far,
            )
        }

        fn failing(error: Error) -> Self {
            Self {
                stream: None,
                fail: Some(error),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Stream = DuplexStream;

        async fn open(&mut self, _port: &str, _baud: u32) -> Result<DuplexStream> {
            if let Some(error) = self.fail.take() {
                return Err(error);
            }
            Ok(self.stream.take().expect("mock transport opened twice"))
        }
    }

    /// Frame data to mode-2 wire bytes
    fn wire(data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
        payload.extend_from_slice(data);
        let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
        payload.push(0xFF - (sum & 0xFF) as u8);

        let mut out = vec![0x7E];
        for b in payload {
            if matches!(b, 0x7E | 0x7D | 0x11 | 0x13) {
                out.push(0x7D);
                out.push(b ^ 0x20);
            } else {
                out.push(b);
            }
        }
        out
    }

    fn at_response(id: u8, command: &str, status: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x88, id];
        frame.extend_from_slice(command.as_bytes());
        frame.push(status);
        frame.extend_from_slice(data);
        wire(&frame)
    }

    async fn engine() -> (XBee, DuplexStream, mpsc::UnboundedReceiver<XBeeEvent>) {
        let (transport, far) = MockTransport::pair();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let options = XBeeOptions::new("/dev/mock", 9600).with_callback(move |event| {
            let _ = event_tx.send(event);
        });
        let xbee = XBee::create(transport, options).await.unwrap();
        (xbee, far, event_rx)
    }

    /// Answers every request with an AT response for the command it carried
    fn spawn_responder(mut far: DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut codec = XBeeApiCodec::new(ApiMode::Escaped);
            let mut buf = [0u8; 256];
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                codec.push(&buf[..n]);
                while let Some(Ok(request)) = codec.decode() {
                    let raw = request.get_bytes("data").unwrap_or_default();
                    if raw.len() < 3 {
                        continue;
                    }
                    let id = raw[0];
                    let command = String::from_utf8_lossy(&raw[1..3]).to_string();
                    let data: Vec<u8> = match command.as_str() {
                        "SH" => vec![0x00, 0x13, 0xA2, 0x00],
                        "SL" => vec![0x40, 0xB5, 0x2C, 0x78],
                        "NI" => b"GATEWAY 1".to_vec(),
                        _ => vec![7],
                    };
                    let reply = at_response(id, &command, 0, &data);
                    if far.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_create_rejects_empty_port() {
        let (transport, _far) = MockTransport::pair();
        let options = XBeeOptions::new("", 9600).with_callback(|_| {});
        let err = XBee::create(transport, options).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad or missing arguments");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_baud() {
        let (transport, _far) = MockTransport::pair();
        let options = XBeeOptions::new("/dev/mock", 9601).with_callback(|_| {});
        let err = XBee::create(transport, options).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid baudRate");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_api_mode() {
        let (transport, _far) = MockTransport::pair();
        let options = XBeeOptions::new("/dev/mock", 9600)
            .with_api_mode(3)
            .with_callback(|_| {});
        let err = XBee::create(transport, options).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid API mode");
    }

    #[tokio::test]
    async fn test_create_rejects_missing_callback() {
        let (transport, _far) = MockTransport::pair();
        let options = XBeeOptions::new("/dev/mock", 9600);
        let err = XBee::create(transport, options).await.unwrap_err();
        assert_eq!(err.to_string(), "Bad or missing callback");
    }

    #[tokio::test]
    async fn test_create_fails_when_port_cannot_open() {
        let transport = MockTransport::failing(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such device",
        )));
        let options = XBeeOptions::new("/dev/mock", 9600).with_callback(|_| {});
        let err = XBee::create(transport, options).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_transmit_rejects_unbuildable_frame_without_writing() {
        let (xbee, mut far, _events) = engine().await;

        let err = xbee
            .transmit(ApiFrame::new(FrameType::AtResponse))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFrame));

        let err = xbee
            .transmit(ApiFrame::new(FrameType::TxRequest))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFrame));

        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(20), far.read(&mut buf)).await;
        assert!(read.is_err(), "nothing should have been written");
    }

    #[tokio::test]
    async fn test_transmit_resolves_with_matching_reply() {
        let (xbee, far, _events) = engine().await;
        spawn_responder(far);

        let reply = xbee.transmit(ApiFrame::at_command("BD")).await.unwrap();
        assert_eq!(reply.kind(), FrameType::AtResponse);
        assert_eq!(reply.get_str("command"), Some("BD"));
        assert_eq!(reply.get_bytes("commandData"), Some(vec![7]));
        assert!(reply.id.is_some());
        assert_eq!(xbee.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transmit_times_out_and_late_reply_is_unsolicited() {
        let (xbee, mut far, mut events) = engine().await;

        let err = xbee
            .transmit_with_timeout(
                ApiFrame::at_command("BD").with_id(7),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "XBee not responding");
        assert_eq!(xbee.pending_count(), 0);

        // The reply shows up anyway: it must reach the observer, not settle
        // the already-rejected request.
        far.write_all(&at_response(7, "BD", 0, &[])).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            XBeeEvent::Frame(frame) => assert_eq!(frame.id, Some(7)),
            other => panic!("expected unsolicited frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_cancels_timeout() {
        let (xbee, far, _events) = engine().await;
        spawn_responder(far);

        let reply = xbee
            .transmit_with_timeout(ApiFrame::at_command("BD"), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(reply.get_str("command"), Some("BD"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(xbee.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_id_cannot_be_reused() {
        let (xbee, _far, _events) = engine().await;
        let xbee = Arc::new(xbee);

        let first = {
            let xbee = xbee.clone();
            tokio::spawn(async move {
                xbee.transmit_with_timeout(
                    ApiFrame::at_command("BD").with_id(1),
                    Duration::from_millis(500),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = xbee
            .transmit_with_timeout(
                ApiFrame::at_command("BD").with_id(1),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateFrameId(1)));

        let first = first.await.unwrap();
        assert!(matches!(first, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_id_allocation_skips_pending_ids() {
        let mut table = PendingTable::new();
        assert_eq!(table.allocate_id().unwrap(), 1);
        assert_eq!(table.allocate_id().unwrap(), 2);

        let (settle, _rx) = oneshot::channel();
        table.by_id.insert(
            3,
            PendingRequest {
                created_at: Instant::now(),
                timeout: tokio::spawn(async {}),
                settle,
            },
        );
        assert_eq!(table.allocate_id().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_id_allocation_wraps_around_skipping_zero() {
        let mut table = PendingTable::new();
        table.next_id = u8::MAX;
        assert_eq!(table.allocate_id().unwrap(), 255);
        assert_eq!(table.allocate_id().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_id_allocation_exhausted() {
        let mut table = PendingTable::new();
        for id in 1..=u8::MAX {
            let (settle, _rx) = oneshot::channel();
            table.by_id.insert(
                id,
                PendingRequest {
                    created_at: Instant::now(),
                    timeout: tokio::spawn(async {}),
                    settle,
                },
            );
        }
        assert!(matches!(table.allocate_id(), Err(Error::IdsExhausted)));
    }

    #[tokio::test]
    async fn test_transmit_mqtt_message_accepts_equivalent_spellings() {
        let (xbee, far, _events) = engine().await;
        spawn_responder(far);

        let messages = [
            r#"{"type":9, "id":1, "command":"BD", "commandParameter":[7]}"#,
            r#"{"type":"0x09", "id":1, "command":"BD", "commandParameter":[7]}"#,
            r#"{"type":9, "id":"0x01", "command":"BD", "commandParameter":[7]}"#,
            r#"{"type":9, "id":1, "command":"BD"}"#,
        ];
        for message in messages {
            let reply = xbee.transmit_mqtt_message(message).await.unwrap();
            assert_eq!(reply.get_str("command"), Some("BD"), "message: {}", message);
            assert_eq!(reply.id, Some(1), "message: {}", message);
        }
    }

    #[tokio::test]
    async fn test_transmit_mqtt_message_rejects_bad_json() {
        let (xbee, _far, _events) = engine().await;
        let err = xbee.transmit_mqtt_message("this-is-not-json").await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().starts_with("Parse error: "));
    }

    #[tokio::test]
    async fn test_transmit_mqtt_message_rejects_unbuildable_type() {
        let (xbee, _far, _events) = engine().await;
        let err = xbee
            .transmit_mqtt_message(r#"{"type": "invalid"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFrameType(_)));
        assert!(err.to_string().contains("does not implement building"));

        // A numeric type the codec has no build rule for is rejected the
        // same way.
        let err = xbee
            .transmit_mqtt_message(r#"{"type": 136, "command": "BD"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFrameType(_)));
    }

    #[tokio::test]
    async fn test_transport_close_rejects_pending_and_further_calls() {
        let (xbee, far, _events) = engine().await;
        let xbee = Arc::new(xbee);

        let in_flight = {
            let xbee = xbee.clone();
            tokio::spawn(async move {
                xbee.transmit_with_timeout(
                    ApiFrame::at_command("BD").with_id(1),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(far);
        let outcome = in_flight.await.unwrap();
        assert!(matches!(outcome, Err(Error::TransportClosed)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!xbee.is_open());
        let err = xbee.transmit(ApiFrame::at_command("BD")).await.unwrap_err();
        assert_eq!(err.to_string(), "Port is not open");
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let (xbee, _far, _events) = engine().await;
        let xbee = Arc::new(xbee);

        let in_flight = {
            let xbee = xbee.clone();
            tokio::spawn(async move {
                xbee.transmit_with_timeout(
                    ApiFrame::at_command("BD").with_id(1),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        xbee.close();
        let outcome = in_flight.await.unwrap();
        assert!(matches!(outcome, Err(Error::TransportClosed)));
        assert!(!xbee.is_open());
    }

    #[tokio::test]
    async fn test_unsolicited_frame_reaches_observer() {
        let (_xbee, mut far, mut events) = engine().await;

        let data = [
            0x90, 0x00, 0x13, 0xA2, 0x00, 0x40, 0xB5, 0x2C, 0x78, 0xFF, 0xFE, 0x01, b'h', b'i',
        ];
        far.write_all(&wire(&data)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            XBeeEvent::Frame(frame) => {
                assert_eq!(frame.kind(), FrameType::RxPacket);
                assert_eq!(frame.remote64(), Some("0013a20040b52c78"));
            }
            other => panic!("expected frame event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_error_reaches_observer() {
        let (_xbee, mut far, mut events) = engine().await;

        // Valid framing, corrupted checksum.
        far.write_all(&[0x7E, 0x00, 0x06, 0x88, 0x01, 0x42, 0x44, 0x00, 0x03, 0x00])
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            XBeeEvent::Error(Error::Decode(message)) => {
                assert!(message.contains("checksum"));
            }
            other => panic!("expected decode error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_address() {
        let (xbee, far, _events) = engine().await;
        spawn_responder(far);
        assert_eq!(xbee.local_address().await.unwrap(), "0013a20040b52c78");
    }

    #[tokio::test]
    async fn test_node_identifier() {
        let (xbee, far, _events) = engine().await;
        spawn_responder(far);
        assert_eq!(xbee.node_identifier().await.unwrap(), "GATEWAY 1");
    }

    #[tokio::test]
    async fn test_at_command_failure_status() {
        let (xbee, mut far, _events) = engine().await;

        // Responder that fails every command with status 3.
        tokio::spawn(async move {
            let mut codec = XBeeApiCodec::new(ApiMode::Escaped);
            let mut buf = [0u8; 256];
            loop {
                let n = match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                codec.push(&buf[..n]);
                while let Some(Ok(request)) = codec.decode() {
                    let raw = request.get_bytes("data").unwrap_or_default();
                    if raw.len() < 3 {
                        continue;
                    }
                    let command = String::from_utf8_lossy(&raw[1..3]).to_string();
                    let reply = at_response(raw[0], &command, 3, &[]);
                    if far.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        });

        let err = xbee.local_address().await.unwrap_err();
        assert!(matches!(
            err,
            Error::AtCommandFailed { status: 3, .. }
        ));
    }

    #[test]
    fn test_numeric_field_spellings() {
        assert_eq!(numeric_field(&json!(9)), Some(9));
        assert_eq!(numeric_field(&json!("9")), Some(9));
        assert_eq!(numeric_field(&json!("0x09")), Some(9));
        assert_eq!(numeric_field(&json!("0X0A")), Some(10));
        assert_eq!(numeric_field(&json!("invalid")), None);
        assert_eq!(numeric_field(&json!(300)), None);
        assert_eq!(numeric_field(&json!([9])), None);
    }

    #[test]
    fn test_normalize_message_rewrites_hex_fields() {
        let mut value = json!({"type": "0x09", "id": "0x01", "command": "BD"});
        normalize_message(&mut value).unwrap();
        assert_eq!(value["type"], json!(9));
        assert_eq!(value["id"], json!(1));
        assert_eq!(value["command"], json!("BD"));
    }

    #[test]
    fn test_normalize_message_rejects_non_object() {
        let mut value = json!([1, 2, 3]);
        assert!(matches!(
            normalize_message(&mut value),
            Err(Error::InvalidFrame)
        ));
    }
}
