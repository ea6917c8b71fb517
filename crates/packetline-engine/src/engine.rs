use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use packetline_codec::{CodecError, Packet, PacketCodec, PacketReader, PacketWriter};
use packetline_transport::{Transport, TransportError};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventHub, LoopKind};
use crate::queue::{OutboundQueue, PacketQueue};

static READ_THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);
static WRITE_THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle of a [`PacketEngine`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Stopped => 3,
        }
    }
}

type LoopResult = std::result::Result<(), Arc<EngineError>>;

/// State shared between the owner and both worker threads.
struct Shared {
    transport: Arc<dyn Transport>,
    codec: PacketCodec,
    config: EngineConfig,
    inbound: PacketQueue,
    outbound: Arc<PacketQueue>,
    running: AtomicBool,
    read_enabled: AtomicBool,
    write_enabled: AtomicBool,
    state: AtomicU8,
    reader: Mutex<PacketReader>,
    writer: Mutex<PacketWriter>,
    packets_read: AtomicU64,
    packets_written: AtomicU64,
    events: EventHub,
}

impl Shared {
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn set_enabled(&self, enabled: bool) {
        self.read_enabled.store(enabled, Ordering::SeqCst);
        self.write_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Decode up to `max` packets into the inbound queue.
    ///
    /// Packets decoded before a failure are still queued.
    fn read_next_packets(&self, max: usize) -> Result<usize> {
        let mut decoded = Vec::new();
        let mut failure = None;
        {
            let mut reader = lock(&self.reader);
            reader.fill(self.transport.as_ref())?;
            while decoded.len() < max && reader.has_header() {
                match reader.next_packet(&self.codec) {
                    Ok(Some(packet)) => decoded.push(packet),
                    Ok(None) => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        let count = decoded.len();
        if count > 0 {
            self.inbound.extend(decoded);
            self.packets_read.fetch_add(count as u64, Ordering::Relaxed);
            trace!(count, "decoded packets");
            self.events.emit(EngineEvent::DataAvailable { count });
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(count),
        }
    }

    /// Write up to `max` queued packets.
    ///
    /// On failure the packet that failed is dropped and the rest of the batch
    /// goes back to the front of the queue.
    fn process_send_queue(&self, max: usize) -> Result<usize> {
        let mut writer = lock(&self.writer);
        let batch = self.outbound.pop_batch(max);
        if batch.is_empty() {
            return Ok(0);
        }

        let attempted = batch.len();
        let mut written = 0;
        let mut remaining = batch.into_iter();
        while let Some(packet) = remaining.next() {
            if let Err(source) =
                writer.write_packet(self.transport.as_ref(), &self.codec, packet.as_ref())
            {
                self.outbound.push_front_batch(remaining.collect());
                self.packets_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                return Err(EngineError::Send {
                    attempted,
                    written,
                    packet: packet.type_name(),
                    source,
                });
            }
            written += 1;
        }

        self.packets_written
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    fn send_immediately(&self, packet: &dyn Packet) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_packet(self.transport.as_ref(), &self.codec, packet)?;
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn run_loop(&self, kind: LoopKind) -> LoopResult {
        debug!(%kind, transport = self.transport.name(), "loop started");
        let result = match kind {
            LoopKind::Read => self.read_loop(),
            LoopKind::Write => self.write_loop(),
        };
        debug!(%kind, failed = result.is_err(), "loop exited");
        self.events.emit(EngineEvent::LoopExited {
            kind,
            failed: result.is_err(),
        });
        result
    }

    fn read_loop(&self) -> LoopResult {
        while self.running.load(Ordering::SeqCst) {
            while self.running.load(Ordering::SeqCst) && self.read_enabled.load(Ordering::SeqCst) {
                // Connection state can change under us at any time.
                if !self.transport.is_connected() {
                    break;
                }

                match self.read_next_packets(self.config.max_reads_per_poll) {
                    Ok(0) => thread::sleep(self.config.idle_sleep),
                    Ok(_) => {}
                    Err(EngineError::Codec(CodecError::Transport(err))) if err.is_state_error() => {
                        trace!(error = %err, "transport went away mid-read");
                        break;
                    }
                    Err(err @ EngineError::Codec(CodecError::Transport(TransportError::Closed))) => {
                        // Orderly close, not a fault: strict mode does not fail on it.
                        info!(transport = self.transport.name(), "peer closed the connection");
                        lock(&self.reader).clear();
                        self.events.emit(EngineEvent::ConnectionFault {
                            error: Arc::new(err),
                        });
                        break;
                    }
                    Err(err) if err.is_recoverable() => {
                        warn!(error = %err, "dropped undecodable packet");
                        let err = Arc::new(err);
                        self.events.emit(EngineEvent::ReadFailed {
                            error: Arc::clone(&err),
                        });
                        if self.config.strict {
                            return Err(err);
                        }
                    }
                    Err(err) => {
                        let err = self.connection_fault(err);
                        if self.config.strict {
                            return Err(err);
                        }
                        break;
                    }
                }
            }

            if self.running.load(Ordering::SeqCst) {
                thread::sleep(self.config.paused_sleep);
            }
        }
        Ok(())
    }

    fn write_loop(&self) -> LoopResult {
        while self.running.load(Ordering::SeqCst) {
            while self.running.load(Ordering::SeqCst) && self.write_enabled.load(Ordering::SeqCst)
            {
                if !self.transport.is_connected() {
                    break;
                }

                match self.process_send_queue(self.config.write_batch_size) {
                    Ok(0) => thread::sleep(self.config.idle_sleep),
                    Ok(_) => {}
                    Err(err) if err.is_recoverable() => {
                        warn!(error = %err, "outbound batch failed");
                        let err = Arc::new(err);
                        self.events.emit(EngineEvent::WriteFailed {
                            error: Arc::clone(&err),
                        });
                        if self.config.strict {
                            return Err(err);
                        }
                    }
                    Err(err)
                        if err
                            .transport_error()
                            .is_some_and(TransportError::is_state_error) =>
                    {
                        trace!(error = %err, "transport went away mid-write");
                        break;
                    }
                    Err(err) => {
                        // The peer may hold a partial frame; nothing after it can be trusted.
                        let err = self.connection_fault(err);
                        if self.config.strict {
                            return Err(err);
                        }
                        break;
                    }
                }
            }

            if self.running.load(Ordering::SeqCst) {
                thread::sleep(self.config.paused_sleep);
            }
        }
        Ok(())
    }

    /// The stream lost frame alignment: drop buffered bytes and disconnect.
    fn connection_fault(&self, error: EngineError) -> Arc<EngineError> {
        self.abort_connection(&error);
        let error = Arc::new(error);
        self.events.emit(EngineEvent::ConnectionFault {
            error: Arc::clone(&error),
        });
        error
    }

    fn abort_connection(&self, error: &EngineError) {
        warn!(
            transport = self.transport.name(),
            error = %error,
            "connection fault, discarding buffered input"
        );
        lock(&self.reader).clear();
        if self.transport.is_connected() {
            if let Err(err) = self.transport.disconnect() {
                debug!(error = %err, "disconnect after fault failed");
            }
        }
    }

    /// Manual writes: a transport failure mid-frame still disconnects, and the
    /// error goes back to the caller instead of the event channel.
    fn check_write(&self, result: Result<usize>) -> Result<usize> {
        if let Err(err) = &result {
            let fatal = err
                .transport_error()
                .is_some_and(|transport| !transport.is_state_error());
            if fatal {
                self.abort_connection(err);
            }
        }
        result
    }
}

/// Two-thread packet pump between a transport and a pair of queues.
///
/// ```text
/// transport ──read loop──▶ inbound queue ──process_inbound_queue──▶ dispatcher
/// transport ◀─write loop── outbound queue ◀──enqueue_outbound── any thread
/// ```
///
/// The worker threads are spawned by [`start`](Self::start) and joined by
/// [`stop`](Self::stop); [`pause`](Self::pause) only flips flags. A stopped
/// engine cannot be started again. Dropping a running engine stops it.
pub struct PacketEngine {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    threads: Mutex<Vec<(LoopKind, JoinHandle<LoopResult>)>>,
}

impl PacketEngine {
    pub fn new<T: Transport + 'static>(transport: T, codec: PacketCodec) -> Self {
        Self::with_config(transport, codec, EngineConfig::default())
    }

    pub fn with_config<T: Transport + 'static>(
        transport: T,
        codec: PacketCodec,
        config: EngineConfig,
    ) -> Self {
        let events = EventHub::new(config.event_capacity);
        let shared = Shared {
            transport: Arc::new(transport),
            codec,
            config,
            inbound: PacketQueue::new(),
            outbound: Arc::new(PacketQueue::new()),
            running: AtomicBool::new(false),
            read_enabled: AtomicBool::new(false),
            write_enabled: AtomicBool::new(false),
            state: AtomicU8::new(EngineState::Created.as_u8()),
            reader: Mutex::new(PacketReader::new()),
            writer: Mutex::new(PacketWriter::new()),
            packets_read: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            events,
        };
        Self {
            shared: Arc::new(shared),
            dispatcher: Dispatcher::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the read and write loops.
    pub fn start(&self) -> Result<()> {
        let mut threads = lock(&self.threads);
        match self.shared.state() {
            EngineState::Created => {}
            EngineState::Stopped => return Err(EngineError::Terminated),
            EngineState::Running | EngineState::Paused => return Err(EngineError::AlreadyStarted),
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_enabled(true);

        let read = match self.spawn(LoopKind::Read) {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_enabled(false);
                return Err(err);
            }
        };
        let write = match self.spawn(LoopKind::Write) {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_enabled(false);
                let _ = read.join();
                return Err(err);
            }
        };

        threads.push((LoopKind::Read, read));
        threads.push((LoopKind::Write, write));
        self.shared.set_state(EngineState::Running);
        info!(transport = self.shared.transport.name(), "packet engine started");
        Ok(())
    }

    /// Idle both loops without stopping their threads.
    pub fn pause(&self) -> Result<()> {
        let _threads = lock(&self.threads);
        match self.shared.state() {
            EngineState::Running => {
                self.shared.set_enabled(false);
                self.shared.set_state(EngineState::Paused);
                debug!("packet engine paused");
                Ok(())
            }
            EngineState::Paused => Ok(()),
            EngineState::Created | EngineState::Stopped => Err(EngineError::NotRunning),
        }
    }

    /// Re-enable both loops after [`pause`](Self::pause).
    pub fn resume(&self) -> Result<()> {
        let _threads = lock(&self.threads);
        match self.shared.state() {
            EngineState::Paused => {
                self.shared.set_enabled(true);
                self.shared.set_state(EngineState::Running);
                debug!("packet engine resumed");
                Ok(())
            }
            EngineState::Running => Ok(()),
            EngineState::Created | EngineState::Stopped => Err(EngineError::NotRunning),
        }
    }

    /// Stop and join both loops. Terminal.
    ///
    /// Returns the first error a loop terminated with. Pending ack requests are
    /// not cancelled; cancel them first if their handles are still held.
    pub fn stop(&self) -> Result<()> {
        let mut threads = lock(&self.threads);
        match self.shared.state() {
            EngineState::Stopped => return Ok(()),
            EngineState::Created => {
                self.shared.set_state(EngineState::Stopped);
                return Ok(());
            }
            EngineState::Running | EngineState::Paused => {}
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_enabled(false);
        self.shared.set_state(EngineState::Stopped);

        let mut first_error = None;
        for (kind, handle) in threads.drain(..) {
            let outcome = match handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(EngineError::LoopFailed { kind, source }),
                Err(_) => Some(EngineError::LoopPanicked { kind }),
            };
            if first_error.is_none() {
                first_error = outcome;
            }
        }

        info!(
            read = self.packets_read(),
            written = self.packets_written(),
            "packet engine stopped"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Whether the worker threads are alive (running or paused).
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Toggle only the read loop.
    pub fn set_read_enabled(&self, enabled: bool) {
        self.shared.read_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Toggle only the write loop.
    pub fn set_write_enabled(&self, enabled: bool) {
        self.shared.write_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_read_enabled(&self) -> bool {
        self.shared.read_enabled.load(Ordering::SeqCst)
    }

    pub fn is_write_enabled(&self) -> bool {
        self.shared.write_enabled.load(Ordering::SeqCst)
    }

    /// Packets decoded off the transport so far.
    pub fn packets_read(&self) -> u64 {
        self.shared.packets_read.load(Ordering::Relaxed)
    }

    /// Packets written to the transport so far.
    pub fn packets_written(&self) -> u64 {
        self.shared.packets_written.load(Ordering::Relaxed)
    }

    /// Queue a packet for the write loop.
    pub fn enqueue_outbound<P: Packet>(&self, packet: P) {
        self.shared.outbound.push(Box::new(packet));
    }

    pub fn enqueue_boxed(&self, packet: Box<dyn Packet>) {
        self.shared.outbound.push(packet);
    }

    /// Cloneable handle to the outbound queue.
    pub fn outbound(&self) -> OutboundQueue {
        OutboundQueue::new(Arc::clone(&self.shared.outbound))
    }

    pub fn outbound_len(&self) -> usize {
        self.shared.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.shared.inbound.len()
    }

    /// Encode and write `packet` now, bypassing the outbound queue.
    ///
    /// Serialized with the write loop, so frames never interleave.
    pub fn send_immediately(&self, packet: &dyn Packet) -> Result<()> {
        let result = self.shared.send_immediately(packet).map(|()| 1);
        self.shared.check_write(result).map(|_| ())
    }

    /// Decode up to `max` packets on the calling thread.
    pub fn read_next_packets(&self, max: usize) -> Result<usize> {
        self.shared.read_next_packets(max)
    }

    /// Write up to `max` queued packets on the calling thread.
    ///
    /// A transport failure disconnects the transport, since the peer may have
    /// received part of a frame.
    pub fn process_send_queue(&self, max: usize) -> Result<usize> {
        let result = self.shared.process_send_queue(max);
        self.shared.check_write(result)
    }

    /// Move up to `max` inbound packets into `out` without dispatching them.
    pub fn drain_inbound(&self, max: usize, out: &mut Vec<Box<dyn Packet>>) -> usize {
        let batch = self.shared.inbound.pop_batch(max);
        let moved = batch.len();
        out.extend(batch);
        moved
    }

    /// Deliver up to `max` inbound packets through the dispatcher, in arrival order.
    ///
    /// Call from a single consumer thread. If a delivery fails, the packets
    /// after it stay queued for the next call.
    pub fn process_inbound_queue(&self, max: usize) -> Result<usize> {
        let batch = self.shared.inbound.pop_batch(max);
        let count = batch.len();

        let mut index = 0;
        let mut remaining = batch.into_iter();
        while let Some(packet) = remaining.next() {
            index += 1;
            if let Err(source) = self.dispatcher.deliver(packet.as_ref()) {
                self.shared.inbound.push_front_batch(remaining.collect());
                return Err(EngineError::Dispatch {
                    index,
                    count,
                    source,
                });
            }
        }
        Ok(count)
    }

    /// Listener and handler registrations for inbound packets.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Receive engine events on a channel.
    ///
    /// The channel holds [`EngineConfig::event_capacity`] events; while it is
    /// full, new events are dropped for this receiver only. Drop the receiver
    /// to unsubscribe.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Run `callback` for every event, on the thread that produced it.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_event(Arc::new(callback));
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.shared.codec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn spawn(&self, kind: LoopKind) -> Result<JoinHandle<LoopResult>> {
        let number = match kind {
            LoopKind::Read => READ_THREAD_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            LoopKind::Write => WRITE_THREAD_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let name = format!("{}-{kind}-{number}", self.shared.config.thread_name);
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(name)
            .spawn(move || shared.run_loop(kind))
            .map_err(|source| EngineError::Spawn { kind, source })
    }
}

impl Drop for PacketEngine {
    fn drop(&mut self) {
        if matches!(
            self.shared.state(),
            EngineState::Running | EngineState::Paused
        ) {
            if let Err(err) = self.stop() {
                warn!(error = %err, "packet engine stopped with error");
            }
        }
    }
}

impl fmt::Debug for PacketEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketEngine")
            .field("state", &self.state())
            .field("transport", &self.shared.transport.name())
            .field("inbound", &self.inbound_len())
            .field("outbound", &self.outbound_len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use bytes::{BufMut, BytesMut};
    use packetline_codec::{
        CodecConfig, PacketRegistry, PayloadReader, PayloadWriter, HEADER_SIZE,
    };
    use packetline_transport::LoopbackTransport;

    use super::*;
    use crate::dispatch::Priority;

    #[derive(Debug, Default, PartialEq)]
    struct Seq(u32);

    impl Packet for Seq {
        fn payload_size(&self) -> usize {
            4
        }
        fn write_payload(&self, out: &mut PayloadWriter<'_>) -> packetline_codec::Result<()> {
            out.put_u32(self.0);
            Ok(())
        }
        fn read_payload(&mut self, input: &mut PayloadReader) -> packetline_codec::Result<()> {
            self.0 = input.get_u32()?;
            Ok(())
        }
    }

    /// Fails to encode.
    #[derive(Debug, Default)]
    struct Poison;

    impl Packet for Poison {
        fn payload_size(&self) -> usize {
            1
        }
        fn write_payload(&self, _out: &mut PayloadWriter<'_>) -> packetline_codec::Result<()> {
            Err(CodecError::Payload("poisoned".into()))
        }
        fn read_payload(&mut self, _input: &mut PayloadReader) -> packetline_codec::Result<()> {
            Ok(())
        }
    }

    fn codec_with(config: CodecConfig) -> PacketCodec {
        let registry = PacketRegistry::builder()
            .register::<Seq>(1)
            .unwrap()
            .register::<Poison>(2)
            .unwrap()
            .build();
        PacketCodec::with_config(registry, config)
    }

    fn codec() -> PacketCodec {
        codec_with(CodecConfig::default())
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            paused_sleep: Duration::from_millis(5),
            thread_name: "engine-test".to_string(),
            ..EngineConfig::default()
        }
    }

    fn engine_pair(config: EngineConfig) -> (PacketEngine, LoopbackTransport) {
        let (near, far) = LoopbackTransport::pair();
        (PacketEngine::with_config(near, codec(), config), far)
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    /// Loopback end whose first write stops after `cut` bytes and times out.
    struct TornWrite {
        inner: LoopbackTransport,
        cut: Mutex<Option<usize>>,
    }

    impl TornWrite {
        fn pair(cut: usize) -> (Self, LoopbackTransport) {
            let (near, far) = LoopbackTransport::pair();
            let torn = Self {
                inner: near,
                cut: Mutex::new(Some(cut)),
            };
            (torn, far)
        }
    }

    impl Transport for TornWrite {
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        fn bytes_available(&self) -> packetline_transport::Result<usize> {
            self.inner.bytes_available()
        }
        fn read_exact(&self, n: usize) -> packetline_transport::Result<bytes::Bytes> {
            self.inner.read_exact(n)
        }
        fn write_bytes(&self, data: &[u8]) -> packetline_transport::Result<()> {
            match self.cut.lock().unwrap().take() {
                Some(cut) => {
                    self.inner.write_bytes(&data[..cut])?;
                    Err(TransportError::Io(std::io::ErrorKind::TimedOut.into()))
                }
                None => self.inner.write_bytes(data),
            }
        }
        fn connect(&self) -> packetline_transport::Result<()> {
            self.inner.connect()
        }
        fn disconnect(&self) -> packetline_transport::Result<()> {
            self.inner.disconnect()
        }
    }

    fn raw_bytes(far: &LoopbackTransport) -> Vec<u8> {
        let available = far.bytes_available().unwrap();
        far.read_exact(available).unwrap().to_vec()
    }

    fn frame(value: u32) -> bytes::Bytes {
        codec().encode_to_bytes(&Seq(value)).unwrap()
    }

    fn decode_all(far: &LoopbackTransport) -> Vec<u32> {
        let available = far.bytes_available().unwrap();
        let mut buf = BytesMut::from(far.read_exact(available).unwrap().as_ref());
        let codec = codec();
        let mut values = Vec::new();
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            values.push(packet.downcast_ref::<Seq>().unwrap().0);
        }
        values
    }

    #[test]
    fn lifecycle_is_one_shot() {
        let (engine, _far) = engine_pair(fast_config());
        assert_eq!(engine.state(), EngineState::Created);
        assert!(matches!(engine.pause(), Err(EngineError::NotRunning)));
        assert!(matches!(engine.resume(), Err(EngineError::NotRunning)));

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));

        engine.pause().unwrap();
        assert_eq!(engine.state(), EngineState::Paused);
        assert!(!engine.is_read_enabled());
        assert!(!engine.is_write_enabled());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        engine.resume().unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::Terminated)));
        assert!(matches!(engine.pause(), Err(EngineError::NotRunning)));
        engine.stop().unwrap();
    }

    #[test]
    fn stopping_a_created_engine_is_terminal() {
        let (engine, _far) = engine_pair(fast_config());
        engine.stop().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::Terminated)));
    }

    #[test]
    fn read_loop_queues_packets_in_wire_order() {
        let (engine, far) = engine_pair(fast_config());
        let mut events = engine.subscribe();
        engine.start().unwrap();

        for value in 0..25 {
            far.write_bytes(&frame(value)).unwrap();
        }
        assert!(wait_until(|| engine.inbound_len() == 25));
        assert_eq!(engine.packets_read(), 25);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .dispatcher()
            .register_handler_for::<Seq, _>(Priority::Normal, move |seq| {
                sink.lock().unwrap().push(seq.0);
                Ok(true)
            });

        assert_eq!(engine.process_inbound_queue(10).unwrap(), 10);
        assert_eq!(engine.process_inbound_queue(100).unwrap(), 15);
        assert_eq!(*seen.lock().unwrap(), (0..25).collect::<Vec<_>>());

        engine.stop().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::DataAvailable { .. }
        ));
    }

    #[test]
    fn concurrent_enqueue_writes_each_packet_once() {
        let (engine, far) = engine_pair(fast_config());
        engine.start().unwrap();

        let producers: Vec<_> = (0..4u32)
            .map(|t| {
                let outbound = engine.outbound();
                thread::spawn(move || {
                    for n in 0..50 {
                        outbound.send(Seq(t * 1000 + n));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(wait_until(|| engine.packets_written() == 200));
        engine.stop().unwrap();

        let mut values = decode_all(&far);
        assert_eq!(values.len(), 200);
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 200);
    }

    #[test]
    fn single_producer_order_is_preserved() {
        let (engine, far) = engine_pair(fast_config());
        engine.start().unwrap();
        for value in 0..40 {
            engine.enqueue_outbound(Seq(value));
        }
        assert!(wait_until(|| engine.packets_written() == 40));
        engine.stop().unwrap();
        assert_eq!(decode_all(&far), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn paused_engine_neither_reads_nor_writes() {
        let (engine, far) = engine_pair(fast_config());
        engine.start().unwrap();
        engine.pause().unwrap();

        engine.enqueue_outbound(Seq(1));
        far.write_bytes(&frame(2)).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.outbound_len(), 1);
        assert_eq!(engine.inbound_len(), 0);
        assert_eq!(far.bytes_available().unwrap(), 0);

        engine.resume().unwrap();
        assert!(wait_until(|| engine.packets_written() == 1));
        assert!(wait_until(|| engine.inbound_len() == 1));
        engine.stop().unwrap();
    }

    #[test]
    fn write_toggle_is_independent() {
        let (engine, far) = engine_pair(fast_config());
        engine.start().unwrap();
        engine.set_write_enabled(false);
        engine.enqueue_outbound(Seq(5));
        far.write_bytes(&frame(6)).unwrap();

        assert!(wait_until(|| engine.inbound_len() == 1));
        assert_eq!(engine.outbound_len(), 1);

        engine.set_write_enabled(true);
        assert!(wait_until(|| engine.outbound_len() == 0));
        engine.stop().unwrap();
    }

    #[test]
    fn unknown_packet_is_reported_and_skipped() {
        let (engine, far) = engine_pair(fast_config());
        let mut events = engine.subscribe();
        engine.start().unwrap();

        let mut wire = BytesMut::new();
        wire.put_u16(77);
        wire.put_u16(2);
        wire.put_slice(&[0, 0]);
        wire.extend_from_slice(&frame(9));
        far.write_bytes(&wire).unwrap();

        assert!(wait_until(|| engine.inbound_len() == 1));
        engine.stop().unwrap();

        let mut read_failures = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ReadFailed { error } = event {
                assert!(matches!(
                    error.as_ref(),
                    EngineError::Codec(CodecError::UnknownType { id: 77, .. })
                ));
                read_failures += 1;
            }
        }
        assert_eq!(read_failures, 1);
        assert!(engine.transport().is_connected());
    }

    #[test]
    fn oversized_frame_is_a_connection_fault() {
        let (near, far) = LoopbackTransport::pair();
        let codec = codec_with(CodecConfig {
            max_payload_size: 8,
            ..CodecConfig::default()
        });
        let engine = PacketEngine::with_config(near, codec, fast_config());
        let faults = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&faults);
        engine.on_event(move |event| {
            if matches!(event, EngineEvent::ConnectionFault { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.start().unwrap();

        let mut wire = BytesMut::new();
        wire.put_u16(1);
        wire.put_u16(500);
        far.write_bytes(&wire).unwrap();

        assert!(wait_until(|| faults.load(Ordering::SeqCst) == 1));
        assert!(!engine.transport().is_connected());
        // Loops stay alive and idle until the owner reconnects.
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().unwrap();
    }

    #[test]
    fn strict_mode_terminates_read_loop() {
        let config = EngineConfig {
            strict: true,
            ..fast_config()
        };
        let (engine, far) = engine_pair(config);
        let exited = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exited);
        engine.on_event(move |event| {
            if matches!(
                event,
                EngineEvent::LoopExited {
                    kind: LoopKind::Read,
                    failed: true
                }
            ) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.start().unwrap();

        let mut wire = BytesMut::new();
        wire.put_u16(55);
        wire.put_u16(0);
        far.write_bytes(&wire).unwrap();

        assert!(wait_until(|| exited.load(Ordering::SeqCst) == 1));
        let err = engine.stop().unwrap_err();
        assert!(matches!(
            err,
            EngineError::LoopFailed {
                kind: LoopKind::Read,
                ..
            }
        ));
    }

    #[test]
    fn strict_mode_terminates_write_loop() {
        let config = EngineConfig {
            strict: true,
            ..fast_config()
        };
        let (engine, far) = engine_pair(config);
        let exited = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exited);
        engine.on_event(move |event| {
            if matches!(
                event,
                EngineEvent::LoopExited {
                    kind: LoopKind::Write,
                    failed: true
                }
            ) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.enqueue_outbound(Poison);
        engine.enqueue_outbound(Seq(2));
        engine.start().unwrap();

        assert!(wait_until(|| exited.load(Ordering::SeqCst) == 1));
        // The loop is gone, so the packet behind the poisoned one stays queued.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.outbound_len(), 1);
        assert_eq!(far.bytes_available().unwrap(), 0);

        let err = engine.stop().unwrap_err();
        match err {
            EngineError::LoopFailed {
                kind: LoopKind::Write,
                source,
            } => assert!(matches!(
                source.as_ref(),
                EngineError::Send {
                    written: 0,
                    source: CodecError::Payload(_),
                    ..
                }
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn torn_write_is_a_connection_fault() {
        let (torn, far) = TornWrite::pair(3);
        let engine = PacketEngine::with_config(torn, codec(), fast_config());
        let mut events = engine.subscribe();
        engine.enqueue_outbound(Seq(1));
        engine.enqueue_outbound(Seq(2));
        engine.start().unwrap();

        assert!(wait_until(|| !engine.transport().is_connected()));
        thread::sleep(Duration::from_millis(20));
        // Nothing is written after the partial frame.
        assert_eq!(raw_bytes(&far), frame(1)[..3].to_vec());
        assert_eq!(engine.outbound_len(), 1);
        assert_eq!(engine.packets_written(), 0);
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().unwrap();

        let mut faults = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::ConnectionFault { error } => {
                    assert!(!error.is_recoverable());
                    assert!(matches!(
                        error.transport_error(),
                        Some(TransportError::Io(_))
                    ));
                    faults += 1;
                }
                EngineEvent::WriteFailed { .. } => panic!("torn write reported as recoverable"),
                _ => {}
            }
        }
        assert_eq!(faults, 1);
    }

    #[test]
    fn torn_write_in_strict_mode_fails_write_loop() {
        let (torn, _far) = TornWrite::pair(2);
        let config = EngineConfig {
            strict: true,
            ..fast_config()
        };
        let engine = PacketEngine::with_config(torn, codec(), config);
        engine.enqueue_outbound(Seq(1));
        engine.start().unwrap();

        assert!(wait_until(|| !engine.transport().is_connected()));
        assert!(matches!(
            engine.stop().unwrap_err(),
            EngineError::LoopFailed {
                kind: LoopKind::Write,
                ..
            }
        ));
    }

    #[test]
    fn manual_torn_write_disconnects() {
        let (torn, far) = TornWrite::pair(5);
        let engine = PacketEngine::with_config(torn, codec(), fast_config());
        engine.enqueue_outbound(Seq(1));
        engine.enqueue_outbound(Seq(2));

        let err = engine.process_send_queue(10).unwrap_err();
        assert!(!err.is_recoverable());
        assert!(!engine.transport().is_connected());
        assert_eq!(engine.outbound_len(), 1);
        assert_eq!(raw_bytes(&far).len(), 5);

        // Reconnected, the remainder goes out on a clean frame boundary.
        engine.transport().connect().unwrap();
        assert_eq!(engine.process_send_queue(10).unwrap(), 1);
        assert_eq!(decode_all(&far), vec![2]);
    }

    #[test]
    fn disconnected_send_is_not_a_fault() {
        let (engine, _far) = engine_pair(fast_config());
        let faults = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&faults);
        engine.on_event(move |event| {
            if matches!(event, EngineEvent::ConnectionFault { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.transport().disconnect().unwrap();

        let err = engine.send_immediately(&Seq(1)).unwrap_err();
        assert!(matches!(
            err.transport_error(),
            Some(TransportError::NotConnected)
        ));
        assert_eq!(faults.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_write_requeues_remainder() {
        let (engine, far) = engine_pair(fast_config());
        engine.enqueue_outbound(Seq(1));
        engine.enqueue_outbound(Poison);
        engine.enqueue_outbound(Seq(3));
        engine.enqueue_outbound(Seq(4));

        let err = engine.process_send_queue(3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Send {
                attempted: 3,
                written: 1,
                ..
            }
        ));
        assert_eq!(engine.outbound_len(), 2);
        assert_eq!(engine.process_send_queue(5).unwrap(), 2);
        assert_eq!(engine.packets_written(), 3);
        assert_eq!(decode_all(&far), vec![1, 3, 4]);
    }

    #[test]
    fn write_failure_is_reported_by_loop() {
        let (engine, far) = engine_pair(fast_config());
        let mut events = engine.subscribe();
        engine.enqueue_outbound(Poison);
        engine.enqueue_outbound(Seq(8));
        engine.start().unwrap();

        assert!(wait_until(|| engine.packets_written() == 1));
        engine.stop().unwrap();
        assert_eq!(decode_all(&far), vec![8]);

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::WriteFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[test]
    fn manual_pumping_without_threads() {
        let (engine, far) = engine_pair(fast_config());
        for value in 0..3 {
            far.write_bytes(&frame(value)).unwrap();
        }
        // Half a frame stays buffered.
        far.write_bytes(&frame(3)[..HEADER_SIZE]).unwrap();

        assert_eq!(engine.read_next_packets(2).unwrap(), 2);
        assert_eq!(engine.read_next_packets(10).unwrap(), 1);
        assert_eq!(engine.read_next_packets(10).unwrap(), 0);

        let mut drained = Vec::new();
        assert_eq!(engine.drain_inbound(10, &mut drained), 3);
        let values: Vec<u32> = drained
            .iter()
            .map(|p| p.downcast_ref::<Seq>().unwrap().0)
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn send_immediately_bypasses_queue() {
        let (engine, far) = engine_pair(fast_config());
        engine.enqueue_outbound(Seq(1));
        engine.send_immediately(&Seq(2)).unwrap();
        assert_eq!(engine.outbound_len(), 1);
        assert_eq!(decode_all(&far), vec![2]);
    }

    #[test]
    fn dispatch_failure_keeps_rest_queued() {
        let (engine, far) = engine_pair(fast_config());
        for value in 1..=3 {
            far.write_bytes(&frame(value)).unwrap();
        }
        engine.read_next_packets(10).unwrap();

        engine
            .dispatcher()
            .register_handler_for::<Seq, _>(Priority::High, |seq| {
                if seq.0 == 2 {
                    Err("cannot handle two".into())
                } else {
                    Ok(true)
                }
            });

        let err = engine.process_inbound_queue(10).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Dispatch {
                index: 2,
                count: 3,
                ..
            }
        ));
        assert_eq!(engine.inbound_len(), 1);
        assert_eq!(engine.process_inbound_queue(10).unwrap(), 1);
    }

    #[test]
    fn threads_are_named() {
        let (engine, far) = engine_pair(fast_config());
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        engine.on_event(move |event| {
            if matches!(event, EngineEvent::DataAvailable { .. }) {
                let name = thread::current().name().unwrap_or_default().to_string();
                sink.lock().unwrap().push(name);
            }
        });
        engine.start().unwrap();
        far.write_bytes(&frame(1)).unwrap();
        assert!(wait_until(|| !names.lock().unwrap().is_empty()));
        engine.stop().unwrap();

        let names = names.lock().unwrap();
        assert!(names[0].starts_with("engine-test-read-"));
    }

    #[test]
    fn drop_stops_running_engine() {
        let (engine, _far) = engine_pair(fast_config());
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exits);
        engine.on_event(move |event| {
            if matches!(event, EngineEvent::LoopExited { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.start().unwrap();
        drop(engine);
        assert_eq!(exits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disconnected_transport_idles_loops() {
        let (engine, far) = engine_pair(fast_config());
        engine.start().unwrap();
        engine.transport().disconnect().unwrap();
        engine.enqueue_outbound(Seq(1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.outbound_len(), 1);

        engine.transport().connect().unwrap();
        assert!(wait_until(|| engine.outbound_len() == 0));
        engine.stop().unwrap();
        assert_eq!(decode_all(&far), vec![1]);
    }
}
