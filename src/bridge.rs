//! The bridge controller.
//!
//! One task owns the master link and runs the listen loop. Every allowlisted
//! poll spawns a handler that queries the slave, translates the reply and
//! queues the finished frame for the writer task, which is the only code that
//! writes to the master link.
//!
//! ```text
//! master ─► FrameReader ─► classify ─► handler ─► SlaveQuery ─► Translator
//!                                                                 │
//! master ◄─ writer task ◄─ mpsc ◄──────────── build_master_frame ◄┘
//! ```

use crate::config::{Allowlist, BridgeConfig};
use crate::error::{Error, Result};
use crate::link::{write_frame, Opener};
use crate::protocol::{build_master_frame, MasterRequest, MasterTelemetry};
use crate::reader::{FrameReader, ReadOutcome};
use crate::slave::SlaveQuery;
use crate::translate::Translator;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Replies waiting for the writer task.
const REPLY_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Listening,
    AwaitingRecovery,
    Stopped,
}

/// Impersonates the slave device toward the master.
#[derive(Debug)]
pub struct Bridge<M, S> {
    master: M,
    slave: Arc<SlaveQuery<S>>,
    translator: Arc<Translator>,
    allowlist: Allowlist,
    idle_timeout: Duration,
    poll_interval: Duration,
    max_in_flight: usize,
    state: BridgeState,
    recoveries: usize,
}

impl<M: Opener, S: Opener> Bridge<M, S> {
    /// Validates the configuration and the mapping tables.
    pub fn new(master: M, slave: S, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            master,
            slave: Arc::new(SlaveQuery::new(slave, config.slave_query())),
            translator: Arc::new(Translator::new()?),
            allowlist: config.allowlist()?,
            idle_timeout: config.idle_timeout,
            poll_interval: config.poll_interval,
            max_in_flight: config.max_in_flight,
            state: BridgeState::Listening,
            recoveries: 0,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Number of idle timeouts that led to a reopened master link.
    pub fn recoveries(&self) -> usize {
        self.recoveries
    }

    /// Runs until `stop` turns true (or its sender is dropped) or a fatal
    /// error occurs.
    ///
    /// Failing to open the master link ends the run with
    /// [`Error::ChannelOpen`]; a vanished link, a failed write or a fatal
    /// handler error end it with that error. Releasing external resources is
    /// left to the caller.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting bridge: master {}, addresses {:?}",
            self.master.describe(),
            self.allowlist.iter().collect::<Vec<_>>()
        );
        loop {
            if *stop.borrow() {
                self.transition(BridgeState::Stopped);
            }
            match self.state {
                BridgeState::Listening => match self.listen(&mut stop).await {
                    Ok(next) => self.transition(next),
                    Err(err) => {
                        error!("Bridge terminated: {err}");
                        self.transition(BridgeState::Stopped);
                        return Err(err);
                    }
                },
                BridgeState::AwaitingRecovery => {
                    self.recoveries += 1;
                    info!("Reopening master link {}", self.master.describe());
                    self.transition(BridgeState::Listening);
                }
                BridgeState::Stopped => {
                    info!("Bridge stopped");
                    return Ok(());
                }
            }
        }
    }

    fn transition(&mut self, next: BridgeState) {
        if self.state != next {
            debug!("Bridge state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// One session on an open master link. Returns the state to enter next.
    async fn listen(&mut self, stop: &mut watch::Receiver<bool>) -> Result<BridgeState> {
        let stream = self.master.open()?;
        info!("Listening to {}", self.master.describe());

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.poll_interval);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let mut writer = tokio::spawn(write_replies(write_half, reply_rx));
        let mut handlers = JoinSet::new();
        let mut last_received = Instant::now();

        let next = loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Stopping bridge...");
                        break Ok(BridgeState::Stopped);
                    }
                }
                Some(joined) = handlers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => break Err(err),
                    Err(err) if err.is_panic() => {
                        break Err(Error::Io(std::io::Error::other(format!("handler panicked: {err}"))))
                    }
                    Err(_cancelled) => {}
                },
                written = &mut writer => {
                    break Err(match written {
                        Ok(Err(err)) => err,
                        _ => Error::ChannelClosed,
                    });
                }
                outcome = reader.next_frame() => match outcome {
                    Ok(ReadOutcome::Frame(frame)) => {
                        last_received = Instant::now();
                        self.dispatch(&frame, &mut handlers, &reply_tx);
                    }
                    Ok(ReadOutcome::Pending) => {
                        if last_received.elapsed() >= self.idle_timeout {
                            info!(
                                "No messages received for {:?}. Assuming connection lost.",
                                self.idle_timeout
                            );
                            break Ok(BridgeState::AwaitingRecovery);
                        }
                    }
                    Err(err) => {
                        error!("Master link unexpectedly closed: {err}");
                        break Err(err);
                    }
                },
            }
        };

        handlers.shutdown().await;
        drop(reply_tx);
        drop(reader);
        match next {
            Ok(state) => {
                // drains queued replies, then releases the write half
                match writer.await {
                    Ok(Err(err)) => Err(err),
                    _ => Ok(state),
                }
            }
            Err(err) => {
                writer.abort();
                Err(err)
            }
        }
    }

    fn dispatch(
        &self,
        frame: &[u8],
        handlers: &mut JoinSet<Result<()>>,
        replies: &mpsc::Sender<Vec<u8>>,
    ) {
        debug!("Received: {}", frame.escape_ascii());
        let request = match MasterRequest::classify(frame) {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!("Received slave reply: {}", frame.escape_ascii());
                return;
            }
            Err(err) => {
                error!("{err}");
                return;
            }
        };
        let address = request.address();
        if !self.allowlist.contains(address) {
            debug!("Master request for unhandled address {address}");
            return;
        }
        if handlers.len() >= self.max_in_flight {
            warn!(
                "Dropping request for address {address}: {} handlers in flight",
                handlers.len()
            );
            return;
        }
        debug!("Handling master request for address {address}");
        handlers.spawn(handle_request(
            request,
            Arc::clone(&self.slave),
            Arc::clone(&self.translator),
            replies.clone(),
        ));
    }
}

/// Slave round trip for one poll. Only fatal errors are returned.
async fn handle_request<S: Opener>(
    request: MasterRequest,
    slave: Arc<SlaveQuery<S>>,
    translator: Arc<Translator>,
    replies: mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let address = request.address();
    let response = match slave.query(address).await {
        Ok(response) => response,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            error!("No usable response from slave for address {address}: {err}");
            return Ok(());
        }
    };

    let payload = match translator.translate(response.payload()) {
        Ok(payload) => payload,
        Err(err) => {
            error!("Cannot translate slave response for address {address}: {err}");
            return Ok(());
        }
    };
    let frame = build_master_frame(&payload);
    match MasterTelemetry::decode(&frame) {
        Ok(telemetry) => debug!("Translated telemetry for address {address}: {telemetry:?}"),
        Err(err) => debug!("Cannot decode translated frame: {err}"),
    }

    if replies.send(frame).await.is_err() {
        warn!("Master link closed before the reply for address {address} was queued");
    }
    Ok(())
}

/// The single writer of the master link.
async fn write_replies<W: AsyncWrite + Unpin>(
    mut sink: W,
    mut replies: mpsc::Receiver<Vec<u8>>,
) -> Result<()> {
    while let Some(frame) = replies.recv().await {
        write_frame(&mut sink, &frame, "master").await?;
        info!("Response sent to master: {}", frame.escape_ascii());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{
        SAMPLE_MASTER_FRAME, SAMPLE_MASTER_REQUEST, SAMPLE_SLAVE_RESPONSE,
    };
    use crate::slave::tests::ScriptedSlave;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    /// Master link double; keeps the far end of every opened channel.
    #[derive(Clone, Default)]
    struct MasterLine {
        opens: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<DuplexStream>>>,
    }

    impl MasterLine {
        fn take_peer(&self) -> Option<DuplexStream> {
            self.peers.lock().unwrap().pop()
        }
    }

    impl Opener for MasterLine {
        type Stream = DuplexStream;

        fn open(&self) -> Result<DuplexStream> {
            let (stream, peer) = tokio::io::duplex(4096);
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.peers.lock().unwrap().push(peer);
            Ok(stream)
        }

        fn describe(&self) -> String {
            "test master".into()
        }
    }

    /// Slave link whose device end is gone before the first write.
    struct DeadSlave;

    impl Opener for DeadSlave {
        type Stream = DuplexStream;

        fn open(&self) -> Result<DuplexStream> {
            let (stream, _device) = tokio::io::duplex(64);
            Ok(stream)
        }

        fn describe(&self) -> String {
            "dead slave".into()
        }
    }

    /// Master stream that delivers polls but refuses every write.
    struct ReadOnlyStream(DuplexStream);

    impl AsyncRead for ReadOnlyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ReadOnlyStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Clone, Default)]
    struct ReadOnlyMasterLine(MasterLine);

    impl Opener for ReadOnlyMasterLine {
        type Stream = ReadOnlyStream;

        fn open(&self) -> Result<ReadOnlyStream> {
            self.0.open().map(ReadOnlyStream)
        }

        fn describe(&self) -> String {
            "read-only master".into()
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            poll_interval: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        }
    }

    async fn connected_peer(master: &MasterLine) -> DuplexStream {
        loop {
            if let Some(peer) = master.take_peer() {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn read_frames(peer: &mut DuplexStream, count: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut current = Vec::new();
        let mut byte = [0u8; 1];
        while frames.len() < count {
            peer.read_exact(&mut byte).await.unwrap();
            current.push(byte[0]);
            if byte[0] == b'\r' {
                frames.push(std::mem::take(&mut current));
            }
        }
        frames
    }

    #[tokio::test]
    async fn answers_allowlisted_poll() {
        let master = MasterLine::default();
        let slave = ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE);
        let mut bridge = Bridge::new(master.clone(), slave.clone(), &config()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            let result = bridge.run(stop_rx).await;
            (bridge, result)
        });

        let mut peer = connected_peer(&master).await;
        // other traffic and foreign addresses are ignored
        peer.write_all(SAMPLE_SLAVE_RESPONSE).await.unwrap();
        peer.write_all(b"~22024A42E00202FD2C\r").await.unwrap();
        peer.write_all(b"~22FF4A42\r").await.unwrap();
        peer.write_all(SAMPLE_MASTER_REQUEST).await.unwrap();

        let frames = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut peer, 1))
            .await
            .unwrap();
        assert_eq!(frames, vec![SAMPLE_MASTER_FRAME.to_vec()]);
        assert_eq!(slave.queries.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        let (bridge, result) = running.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(bridge.recoveries(), 0);
    }

    #[tokio::test]
    async fn concurrent_replies_are_not_interleaved() {
        let master = MasterLine::default();
        let slave = ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE);
        let mut bridge = Bridge::new(master.clone(), slave, &config()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { bridge.run(stop_rx).await });

        let mut peer = connected_peer(&master).await;
        let mut polls = SAMPLE_MASTER_REQUEST.to_vec();
        polls.extend_from_slice(SAMPLE_MASTER_REQUEST);
        peer.write_all(&polls).await.unwrap();

        let frames = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut peer, 2))
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert_eq!(frame, SAMPLE_MASTER_FRAME);
        }

        stop_tx.send(true).unwrap();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn short_slave_reply_sends_nothing() {
        let master = MasterLine::default();
        let short = b">22084200E00200FD2E\r";
        let slave = ScriptedSlave::always(short);
        let config = BridgeConfig {
            verify_checksum: false,
            ..config()
        };
        let mut bridge = Bridge::new(master.clone(), slave.clone(), &config).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { bridge.run(stop_rx).await });

        let mut peer = connected_peer(&master).await;
        peer.write_all(SAMPLE_MASTER_REQUEST).await.unwrap();
        while slave.queries.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut byte = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(200), peer.read_exact(&mut byte))
                .await
                .is_err()
        );

        stop_tx.send(true).unwrap();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_master_link_is_reopened() {
        let master = MasterLine::default();
        let slave = ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE);
        let config = BridgeConfig {
            idle_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            ..BridgeConfig::default()
        };
        let mut bridge = Bridge::new(master.clone(), slave, &config).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            let result = bridge.run(stop_rx).await;
            (bridge, result)
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        stop_tx.send(true).unwrap();
        let (bridge, result) = running.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(bridge.recoveries(), 2);
        assert_eq!(master.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn vanished_master_link_is_fatal() {
        let master = MasterLine::default();
        let slave = ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE);
        let mut bridge = Bridge::new(master.clone(), slave, &config()).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            let result = bridge.run(stop_rx).await;
            (bridge, result)
        });

        drop(connected_peer(&master).await);
        let (bridge, result) = running.await.unwrap();
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(master.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_slave_link_is_fatal() {
        let master = MasterLine::default();
        let mut bridge = Bridge::new(master.clone(), DeadSlave, &config()).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            let result = bridge.run(stop_rx).await;
            (bridge, result)
        });

        let mut peer = connected_peer(&master).await;
        peer.write_all(SAMPLE_MASTER_REQUEST).await.unwrap();
        let (bridge, result) = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Write("slave", _))));
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(bridge.recoveries(), 0);
    }

    #[tokio::test]
    async fn failed_reply_write_is_fatal() {
        let master = ReadOnlyMasterLine::default();
        let slave = ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE);
        let mut bridge = Bridge::new(master.clone(), slave.clone(), &config()).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            let result = bridge.run(stop_rx).await;
            (bridge, result)
        });

        let mut peer = connected_peer(&master.0).await;
        peer.write_all(SAMPLE_MASTER_REQUEST).await.unwrap();
        let (bridge, result) = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Write("master", _))));
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(slave.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BridgeConfig {
            addresses: vec![33],
            ..BridgeConfig::default()
        };
        assert!(matches!(
            Bridge::new(
                MasterLine::default(),
                ScriptedSlave::always(SAMPLE_SLAVE_RESPONSE),
                &config
            ),
            Err(Error::InvalidAddress(33))
        ));
    }
}
