//! Owns every long-lived component of the endpoint: devices, transport,
//! preprocessor, and the buffers between them. One atomic flag, flipped by
//! the signal path and polled by every worker; `Session::shutdown` releases
//! components in reverse of creation order, and `Drop` performs the same
//! sequence as a safety net.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::capture::Capture;
use crate::config::{CliMode, PreprocessorConfig};
use crate::error::VoxResult;
use crate::frame_buffer::{FrameBuffer, SeqCounter};
use crate::metrics::{AudioMetrics, NetworkMetrics};
use crate::playback::Playback;
use crate::preprocessor::Preprocessor;
use crate::transport::Transport;
use crate::{AudioFrame, EncodedPacket, DEFAULT_BUFFER_CAPACITY, DEVICE_FRAME_SAMPLES};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const TX_POP_TIMEOUT: Duration = Duration::from_millis(20);

pub struct Session {
    running: Arc<AtomicBool>,
    tx_buffer: Arc<FrameBuffer<EncodedPacket>>,
    rx_buffer: Arc<FrameBuffer<AudioFrame>>,
    tx_seq: Arc<SeqCounter>,
    preprocessor: Arc<Mutex<Preprocessor>>,
    transport: Arc<Transport>,
    capture: Capture,
    playback: Playback,
    tx_pump_handle: Option<std::thread::JoinHandle<()>>,
    tick_handle: Option<JoinHandle<()>>,
    _log_guard: Option<WorkerGuard>,
}

impl Session {
    pub async fn new(cli: CliMode, preproc_config: PreprocessorConfig) -> VoxResult<Self> {
        Self::build(cli, preproc_config, None).await
    }

    pub async fn with_logging(
        cli: CliMode,
        preproc_config: PreprocessorConfig,
        log_guard: WorkerGuard,
    ) -> VoxResult<Self> {
        Self::build(cli, preproc_config, Some(log_guard)).await
    }

    async fn build(
        cli: CliMode,
        preproc_config: PreprocessorConfig,
        log_guard: Option<WorkerGuard>,
    ) -> VoxResult<Self> {
        let device = cli.device().unwrap_or("default").to_string();

        let transport = match &cli {
            CliMode::PeerToPeer {
                remote_ip,
                local_port,
                remote_port,
                ..
            } => Transport::start_peer(remote_ip, *local_port, *remote_port).await?,
            CliMode::Server { port, .. } => Transport::start_listener(*port).await?,
            // §6: "Client mode sets both local and remote ports to the
            // supplied port" — that's the Peer addressing mode (§4.2), not
            // Initiator, which would bind an ephemeral local port instead.
            CliMode::Client { ip, port, .. } => Transport::start_peer(ip, *port, *port).await?,
        };

        let capture = Capture::initialize(&device)?;
        let playback = Playback::initialize(&device)?;
        let preprocessor = Arc::new(Mutex::new(Preprocessor::initialize(preproc_config)?));

        Ok(Self {
            running: Arc::new(AtomicBool::new(true)),
            tx_buffer: Arc::new(FrameBuffer::new(DEFAULT_BUFFER_CAPACITY)),
            rx_buffer: Arc::new(FrameBuffer::new(DEFAULT_BUFFER_CAPACITY)),
            tx_seq: Arc::new(SeqCounter::new()),
            preprocessor,
            transport: Arc::new(transport),
            capture,
            playback,
            tx_pump_handle: None,
            tick_handle: None,
            _log_guard: log_guard,
        })
    }

    /// Flips the running flag observed by every worker. This is all the
    /// signal path does; `Session::shutdown` does the rest.
    pub fn signal_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Wire up and start all four long-lived workers: capture (encode
    /// in-line), receive (decode in-line), the tx pump (FrameBuffer →
    /// `Transport::send_frame`), and the statistics/bitrate tick loop.
    /// Playback is driven by its own `cpal` callback once started.
    pub fn start(&mut self) -> VoxResult<()> {
        self.start_receive_loop();
        self.start_capture_loop()?;
        self.start_tx_pump();
        self.playback.start(self.rx_buffer.clone())?;
        self.start_tick_loop();
        Ok(())
    }

    fn start_receive_loop(&self) {
        let preprocessor = self.preprocessor.clone();
        let rx_buffer = self.rx_buffer.clone();
        self.transport.run_receive_loop(move |seq, payload| {
            let decoded = preprocessor.lock().decode(payload);
            match decoded {
                Some(samples) => {
                    rx_buffer.push(AudioFrame::new(seq, samples));
                }
                None => {
                    warn!("dropping undecodable packet seq={seq}");
                }
            }
        });
    }

    fn start_capture_loop(&mut self) -> VoxResult<()> {
        let preprocessor = self.preprocessor.clone();
        let tx_buffer = self.tx_buffer.clone();
        let tx_seq = self.tx_seq.clone();
        self.capture.start(move |samples: &[i16]| {
            let mut pre = preprocessor.lock();
            if let Some(payload) = pre.encode(samples) {
                let seq = tx_seq.next();
                let bitrate = pre.current_bitrate();
                drop(pre);
                tx_buffer.push(EncodedPacket::new(seq, bitrate, payload));
            }
        })
    }

    /// Drains the tx `FrameBuffer` and hands each packet to
    /// `Transport::send_frame`. `FrameBuffer::pop_timeout` blocks on a
    /// `std::sync::Condvar`, so this runs on its own OS thread rather than a
    /// tokio task — the same reasoning that keeps capture/playback off the
    /// async runtime — and reaches into the runtime with `Handle::block_on`
    /// only for the send itself.
    fn start_tx_pump(&mut self) {
        let tx_buffer = self.tx_buffer.clone();
        let running = self.running.clone();
        let transport = self.transport.clone();
        let rt = tokio::runtime::Handle::current();
        let handle = std::thread::Builder::new()
            .name("voxlink-tx-pump".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let Some(packet) = tx_buffer.pop_timeout(TX_POP_TIMEOUT) else {
                        continue;
                    };
                    if let Err(e) = rt.block_on(transport.send_frame(packet.seq, &packet.payload)) {
                        warn!("send failed for seq={}: {e}", packet.seq);
                    }
                }
            })
            .expect("spawn tx pump thread");
        self.tx_pump_handle = Some(handle);
    }

    fn start_tick_loop(&mut self) {
        let running = self.running.clone();
        let preprocessor = self.preprocessor.clone();
        let transport = self.transport.clone();
        let tx_buffer = self.tx_buffer.clone();
        let rx_buffer = self.rx_buffer.clone();

        let handle = tokio::spawn(async move {
            let mut last_log = Instant::now();
            while running.load(Ordering::Acquire) {
                tokio::time::sleep(TICK_INTERVAL).await;
                if !running.load(Ordering::Acquire) {
                    break;
                }

                let counters = transport.counters();
                let total = counters.received + counters.malformed_received;
                let loss_ratio = if total > 0 {
                    counters.malformed_received as f64 / total as f64
                } else {
                    0.0
                };
                let network = NetworkMetrics {
                    loss_ratio,
                    latency_ms: 0.0,
                    jitter_ms: 0.0,
                    bandwidth_kbps: None,
                };
                preprocessor.lock().update_network_metrics(network);

                if last_log.elapsed() >= STATS_LOG_INTERVAL {
                    last_log = Instant::now();
                    let bitrate = preprocessor.lock().current_bitrate();
                    info!(
                        sent = counters.sent,
                        received = counters.received,
                        failed_send = counters.failed_send,
                        malformed = counters.malformed_received,
                        tx_dropped = tx_buffer.dropped_count(),
                        rx_dropped = rx_buffer.dropped_count(),
                        bitrate,
                        "session stats"
                    );
                }
            }
        });
        self.tick_handle = Some(handle);
    }

    /// Forward an out-of-band audio metrics observation (e.g. from a test
    /// harness) into the bitrate controller.
    pub fn report_audio_metrics(&self, metrics: AudioMetrics) {
        self.preprocessor.lock().update_audio_metrics(metrics);
    }

    /// Stop devices, the socket, and abort outstanding tasks without
    /// waiting on any of them. Safe to call from `Drop` — nothing here
    /// awaits — so the destructor guarantee in spec.md §9 holds whether
    /// shutdown is triggered by SIGINT (via `shutdown`) or by the `Session`
    /// simply going out of scope. `shutdown` calls this first, then waits
    /// on what it started.
    fn shutdown_sync(&mut self) {
        self.running.store(false, Ordering::Release);
        self.capture.stop();
        self.playback.stop();
        // Requests cancellation of the receive task and closes its
        // registration; does not await the join (`Transport::stop_sync`
        // is the non-async half of `Transport::stop`).
        self.transport.stop_sync();
        if let Some(h) = self.tx_pump_handle.take() {
            // Bounded by TX_POP_TIMEOUT: the thread observes `running` at
            // the next wakeup and returns.
            let _ = h.join();
        }
        if let Some(h) = self.tick_handle.take() {
            h.abort();
        }
        self.tx_buffer.clear();
        self.rx_buffer.clear();
    }

    /// Orderly shutdown in reverse of creation order: devices first (already
    /// stopped above), then the socket. Workers join within the 500 ms
    /// budget because `Transport::stop` aborts the receive task and the tx
    /// pump observes `running` at most `TX_POP_TIMEOUT` late.
    pub async fn shutdown(&mut self) {
        self.shutdown_sync();
        self.transport.stop().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown_sync();
    }
}
