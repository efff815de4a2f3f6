//! End-to-end exercise of the send/receive pipeline over a real loopback UDP
//! socket, without touching actual audio hardware: synthesized PCM stands in
//! for `Capture`, and an `mpsc` channel stands in for `Playback`, so this
//! runs the same in CI as on a workstation with a sound card.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voxlink::config::PreprocessorConfig;
use voxlink::frame_buffer::{FrameBuffer, SeqCounter};
use voxlink::preprocessor::Preprocessor;
use voxlink::transport::Transport;
use voxlink::{AudioFrame, EncodedPacket, DEVICE_FRAME_SAMPLES};

fn tone(freq_hz: f64, amplitude: i16) -> Vec<i16> {
    (0..DEVICE_FRAME_SAMPLES)
        .map(|i| {
            let t = i as f64 / voxlink::DEVICE_SAMPLE_RATE as f64;
            (amplitude as f64 * (2.0 * std::f64::consts::PI * freq_hz * t).sin()) as i16
        })
        .collect()
}

/// Mirrors the disabled-codec profile so the test doesn't depend on the
/// `opus` shared library being present in the sandbox that runs it.
fn no_codec_config() -> PreprocessorConfig {
    PreprocessorConfig {
        enable_codec: false,
        enable_bitrate_adaptation: false,
        ..PreprocessorConfig::default()
    }
}

#[tokio::test]
async fn two_endpoints_exchange_ten_frames_over_loopback() {
    let listener = Transport::start_listener(0).await.unwrap();
    let listener_port = listener.local_addr().unwrap().port();
    let initiator = Transport::start_initiator("127.0.0.1", listener_port)
        .await
        .unwrap();

    let rx_buffer = Arc::new(FrameBuffer::<AudioFrame>::new(10));
    let rx_buffer_for_loop = rx_buffer.clone();
    let mut decoder = Preprocessor::initialize(no_codec_config()).unwrap();
    listener.run_receive_loop(move |seq, payload| {
        if let Some(samples) = decoder.decode(payload) {
            rx_buffer_for_loop.push(AudioFrame::new(seq, samples));
        }
    });

    let mut encoder = Preprocessor::initialize(no_codec_config()).unwrap();
    let seq = SeqCounter::new();
    let sent_frames: Vec<Vec<i16>> = (0..10).map(|i| tone(220.0 + i as f64, 12_000)).collect();

    for frame in &sent_frames {
        let payload = encoder.encode(frame).expect("encodes");
        initiator
            .send_frame(seq.next(), &payload)
            .await
            .expect("send over loopback");
    }

    // Give the receive task time to drain ten datagrams.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while rx_buffer.popped_count() + rx_buffer.size() as u64 < 10 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(rx_buffer.size() as u64, 10);
    for (i, _) in sent_frames.iter().enumerate() {
        let received = rx_buffer.pop().expect("frame present");
        assert_eq!(received.seq, i as u32);
        assert_eq!(received.samples.len(), DEVICE_FRAME_SAMPLES);
    }

    listener.stop().await;
    initiator.stop().await;
}

#[tokio::test]
async fn tx_buffer_drains_to_transport_like_the_session_pump() {
    // Exercises the same FrameBuffer -> Transport::send_frame handoff the
    // session's tx pump performs, without spinning up a whole Session.
    let listener = Transport::start_listener(0).await.unwrap();
    let listener_port = listener.local_addr().unwrap().port();
    let sender = Arc::new(Transport::start_initiator("127.0.0.1", listener_port).await.unwrap());

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    listener.run_receive_loop(move |seq, payload| {
        let _ = delivered_tx.send((seq, payload.to_vec()));
    });

    let tx_buffer: Arc<FrameBuffer<EncodedPacket>> = Arc::new(FrameBuffer::new(10));
    for i in 0..5u32 {
        tx_buffer.push(EncodedPacket::new(i, 6_000, vec![i as u8; 40]));
    }

    let pump_buffer = tx_buffer.clone();
    let pump_sender = sender.clone();
    let pump = tokio::spawn(async move {
        for _ in 0..5 {
            if let Some(packet) = pump_buffer.pop_timeout(Duration::from_millis(100)) {
                pump_sender
                    .send_frame(packet.seq, &packet.payload)
                    .await
                    .unwrap();
            }
        }
    });
    pump.await.unwrap();

    for expected_seq in 0..5u32 {
        let (seq, payload) = tokio::time::timeout(Duration::from_millis(200), delivered_rx.recv())
            .await
            .expect("datagram arrives")
            .expect("channel open");
        assert_eq!(seq, expected_seq);
        assert_eq!(payload, vec![expected_seq as u8; 40]);
    }

    listener.stop().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_leaves_socket_usable_for_local_addr() {
    let listener = Transport::start_listener(0).await.unwrap();
    listener.run_receive_loop(|_, _| {});
    listener.stop().await;
    listener.stop().await; // must not panic or hang the second time
    assert!(listener.local_addr().is_ok());
}
