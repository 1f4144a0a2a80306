use std::time::Duration;

use anyhow::ensure;
use le_audio::ascs::{Ascs, AscsHandler, AseState, QosPref, Rsp, StreamOps};
use le_audio::audio::{AseKey, CodecConfig, CodecId, Context, Direction, HciReason};
use le_audio::gatt::{Characteristic, GattServer, NotifyError};
use le_audio::iso::{ChannelId, DataDirection, IsoTransport, RecvInfo, TransportError};
use bytes::Bytes;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CONN: u16 = 0x0040;

struct LoggingGatt;

impl GattServer for LoggingGatt {
    fn notify(&mut self, conn: u16, characteristic: Characteristic, data: &[u8]) -> Result<(), NotifyError> {
        info!("0x{:04X} <- {:?}: {:02X?}", conn, characteristic, data);
        Ok(())
    }

    fn is_subscribed(&self, _conn: u16, _characteristic: Characteristic) -> bool {
        true
    }

    fn mtu(&self, _conn: u16) -> u16 {
        64
    }

    fn connection_interval(&self, _conn: u16) -> u16 {
        24
    }
}

/// Pretends to be a controller. Disconnects complete asynchronously.
struct LoopbackTransport {
    events: UnboundedSender<ChannelId>
}

impl IsoTransport for LoopbackTransport {
    fn disconnect(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        self.events.send(channel).map_err(|_| TransportError::NotConnected)
    }

    fn setup_data_path(&mut self, channel: ChannelId, dir: DataDirection, codec: &CodecConfig) -> Result<(), TransportError> {
        info!("Data path {:?} {:?} for {:?}", channel, dir, codec.id);
        Ok(())
    }

    fn send(&mut self, _channel: ChannelId, _sdu: Bytes, _seq_num: u16, _timestamp: Option<u32>) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Speaker {
    key: AseKey,
    received: usize
}

impl StreamOps for Speaker {
    fn started(&mut self) {
        info!("{}: playback started", self.key);
    }

    fn stopped(&mut self, reason: HciReason) {
        info!("{}: playback stopped ({:?}) after {} frames", self.key, reason, self.received);
    }

    fn recv(&mut self, info: &RecvInfo, _sdu: Bytes) {
        if info.valid {
            self.received += 1;
        }
    }
}

struct Lc3Only;

impl AscsHandler for Lc3Only {
    fn config(&mut self, key: AseKey, dir: Direction, codec: &CodecConfig) -> Result<(Box<dyn StreamOps>, QosPref), Rsp> {
        info!("{}: configuring {:?} for {:?}", key, dir, codec.id);
        Ok((Box::new(Speaker { key, received: 0 }), QosPref::default()))
    }

    fn codec_supported(&self, _dir: Direction, codec: &CodecId) -> bool {
        *codec == CodecId::LC3
    }

    fn release(&mut self, key: AseKey) -> Result<(), Rsp> {
        info!("{}: released by the client", key);
        Ok(())
    }

    fn available_contexts(&self, _conn: u16, _dir: Direction) -> Option<Context> {
        Some(Context::Media | Context::Unspecified)
    }
}

fn write(ascs: &Ascs, data: &[u8]) -> anyhow::Result<()> {
    info!("0x{:04X} -> ControlPoint: {:02X?}", CONN, data);
    ascs.write_control_point(CONN, 0, data, false)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(layer().without_time())
        .with(EnvFilter::from_default_env())
        .init();

    let (tx, mut rx) = unbounded_channel();
    let ascs = Ascs::builder()
        .with_sink_count(1)
        .with_source_count(1)
        .with_disconnect_delay(Duration::from_millis(200))
        .build(LoggingGatt, LoopbackTransport { events: tx }, Lc3Only);
    let worker = spawn(ascs.clone().run());

    {
        let ascs = ascs.clone();
        spawn(async move {
            while let Some(channel) = rx.recv().await {
                sleep(Duration::from_millis(10)).await;
                if let Err(err) = ascs.iso_disconnected(channel, HciReason::LOCAL_HOST_TERMINATED) {
                    warn!("Failed to report the disconnect: {}", err);
                }
            }
        });
    }

    let sink = AseKey::new(CONN, 1);
    // LC3, 48 kHz, 10 ms frames, 100 octets per frame
    write(&ascs, &[0x01, 0x01, 0x01, 0x02, 0x02, 0x06, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x02, 0x01, 0x08, 0x02, 0x02, 0x01, 0x03, 0x04, 0x64, 0x00])?;
    write(&ascs, &[0x02, 0x01, 0x01, 0x00, 0x00, 0x10, 0x27, 0x00, 0x00, 0x02, 0x64, 0x00, 0x05, 0x14, 0x00, 0x40, 0x9C, 0x00])?;
    write(&ascs, &[0x03, 0x01, 0x01, 0x04, 0x03, 0x02, 0x04, 0x00])?;
    sleep(Duration::from_millis(50)).await;

    let channel = ChannelId(0x0060);
    ensure!(ascs.iso_accept(CONN, 0x00, 0x00, channel), "the CIS was not expected");
    ascs.iso_connected(channel)?;
    ascs.start(sink)?;
    sleep(Duration::from_millis(50)).await;
    ensure!(ascs.state(sink) == Some(AseState::Streaming), "the sink is not streaming");

    for seq_num in 0..100 {
        let info = RecvInfo { seq_num, timestamp: None, valid: true };
        ascs.iso_recv(channel, &info, Bytes::from_static(&[0u8; 100]));
    }

    // a vendor codec is turned away
    write(&ascs, &[0x01, 0x01, 0x02, 0x02, 0x02, 0xFF, 0x5D, 0x00, 0x01, 0x00, 0x00])?;

    info!("Press Ctrl+C to release the stream");
    tokio::signal::ctrl_c().await?;
    write(&ascs, &[0x08, 0x01, 0x01])?;
    sleep(Duration::from_millis(500)).await;
    ensure!(ascs.state(sink).is_none(), "the sink was not released");
    info!("Released with {} iso bindings left", ascs.iso_bindings());

    worker.abort();
    Ok(())
}
