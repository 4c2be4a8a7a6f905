//! Request/response exchanges with the worker and the [`Bridge`] facade.

use std::time::Duration;

use tokio_util::bytes::Bytes;

use crate::bridge::protocol::{Command, ResponseBuffer, parse_bool_reply, parse_key_values};
use crate::config::{BridgeConfig, LineEnding};
use crate::error::BridgeError;
use crate::image::{ImageInfo, IoRegion, LookupTable};
use crate::metadata::MetadataDictionary;
use crate::mux::{MuxEvent, Source, WorkerLink};
use crate::supervisor::{Supervisor, WorkerState};
use crate::transfer::{self, TransferStats};

/// Worker stderr collected over one exchange.
///
/// Complete lines are re-emitted at debug level as they arrive.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    raw: Vec<u8>,
    logged: usize,
}

impl Diagnostics {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
        let Some(newline) = self.raw[self.logged..].iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let end = self.logged + newline;
        for line in String::from_utf8_lossy(&self.raw[self.logged..end]).lines() {
            tracing::debug!(target: "scibridge::worker", "{}", line);
        }
        self.logged = end + 1;
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    pub(crate) fn clear(&mut self) {
        self.raw.clear();
        self.logged = 0;
    }
}

/// One operation's worth of traffic over a [`WorkerLink`].
pub(crate) struct Exchange<'a> {
    link: &'a mut dyn WorkerLink,
    diagnostics: &'a mut Diagnostics,
    line_ending: LineEnding,
    timeout: Option<Duration>,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        link: &'a mut dyn WorkerLink,
        diagnostics: &'a mut Diagnostics,
        line_ending: LineEnding,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            link,
            diagnostics,
            line_ending,
            timeout,
        }
    }

    pub(crate) fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub(crate) async fn send(&mut self, command: Command) -> Result<(), BridgeError> {
        let operation = command.verb().as_str();
        command
            .validate()
            .map_err(|message| BridgeError::InvalidCommand { operation, message })?;

        tracing::debug!(operation, args = command.args().len(), "Sending command");
        if let Err(e) = self.link.send_command(command).await {
            tracing::debug!(operation, error = %e, "Command write failed");
            return Err(self.transport(operation));
        }
        Ok(())
    }

    pub(crate) async fn send_payload(
        &mut self,
        operation: &'static str,
        bytes: &[u8],
    ) -> Result<(), BridgeError> {
        if let Err(e) = self.link.send_payload(bytes).await {
            tracing::debug!(operation, error = %e, "Payload write failed");
            return Err(self.transport(operation));
        }
        Ok(())
    }

    /// Next chunk from the payload stream. Diagnostics seen on the way are
    /// accumulated.
    pub(crate) async fn next_payload(
        &mut self,
        operation: &'static str,
    ) -> Result<Bytes, BridgeError> {
        loop {
            match self.link.wait_for_data(self.timeout).await {
                MuxEvent::Data(Source::Payload, bytes) => return Ok(bytes),
                MuxEvent::Data(Source::Diagnostic, bytes) => self.diagnostics.push(&bytes),
                MuxEvent::Closed | MuxEvent::PayloadClosed | MuxEvent::TimedOut => {
                    return Err(self.transport(operation));
                }
            }
        }
    }

    /// Read payload output until it ends with the response terminator.
    pub(crate) async fn await_reply(
        &mut self,
        operation: &'static str,
    ) -> Result<String, BridgeError> {
        let mut reply = ResponseBuffer::new(self.line_ending);
        while !reply.is_complete() {
            let bytes = self.next_payload(operation).await?;
            reply.push(&bytes);
        }
        tracing::trace!(operation, bytes = reply.len(), "Reply complete");
        Ok(reply.into_text())
    }

    pub(crate) fn transport(&mut self, operation: &'static str) -> BridgeError {
        let state = self.link.state();
        BridgeError::transport(operation, state, self.diagnostics.text())
    }

    pub(crate) fn protocol(&self, operation: &'static str, message: String) -> BridgeError {
        BridgeError::protocol(operation, message, self.diagnostics.text())
    }

    async fn query_bool(&mut self, command: Command) -> Result<bool, BridgeError> {
        let operation = command.verb().as_str();
        self.send(command).await?;
        let reply = self.await_reply(operation).await?;
        let answer = parse_bool_reply(&reply, self.line_ending)
            .map_err(|message| self.protocol(operation, message))?;
        tracing::debug!(operation, answer, "Worker answered");
        Ok(answer)
    }

    pub(crate) async fn can_read(&mut self, path: &str) -> Result<bool, BridgeError> {
        self.query_bool(Command::can_read(path)).await
    }

    pub(crate) async fn can_write(&mut self, path: &str) -> Result<bool, BridgeError> {
        self.query_bool(Command::can_write(path)).await
    }

    /// Raw key/value pairs of the `info` reply, values unescaped.
    pub(crate) async fn info(&mut self, path: &str) -> Result<Vec<(String, String)>, BridgeError> {
        self.send(Command::info(path)).await?;
        let reply = self.await_reply("info").await?;
        Ok(parse_key_values(&reply, self.line_ending))
    }
}

/// Host side of the worker bridge.
///
/// Owns the worker process and the metadata dictionary of the last image
/// inspected. Operations run one at a time; the worker is spawned on first
/// use and replaced after any transport failure.
pub struct Bridge {
    config: BridgeConfig,
    supervisor: Supervisor,
    diagnostics: Diagnostics,
    metadata: MetadataDictionary,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            supervisor: Supervisor::new(&config),
            config,
            diagnostics: Diagnostics::default(),
            metadata: MetadataDictionary::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Whether the worker can decode the file at `path`.
    pub async fn can_read_file(&mut self, path: &str) -> Result<bool, BridgeError> {
        let result = match self.exchange().await {
            Ok(mut exchange) => exchange.can_read(path).await,
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// Fetch the image description and rebuild the metadata dictionary from it.
    pub async fn read_image_information(&mut self, path: &str) -> Result<ImageInfo, BridgeError> {
        self.metadata.clear();
        let result = match self.exchange().await {
            Ok(mut exchange) => exchange.info(path).await,
            Err(e) => Err(e),
        };
        let pairs = self.settle(result).await?;

        tracing::debug!(path, keys = pairs.len(), "Image metadata received");
        for (key, value) in pairs {
            self.metadata.put(key, value);
        }
        ImageInfo::from_metadata(&self.metadata)
    }

    /// Read `region` of the image at `path` into `buffer`.
    ///
    /// `buffer` must hold at least `info.pixel_size() * region.pixel_count()` bytes.
    pub async fn read(
        &mut self,
        path: &str,
        info: &ImageInfo,
        region: &IoRegion,
        buffer: &mut [u8],
    ) -> Result<(), BridgeError> {
        let expected = transfer::check_buffer(info, region, buffer.len())?;
        let result = match self.exchange().await {
            Ok(mut exchange) => {
                transfer::read_region(&mut exchange, path, region, &mut buffer[..expected]).await
            }
            Err(e) => Err(e),
        };
        self.settle_transfer(result).await
    }

    /// Whether the worker can encode to the file at `path`.
    pub async fn can_write_file(&mut self, path: &str) -> Result<bool, BridgeError> {
        let result = match self.exchange().await {
            Ok(mut exchange) => exchange.can_write(path).await,
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// Write `region` of `buffer` to `path`.
    ///
    /// A lookup table described in the metadata dictionary is sent along.
    pub async fn write(
        &mut self,
        path: &str,
        info: &ImageInfo,
        region: &IoRegion,
        buffer: &[u8],
    ) -> Result<TransferStats, BridgeError> {
        transfer::check_buffer(info, region, buffer.len())?;
        let lut = LookupTable::from_metadata(&self.metadata)?;
        let request = transfer::WriteRequest {
            path,
            info,
            region,
            lut: lut.as_ref(),
            chunk_size: self.config.chunk_size,
        };
        let result = match self.exchange().await {
            Ok(mut exchange) => transfer::write_region(&mut exchange, &request, buffer).await,
            Err(e) => Err(e),
        };
        self.settle_transfer(result).await
    }

    /// Tear the worker down. The next operation starts a fresh one.
    pub async fn reset(&mut self) {
        self.supervisor.destroy().await;
    }

    pub fn metadata(&self) -> &MetadataDictionary {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataDictionary {
        &mut self.metadata
    }

    pub fn worker_state(&mut self) -> WorkerState {
        self.supervisor.state()
    }

    /// Worker stderr captured during the most recent operation.
    pub fn last_diagnostics(&self) -> String {
        self.diagnostics.text()
    }

    async fn exchange(&mut self) -> Result<Exchange<'_>, BridgeError> {
        self.diagnostics.clear();
        let link = self.supervisor.ensure_running().await?;
        Ok(Exchange::new(
            link,
            &mut self.diagnostics,
            self.config.line_ending,
            self.config.response_timeout,
        ))
    }

    async fn settle<T>(&mut self, result: Result<T, BridgeError>) -> Result<T, BridgeError> {
        if let Err(err) = &result
            && err.is_transport()
        {
            tracing::warn!(error = %err, "Worker failed mid-exchange; tearing it down");
            self.supervisor.destroy().await;
        }
        result
    }

    /// A transfer that stopped part way leaves the worker mid-stream, so any
    /// failure after the command went out discards it.
    async fn settle_transfer<T>(&mut self, result: Result<T, BridgeError>) -> Result<T, BridgeError> {
        if let Err(err) = &result
            && !matches!(err, BridgeError::InvalidCommand { .. } | BridgeError::Spawn(_))
        {
            tracing::warn!(error = %err, "Transfer aborted; tearing the worker down");
            self.supervisor.destroy().await;
        }
        result
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::image::{ByteOrder, ComponentType, PixelType};

    const FAKE_WORKER: &str = r#"
tab=$(printf '\t')
while IFS= read -r line; do
  case "$line" in
    canRead*) echo "checking $line" >&2; printf 'true\n\n' ;;
    read*) printf 'abcdefgh' ;;
    write*"${tab}1${tab}8${tab}2${tab}0${tab}0${tab}0${tab}255${tab}128${tab}7${tab}")
      printf '4\n\n'; head -c 4 >/dev/null; printf '\n\n'; printf '\n\n' ;;
    write*) echo "unexpected write: $line" >&2; exit 5 ;;
    info*) printf 'SizeX\n100\nSizeY\n50\nSizeZ\n1\nSizeT\n1\nSizeC\n1\nPixelType\n1\nInterleaved\ntrue\nLittleEndian\nfalse\nRGBChannelCount\n1\nPixelsPhysicalSizeX\n1.0\nPixelsPhysicalSizeY\n1.0\nPixelsPhysicalSizeZ\n1.0\nPixelsPhysicalSizeT\n1.0\nPixelsPhysicalSizeC\n1.0\nComment\nfirst\\nsecond\n\n' ;;
    canWrite*) echo "no writer for this format" >&2; exit 4 ;;
  esac
done
"#;

    fn bridge_with(script: &str) -> Bridge {
        Bridge::new(
            BridgeConfig::new(WorkerCommand::new("sh").arg("-c").arg(script))
                .with_line_ending(LineEnding::Lf)
                .with_response_timeout(Some(Duration::from_secs(10))),
        )
    }

    fn bridge() -> Bridge {
        bridge_with(FAKE_WORKER)
    }

    fn gray8_2x2() -> (ImageInfo, IoRegion) {
        let info = ImageInfo {
            dimensions: [2, 2, 1, 1, 1],
            spacing: [1.0; 5],
            component_type: ComponentType::UChar,
            pixel_type: PixelType::Scalar,
            components: 1,
            byte_order: ByteOrder::LittleEndian,
            interleaved: false,
        };
        let region = IoRegion::full(&info);
        (info, region)
    }

    #[tokio::test]
    async fn worker_spawned_lazily() {
        let mut bridge = bridge();
        assert_eq!(bridge.worker_state(), WorkerState::NotStarted);

        assert!(bridge.can_read_file("/data/cells.tif").await.unwrap());
        assert_eq!(bridge.worker_state(), WorkerState::Running);

        bridge.reset().await;
        assert_eq!(bridge.worker_state(), WorkerState::NotStarted);
    }

    #[tokio::test]
    async fn info_rebuilds_metadata() {
        let mut bridge = bridge();
        bridge.metadata_mut().put("Stale", "value");

        let info = bridge.read_image_information("/data/cells.tif").await.unwrap();

        assert_eq!(info.dimensions, [100, 50, 1, 1, 1]);
        assert_eq!(info.byte_order, crate::image::ByteOrder::BigEndian);
        assert!(!bridge.metadata().has_key("Stale"));
        assert_eq!(bridge.metadata().get_str("Comment"), Some("first\nsecond"));
        assert_eq!(bridge.metadata().len(), 15);
        bridge.reset().await;
    }

    #[tokio::test]
    async fn transport_failure_tears_down_and_recovers() {
        let mut bridge = bridge();

        let err = bridge.can_write_file("/out/cells.xyz").await.unwrap_err();
        match &err {
            BridgeError::Transport { state, .. } => {
                assert_eq!(*state, WorkerState::ExitedNormally(4));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().ends_with(": no writer for this format"));
        assert_eq!(bridge.last_diagnostics(), "no writer for this format\n");
        assert_eq!(bridge.worker_state(), WorkerState::NotStarted);

        assert!(bridge.can_read_file("/data/cells.tif").await.unwrap());
        bridge.reset().await;
    }

    #[tokio::test]
    async fn closed_stdout_fails_instead_of_hanging() {
        let mut bridge = bridge_with("read -r line; exec 1>&-; exec sleep 30");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.can_read_file("/data/cells.tif"),
        )
        .await
        .expect("canRead should fail once stdout closes");

        match result {
            Err(BridgeError::Transport {
                operation, state, ..
            }) => {
                assert_eq!(operation, "canRead");
                assert_eq!(state, WorkerState::Running);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(bridge.worker_state(), WorkerState::NotStarted);
    }

    #[tokio::test]
    async fn read_overrun_discards_the_worker() {
        let mut bridge = bridge();
        let (info, region) = gray8_2x2();
        let mut pixels = vec![0u8; 4];

        let err = bridge
            .read("/data/cells.tif", &info, &region, &mut pixels)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Protocol { operation: "read", .. }));
        assert_eq!(bridge.worker_state(), WorkerState::NotStarted);
    }

    #[tokio::test]
    async fn write_sends_lookup_table_from_metadata() {
        let mut bridge = bridge();
        for (key, value) in [
            ("UseLUT", "true"),
            ("LUTBits", "8"),
            ("LUTLength", "2"),
            ("LUTR0", "0"),
            ("LUTG0", "0"),
            ("LUTB0", "0"),
            ("LUTR1", "255"),
            ("LUTG1", "128"),
            ("LUTB1", "7"),
        ] {
            bridge.metadata_mut().put(key, value);
        }
        let (info, region) = gray8_2x2();

        let stats = bridge
            .write("/out/cells.png", &info, &region, &[1, 2, 3, 4])
            .await
            .unwrap();

        assert_eq!(stats.planes, 1);
        assert_eq!(stats.chunk_acks, 1);
        assert_eq!(stats.plane_acks, 1);
        assert_eq!(stats.bytes, 4);
        assert_eq!(bridge.worker_state(), WorkerState::Running);
        bridge.reset().await;
    }

    #[tokio::test]
    async fn short_write_buffer_keeps_the_worker() {
        let mut bridge = bridge();
        assert!(bridge.can_read_file("/data/cells.tif").await.unwrap());
        let (info, region) = gray8_2x2();

        let err = bridge
            .write("/out/cells.png", &info, &region, &[1, 2, 3])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BridgeError::BufferSize {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(bridge.worker_state(), WorkerState::Running);
        assert!(bridge.can_read_file("/data/cells.tif").await.unwrap());
        bridge.reset().await;
    }
}
