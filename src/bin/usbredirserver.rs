use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser as ClapParser;
use log::{info, warn};

use usbredir::host::libusb::{DeviceSelector, LibusbContext, LibusbDevice};
use usbredir::{FilterRules, Host, HostFlags, HostReadError, Transport};

/// Expose one USB device to a remote guest over TCP. A single client is
/// served at a time; when it disconnects the device is released and the next
/// client is accepted.
#[derive(ClapParser, Debug)]
struct Cli {
    /// Device to export: vendor:product in hex (1d50:606f) or bus-addr in
    /// decimal (003:012)
    device: String,
    #[arg(short = 'p', long = "port", default_value_t = 4000)]
    port: u16,
    /// Device filter rules, e.g. "0x03,-1,-1,-1,0|-1,-1,-1,-1,1"
    #[arg(long = "filter")]
    filter: Option<String>,
}

fn parse_selector(spec: &str) -> anyhow::Result<DeviceSelector> {
    if let Some((vendor, product)) = spec.split_once(':') {
        let vendor = u16::from_str_radix(vendor, 16).context("bad vendor id")?;
        let product = u16::from_str_radix(product, 16).context("bad product id")?;
        return Ok(DeviceSelector::VendorProduct(vendor, product));
    }
    if let Some((bus, addr)) = spec.split_once('-') {
        let bus = bus.parse().context("bad bus number")?;
        let addr = addr.parse().context("bad device address")?;
        return Ok(DeviceSelector::BusAddress(bus, addr));
    }
    bail!("device must be vendor:product or bus-addr, got '{spec}'");
}

struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }
}

/// Bridge one client connection until it drops or the device goes away.
fn serve_client(
    ctx: &Arc<LibusbContext>,
    selector: DeviceSelector,
    filter: Option<FilterRules>,
    stream: TcpStream,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    stream
        .set_read_timeout(Some(Duration::from_millis(10)))
        .context("setting read timeout")?;
    let _ = stream.set_nodelay(true);

    let dev = LibusbDevice::open(ctx, selector).context("opening usb device")?;
    info!("exporting {}", dev.label());

    let host = Host::new(
        Box::new(TcpTransport { stream }),
        concat!("usbredirserver ", env!("CARGO_PKG_VERSION")),
        HostFlags::default(),
        filter,
    );
    host.set_device(Some(dev)).context("claiming usb device")?;

    while running.load(Ordering::SeqCst) {
        match host.do_read() {
            Ok(()) => {}
            Err(HostReadError::Parse) => warn!("dropped a malformed packet"),
            Err(e) => {
                info!("closing connection: {e}");
                break;
            }
        }
        if host.has_data_to_write() {
            if let Err(e) = host.do_write() {
                info!("closing connection: {e}");
                break;
            }
        }
    }

    host.set_device(None).ok();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let selector = parse_selector(&cli.device)?;
    let filter = match &cli.filter {
        Some(rules) => Some(
            FilterRules::parse(
                rules,
                usbredir::filter::DEFAULT_TOKEN_SEP,
                usbredir::filter::DEFAULT_RULE_SEP,
            )
            .map_err(|e| anyhow::anyhow!("bad filter string: {e}"))?,
        ),
        None => None,
    };

    let ctx = LibusbContext::new().context("initializing libusb")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    let listener =
        TcpListener::bind(("0.0.0.0", cli.port)).with_context(|| format!("binding port {}", cli.port))?;
    listener.set_nonblocking(true)?;
    info!("listening on port {}", cli.port);

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("client connected from {peer}");
                if let Err(e) = serve_client(&ctx, selector, filter.clone(), stream, &running) {
                    warn!("client session ended with error: {e:#}");
                }
                info!("client gone, waiting for the next connection");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    info!("shutting down");
    Ok(())
}
