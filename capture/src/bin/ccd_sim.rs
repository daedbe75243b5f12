use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capture::camera_interface::mock::MockSensor;
use capture::camera_interface::{DriverCapabilities, PropertyState};
use capture::config_storage::ConfigStorage;
use capture::delivery::UploadMode;
use capture::external::{ExternalEvent, Optics, PierSide};
use capture::formats::CaptureFormat;
use capture::{CcdDevice, ChipKind, Command, SensorDriver};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Upload {
    Client,
    Local,
    Both,
}

impl From<Upload> for UploadMode {
    fn from(upload: Upload) -> Self {
        match upload {
            Upload::Client => UploadMode::Client,
            Upload::Local => UploadMode::Local,
            Upload::Both => UploadMode::Both,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated CCD capture and delivery")]
struct Args {
    #[arg(long, default_value = "CCD Simulator")]
    name: String,

    #[arg(long, default_value = "1280")]
    width: u32,

    #[arg(long, default_value = "1024")]
    height: u32,

    #[arg(long, default_value = "16", help = "Bits per pixel (8, 16 or 32)")]
    bpp: u8,

    #[arg(long, default_value = "5.2", help = "Pixel pitch in microns")]
    pixel_size: f64,

    #[arg(short, long, default_value = "1.0", help = "Exposure time in seconds")]
    exposure: f64,

    #[arg(short, long, default_value = "1", help = "Frames to take back to back")]
    count: u32,

    #[arg(long, value_enum, default_value = "local")]
    upload: Upload,

    #[arg(long, help = "Directory for saved frames (defaults to $HOME)")]
    directory: Option<PathBuf>,

    #[arg(long, default_value = "IMAGE_XXX")]
    prefix: String,

    #[arg(long, help = "Compress frames sent to clients")]
    compress: bool,

    #[arg(long, help = "Stream frames over a websocket")]
    websocket: bool,

    #[arg(long, default_value_t = capture::stream::DEFAULT_WS_PORT)]
    ws_port: u16,

    #[arg(
        long,
        default_value_t = capture::stream::DEFAULT_STREAM_BACKLOG,
        help = "Frames a websocket client may fall behind before skipping"
    )]
    stream_backlog: usize,

    #[arg(long, help = "Cooler target in Celsius")]
    target_temp: Option<f64>,

    #[arg(long, default_value = "0", help = "Max cooler ramp in Celsius per minute")]
    ramp_slope: f64,

    #[arg(long, num_args = 2, value_names = ["RA_HOURS", "DEC_DEG"])]
    pointing: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["LAT_DEG", "LONG_DEG"])]
    site: Option<Vec<f64>>,

    #[arg(long, default_value = "1000", help = "Focal length in mm")]
    focal_length: f64,

    #[arg(long, help = "Load and persist settings under this directory")]
    config_dir: Option<PathBuf>,
}

fn pair(values: Option<&[f64]>) -> Option<(f64, f64)> {
    match values? {
        [a, b] => Some((*a, *b)),
        _ => None,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let capabilities = DriverCapabilities {
        can_abort: true,
        can_bin: true,
        can_subframe: true,
        has_cooler: true,
        has_shutter: true,
        has_streaming: true,
        has_websocket: true,
        ..Default::default()
    };
    let mut device = CcdDevice::new(args.name.clone(), MockSensor::new(capabilities))?
        .with_stream_backlog(args.stream_backlog);
    device
        .set_ccd_params(
            ChipKind::Primary,
            args.width,
            args.height,
            args.bpp,
            args.pixel_size,
            args.pixel_size,
        )
        .context("invalid sensor parameters")?;
    device
        .formats_mut()
        .add(CaptureFormat::new("MONO", "Mono", args.bpp).as_default());

    if let Some(dir) = &args.config_dir {
        let storage = ConfigStorage::with_path(dir.clone());
        if let Some(saved) = storage.get_device_settings(&args.name) {
            let settings = saved.context("failed to load saved settings")?;
            info!("Restoring settings for {}", args.name);
            device.apply_settings(settings)?;
        }
        device = device.with_config(Box::new(storage));
    }

    let now = Instant::now();
    let directory = match args.directory {
        Some(dir) => dir,
        None => device.settings().upload.directory,
    };
    let commands = [
        Command::SetUploadTarget {
            directory,
            prefix: args.prefix.clone(),
        },
        Command::SetUploadMode(args.upload.into()),
        Command::SetCompression {
            chip: ChipKind::Primary,
            enabled: args.compress,
        },
        Command::SetWebSocketPort(args.ws_port),
        Command::SetWebSocket {
            enabled: args.websocket,
        },
        Command::SetTemperatureRamp {
            slope: args.ramp_slope,
            threshold: 0.2,
        },
        Command::SetFastExposure {
            enabled: args.count > 1,
        },
        Command::SetFastExposureCount(args.count),
    ];
    for command in commands {
        device.handle_command(command, now)?;
    }

    let events = device.event_sender();
    events.send(ExternalEvent::OpticsChanged {
        primary: Optics::new(args.focal_length, args.focal_length / 5.0),
        guide: Optics::default(),
    });
    if let Some((ra, dec)) = pair(args.pointing.as_deref()) {
        events.send(ExternalEvent::TelescopeCoordinatesChanged {
            ra_hours: ra,
            dec_degrees: dec,
        });
        events.send(ExternalEvent::PierSideChanged(PierSide::West));
    }
    if let Some((lat, long)) = pair(args.site.as_deref()) {
        events.send(ExternalEvent::SiteChanged {
            latitude: lat,
            longitude: long,
        });
    }

    if let Some(target) = args.target_temp {
        device.handle_command(Command::SetTemperature(target), now)?;
    }

    let blobs = device.blob_channel().subscribe();
    device.handle_command(
        Command::StartExposure {
            chip: ChipKind::Primary,
            duration: args.exposure,
        },
        Instant::now(),
    )?;

    loop {
        let period = device.poll(Instant::now());
        for blob in blobs.try_iter() {
            info!("Client received {} bytes as {}", blob.bytes.len(), blob.format);
        }

        let status = device.chip(ChipKind::Primary).status();
        if status != PropertyState::Busy && !device.deliveries_in_flight() {
            if let Some(e) = device.take_last_error() {
                warn!("Capture ended with error: {}", e);
            }
            break;
        }
        std::thread::sleep(period.min(Duration::from_millis(100)));
    }

    if let Some(path) = device.last_saved() {
        info!("Last frame saved to {}", path.display());
    }
    info!(
        "Sensor temperature {:.2} C, {} exposures taken",
        device.driver().temperature(),
        device.driver().exposures_started()
    );
    Ok(())
}
