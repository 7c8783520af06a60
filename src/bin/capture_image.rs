use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, ValueEnum};
use image::GrayImage;
use log::{info, warn};

use pointgrey_camera::abstract_camera::{Gain, Status, VideoMode};
use pointgrey_camera::image_sdk::{ImageBus, ImageDevice};
use pointgrey_camera::image_sink::ImageSink;
use pointgrey_camera::pointgrey_camera::PointGreyCamera;
use pointgrey_camera::select_camera::{CameraId, enumerate_cameras};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Encoding {
    Y8,
    Y16,
}

/// Acquires a run of frames from a camera and saves the last one. The camera
/// is simulated: it serves the image given with --image (or a test pattern).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Output file; the extension selects the image format.
    #[arg(short, long)]
    output: PathBuf,

    /// Image served by the simulated camera.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Serial number of the camera to use. Defaults to the first camera.
    #[arg(short, long)]
    serial: Option<u32>,

    /// Number of frames to acquire.
    #[arg(short, long, default_value_t = 10,
          value_parser = clap::value_parser!(u32).range(1..))]
    frames: u32,

    /// Exposure time in milliseconds. Auto exposure if not given.
    #[arg(short, long)]
    exposure_ms: Option<f64>,

    /// Gain as a fraction of the camera's maximum gain. Auto gain if not given.
    #[arg(short, long)]
    gain: Option<f64>,

    #[arg(long, value_enum, default_value_t = Encoding::Y8)]
    encoding: Encoding,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let image = match &args.image {
        Some(path) => image::open(path).unwrap().into_luma8(),
        None => GrayImage::from_fn(640, 480, |x, y| image::Luma([((x + y) % 256) as u8])),
    };
    let bus = ImageBus::new(vec![ImageDevice::new(12345678, image)]);

    let serial_numbers = enumerate_cameras(&bus).unwrap();
    info!("Found {} cameras: {:?}", serial_numbers.len(), serial_numbers);
    let serial = match args.serial {
        Some(s) => s,
        None => *serial_numbers.first().expect("No camera??"),
    };

    let sink = Arc::new(ImageSink::new(1));
    let mut camera = PointGreyCamera::new(
        &bus, &CameraId::SerialNumber(serial), sink.clone()).unwrap();
    let info = camera.camera_info();
    info!("camera: {} {} ({}), {:?}", info.vendor_name, info.model_name,
          info.sensor_resolution, camera.detector_size());

    if let Some(exp_ms) = args.exposure_ms {
        camera.set_exposure_duration(Duration::from_secs_f64(exp_ms / 1000.0)).unwrap();
    }
    if let Some(gain) = args.gain {
        camera.set_gain(Gain::new(gain)).unwrap();
    }
    camera.set_video_mode(match args.encoding {
        Encoding::Y8 => VideoMode::Y8,
        Encoding::Y16 => VideoMode::Y16,
    }).unwrap();

    camera.set_frame_count(args.frames);
    camera.prepare_acquisition();
    camera.start_acquisition().unwrap();
    while camera.acquired_frame_count() < args.frames &&
        camera.status() != Status::Fault
    {
        thread::sleep(Duration::from_millis(5));
    }
    camera.stop_acquisition().unwrap();
    if camera.status() == Status::Fault {
        warn!("Acquisition faulted after {} frames", camera.acquired_frame_count());
    }

    info!("Acquired {} frames, exposure {:?}, gain {}",
          camera.acquired_frame_count(),
          camera.get_exposure_duration().unwrap(),
          camera.get_gain().unwrap());
    if let Some(start) = sink.start_timestamp() {
        info!("Acquisition started at {}",
              start.with_timezone(&Local).format("%d/%m/%Y %T"));
    }
    match sink.latest_frame() {
        Some(frame) => {
            frame.save(&args.output).unwrap();
            info!("Saved {:?} frame to {}", frame.dimensions(), args.output.display());
        },
        None => warn!("No frame to save"),
    }
}
