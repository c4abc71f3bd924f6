//! Open a source, read a few hundred frames and print its health.
//!
//! ```text
//! cargo run -p vigil-eye --example watch_source -- http://192.168.0.107:8080/video
//! cargo run -p vigil-eye --example watch_source --features opencv -- rtsp://192.168.0.107:8080/h264_ulaw.sdp
//! ```

use vigil_eye::config::SourceConfig;
use vigil_eye::{SourceAcquirer, SourceDescriptor};

const FRAMES: u32 = 300;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let input = std::env::args().nth(1).unwrap_or_else(|| "0".to_string());
    let descriptor = SourceDescriptor::parse(&input)?;
    let acquirer = SourceAcquirer::new(SourceConfig::default())?;

    let mut handle = acquirer.open(&descriptor)?;
    if let Some(transport) = handle.active_transport() {
        println!("Negotiated {} transport", transport);
    }

    let mut brightness = 0.0;
    let mut read = 0;
    while read < FRAMES {
        match handle.read() {
            Ok(frame) => {
                if let Some(degraded) = frame.degraded {
                    println!(
                        "{} dark frames in a row, consider {}",
                        degraded.consecutive_dark, degraded.suggested_address
                    );
                }
                brightness += frame.frame.mean_luminance();
                read += 1;
            }
            Err(e) => {
                println!("Stopped early: {}", e);
                break;
            }
        }
    }

    let health = handle.health();
    println!("Frames read:       {}", read);
    println!("Mean luminance:    {:.1}", if read > 0 { brightness / read as f64 } else { 0.0 });
    println!("Delivered/dropped: {}/{}", health.frames_delivered, health.frames_dropped);
    println!("Decode failures:   {}", health.consecutive_decode_failures);
    println!("Current fps:       {}", health.fps);

    handle.release();
    Ok(())
}
