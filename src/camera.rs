//! Camera capability: the settings model the server validates and applies,
//! the trait real hardware backends implement, and a synthetic test-pattern
//! implementation used by tests and the stock daemon.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::protocol::{AgcMode, AwbMode, ExposureMode, Fraction, MeteringMode};
use crate::unix_time;

/// Full camera configuration. Mutating setters validate their arguments and
/// leave the struct untouched on failure, so a clone can be prepared and
/// only committed once the camera accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    pub awb_mode: AwbMode,
    pub awb_red: f64,
    pub awb_blue: f64,
    pub exposure_mode: ExposureMode,
    /// Manual exposure speed in milliseconds; meaningful only when
    /// `exposure_mode` is `Off`.
    pub exposure_speed: f64,
    pub ev: i32,
    pub iso: u32,
    pub metering_mode: MeteringMode,
    pub agc_mode: AgcMode,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub denoise: bool,
    pub quality: u8,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: Fraction::new(30, 1),
            awb_mode: AwbMode::Auto,
            awb_red: 1.0,
            awb_blue: 1.0,
            exposure_mode: ExposureMode::Auto,
            exposure_speed: 33.333,
            ev: 0,
            iso: 0,
            metering_mode: MeteringMode::Average,
            agc_mode: AgcMode::Auto,
            brightness: 50,
            contrast: 0,
            saturation: 0,
            hflip: false,
            vflip: false,
            denoise: true,
            quality: 85,
        }
    }
}

impl CameraSettings {
    /// Longest manual exposure the current framerate permits, in ms.
    fn max_exposure_ms(&self) -> f64 {
        1000.0 / self.framerate.as_f64()
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("resolution {width}x{height} has a zero dimension");
        }
        if width > 4096 || height > 4096 {
            bail!("resolution {width}x{height} exceeds the 4096x4096 sensor limit");
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn set_framerate(&mut self, rate: Fraction) -> Result<()> {
        let fps = rate.as_f64();
        if !(1.0..=90.0).contains(&fps) {
            bail!("framerate {rate} outside 1-90 fps");
        }
        if self.exposure_mode == ExposureMode::Off && self.exposure_speed > 1000.0 / fps {
            bail!(
                "framerate {rate} conflicts with fixed exposure speed {:.3}ms",
                self.exposure_speed
            );
        }
        self.framerate = rate;
        Ok(())
    }

    /// Gains take effect only when the mode is `off`; with any other mode
    /// they are accepted and ignored, matching the camera firmware.
    pub fn set_awb(&mut self, mode: AwbMode, gains: Option<(f64, f64)>) -> Result<()> {
        if mode == AwbMode::Off {
            if let Some((red, blue)) = gains {
                if !(0.0..=8.0).contains(&red) || !(0.0..=8.0).contains(&blue) {
                    bail!("AWB gains {red:.2}/{blue:.2} outside 0.0-8.0");
                }
                self.awb_red = red;
                self.awb_blue = blue;
            }
        }
        self.awb_mode = mode;
        Ok(())
    }

    /// A manual speed takes effect only when the mode is `off`.
    pub fn set_exposure(&mut self, mode: ExposureMode, speed: Option<f64>) -> Result<()> {
        if mode == ExposureMode::Off {
            if let Some(speed) = speed {
                if speed <= 0.0 {
                    bail!("exposure speed {speed:.3}ms is not positive");
                }
                if speed > self.max_exposure_ms() {
                    bail!(
                        "exposure speed {speed:.3}ms exceeds frame time {:.3}ms",
                        self.max_exposure_ms()
                    );
                }
                self.exposure_speed = speed;
            }
        }
        self.exposure_mode = mode;
        Ok(())
    }

    pub fn set_iso(&mut self, iso: u32) -> Result<()> {
        if iso > 1600 {
            bail!("ISO {iso} outside 0-1600");
        }
        self.iso = iso;
        Ok(())
    }

    pub fn set_levels(
        &mut self,
        brightness: i32,
        contrast: i32,
        saturation: i32,
        ev: i32,
    ) -> Result<()> {
        if !(0..=100).contains(&brightness) {
            bail!("brightness {brightness} outside 0-100");
        }
        if !(-100..=100).contains(&contrast) {
            bail!("contrast {contrast} outside -100-100");
        }
        if !(-100..=100).contains(&saturation) {
            bail!("saturation {saturation} outside -100-100");
        }
        if !(-24..=24).contains(&ev) {
            bail!("exposure compensation {ev} outside -24-24");
        }
        self.brightness = brightness;
        self.contrast = contrast;
        self.saturation = saturation;
        self.ev = ev;
        Ok(())
    }

    pub fn set_quality(&mut self, quality: u8) -> Result<()> {
        if !(1..=100).contains(&quality) {
            bail!("quality {quality} outside 1-100");
        }
        self.quality = quality;
        Ok(())
    }
}

/// One captured image.
#[derive(Debug, Clone)]
pub struct Frame {
    /// UNIX timestamp at which the frame was taken.
    pub timestamp: f64,
    pub data: Vec<u8>,
}

/// The opaque camera handle the server drives. The coordinator never
/// touches this; hardware backends live outside this crate.
pub trait Camera: Send {
    /// Apply a validated settings block to the hardware.
    fn configure(&mut self, settings: &CameraSettings) -> Result<()>;

    /// Capture `count` frames, optionally from the video port, optionally
    /// waiting until the wall clock reaches `at` (UNIX seconds) before the
    /// first frame.
    fn capture(&mut self, count: u32, use_video_port: bool, at: Option<f64>) -> Result<Vec<Frame>>;

    /// Pulse the identification LED. Must return promptly; the pulsing
    /// happens behind the call.
    fn blink(&mut self, duration: Duration) -> Result<()>;

    /// Release the hardware.
    fn close(&mut self) -> Result<()>;
}

/// Software camera producing deterministic JPEG-shaped test frames. Backs
/// the test suite and the stock daemon.
pub struct SyntheticCamera {
    settings: CameraSettings,
    counter: u64,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self { settings: CameraSettings::default(), counter: 0 }
    }

    pub fn with_settings(settings: CameraSettings) -> Self {
        Self { settings, counter: 0 }
    }

    fn frame_bytes(&mut self) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        let pixels = self.settings.width as usize * self.settings.height as usize;
        let body = (pixels / 8) * self.settings.quality as usize / 100 + 64;
        let mut data = Vec::with_capacity(body + 4);
        data.extend_from_slice(&[0xFF, 0xD8]); // SOI
        let mut state = self.counter;
        for _ in 0..body {
            // xorshift keeps frames distinct without pulling in an RNG here
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            data.push(state as u8);
        }
        data.extend_from_slice(&[0xFF, 0xD9]); // EOI
        data
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera for SyntheticCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        log::debug!(
            "synthetic camera reconfigured: {}x{} @ {}",
            settings.width,
            settings.height,
            settings.framerate
        );
        self.settings = settings.clone();
        Ok(())
    }

    fn capture(&mut self, count: u32, use_video_port: bool, at: Option<f64>) -> Result<Vec<Frame>> {
        if let Some(at) = at {
            let delay = at - unix_time();
            if delay > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(delay));
            }
        }
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(Frame { timestamp: unix_time(), data: self.frame_bytes() });
        }
        log::info!(
            "captured {count} synthetic frame(s) from {} port",
            if use_video_port { "video" } else { "still" }
        );
        Ok(frames)
    }

    fn blink(&mut self, duration: Duration) -> Result<()> {
        log::info!("synthetic camera blinking for {:.1}s", duration.as_secs_f64());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        log::debug!("synthetic camera closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_limits() {
        let mut settings = CameraSettings::default();
        assert!(settings.set_resolution(1920, 1080).is_ok());
        assert!(settings.set_resolution(0, 1080).is_err());
        assert!(settings.set_resolution(1920, 8192).is_err());
        assert_eq!((settings.width, settings.height), (1920, 1080));
    }

    #[test]
    fn test_framerate_range() {
        let mut settings = CameraSettings::default();
        assert!(settings.set_framerate(Fraction::new(90, 1)).is_ok());
        assert!(settings.set_framerate(Fraction::new(91, 1)).is_err());
        assert!(settings.set_framerate(Fraction::new(1, 2)).is_err());
        assert!(settings.set_framerate(Fraction::new(15, 2)).is_ok());
    }

    #[test]
    fn test_framerate_respects_fixed_exposure() {
        let mut settings = CameraSettings::default();
        settings.set_framerate(Fraction::new(10, 1)).unwrap();
        settings.set_exposure(ExposureMode::Off, Some(80.0)).unwrap();
        // 30fps allows at most 33.3ms, but 80ms is locked in
        assert!(settings.set_framerate(Fraction::new(30, 1)).is_err());
        assert!(settings.set_framerate(Fraction::new(12, 1)).is_ok());
    }

    #[test]
    fn test_awb_gains_only_apply_when_off() {
        let mut settings = CameraSettings::default();
        settings.set_awb(AwbMode::Auto, Some((3.0, 3.0))).unwrap();
        assert_eq!(settings.awb_red, 1.0);
        settings.set_awb(AwbMode::Off, Some((1.5, 2.5))).unwrap();
        assert_eq!(settings.awb_red, 1.5);
        assert_eq!(settings.awb_blue, 2.5);
        assert!(settings.set_awb(AwbMode::Off, Some((9.0, 1.0))).is_err());
        // failed call left the previous gains in place
        assert_eq!(settings.awb_red, 1.5);
    }

    #[test]
    fn test_exposure_speed_bounded_by_frame_time() {
        let mut settings = CameraSettings::default();
        assert!(settings.set_exposure(ExposureMode::Off, Some(33.0)).is_ok());
        assert!(settings.set_exposure(ExposureMode::Off, Some(34.0)).is_err());
        assert!(settings.set_exposure(ExposureMode::Off, Some(0.0)).is_err());
        // speed is ignored in auto mode, however absurd
        assert!(settings.set_exposure(ExposureMode::Auto, Some(5000.0)).is_ok());
        assert!((settings.exposure_speed - 33.0).abs() < 1e-9);
    }

    #[test]
    fn test_level_ranges() {
        let mut settings = CameraSettings::default();
        assert!(settings.set_levels(100, -100, 100, 24).is_ok());
        assert!(settings.set_levels(101, 0, 0, 0).is_err());
        assert!(settings.set_levels(50, -101, 0, 0).is_err());
        assert!(settings.set_levels(50, 0, 101, 0).is_err());
        assert!(settings.set_levels(50, 0, 0, 25).is_err());
    }

    #[test]
    fn test_iso_and_quality_ranges() {
        let mut settings = CameraSettings::default();
        assert!(settings.set_iso(0).is_ok());
        assert!(settings.set_iso(1600).is_ok());
        assert!(settings.set_iso(1601).is_err());
        assert!(settings.set_quality(1).is_ok());
        assert!(settings.set_quality(0).is_err());
        assert!(settings.set_quality(101).is_err());
    }

    #[test]
    fn test_synthetic_capture_produces_frames() {
        let mut camera = SyntheticCamera::new();
        let frames = camera.capture(3, false, None).unwrap();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
            assert_eq!(&frame.data[frame.data.len() - 2..], &[0xFF, 0xD9]);
            assert!(frame.timestamp > 0.0);
        }
        // consecutive frames differ
        assert_ne!(frames[0].data, frames[1].data);
    }

    #[test]
    fn test_synthetic_capture_zero_count_is_noop() {
        let mut camera = SyntheticCamera::new();
        let frames = camera.capture(0, false, None).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_synthetic_capture_waits_for_sync_time() {
        let mut camera = SyntheticCamera::new();
        let target = unix_time() + 0.15;
        let frames = camera.capture(1, false, Some(target)).unwrap();
        assert!(frames[0].timestamp >= target - 0.001);
        assert!(frames[0].timestamp - target < 0.1);
    }
}
