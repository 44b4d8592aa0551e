//! ASCII wire protocol: command/response frames and the vocabulary types
//! they carry (fractions, camera modes, status and image listings).

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

/// UDP port servers listen on unless reconfigured.
pub const DEFAULT_PORT: u16 = 5647;

/// Version string exchanged in HELLO responses. Compared byte-exact by the
/// client; there is no negotiation.
pub const VERSION: &str = "0.4";

/// Largest datagram either side will accept.
pub const MAX_DATAGRAM: usize = 512;

// Delivery timing shared by the client and server retry machinery
pub mod timing {
    use std::time::Duration;

    /// Total time a transmission is repeated before giving up.
    pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bounds for the randomised gap between repeats of one transmission.
    pub const RETRY_MIN: Duration = Duration::from_millis(100);
    pub const RETRY_MAX: Duration = Duration::from_millis(400);

    /// How long BLINK pulses the camera LED.
    pub const BLINK: Duration = Duration::from_secs(5);

    /// Sessions with no traffic for this long are evicted.
    pub const SESSION_IDLE: Duration = Duration::from_secs(300);
}

/// A framerate expressed as a rational number, rendered `n` when the
/// denominator is 1 and `n/d` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl From<u32> for Fraction {
    fn from(num: u32) -> Self {
        Self { num, den: 1 }
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for Fraction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (num, den) = match s.split_once('/') {
            Some((n, d)) => (n, d),
            None => (s, "1"),
        };
        let num: u32 = num.parse().map_err(|_| anyhow!("invalid fraction {s:?}"))?;
        let den: u32 = den.parse().map_err(|_| anyhow!("invalid fraction {s:?}"))?;
        if den == 0 {
            bail!("invalid fraction {s:?}: zero denominator");
        }
        Ok(Self { num, den })
    }
}

/// Auto-white-balance modes understood by the camera firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwbMode {
    Off,
    Auto,
    Sunlight,
    Cloudy,
    Shade,
    Tungsten,
    Fluorescent,
    Incandescent,
    Flash,
    Horizon,
}

impl AwbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwbMode::Off => "off",
            AwbMode::Auto => "auto",
            AwbMode::Sunlight => "sunlight",
            AwbMode::Cloudy => "cloudy",
            AwbMode::Shade => "shade",
            AwbMode::Tungsten => "tungsten",
            AwbMode::Fluorescent => "fluorescent",
            AwbMode::Incandescent => "incandescent",
            AwbMode::Flash => "flash",
            AwbMode::Horizon => "horizon",
        }
    }
}

impl fmt::Display for AwbMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AwbMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "off" => AwbMode::Off,
            "auto" => AwbMode::Auto,
            "sunlight" => AwbMode::Sunlight,
            "cloudy" => AwbMode::Cloudy,
            "shade" => AwbMode::Shade,
            "tungsten" => AwbMode::Tungsten,
            "fluorescent" => AwbMode::Fluorescent,
            "incandescent" => AwbMode::Incandescent,
            "flash" => AwbMode::Flash,
            "horizon" => AwbMode::Horizon,
            _ => bail!("invalid AWB mode {s:?}"),
        })
    }
}

/// Exposure is either fully automatic or fixed at a manual speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureMode {
    Auto,
    Off,
}

impl ExposureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureMode::Auto => "auto",
            ExposureMode::Off => "off",
        }
    }
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExposureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "auto" => ExposureMode::Auto,
            "off" => ExposureMode::Off,
            _ => bail!("invalid exposure mode {s:?}"),
        })
    }
}

/// Auto-gain-control algorithms. `Off` freezes the sensor gains at their
/// current values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgcMode {
    Off,
    Auto,
    Night,
    NightPreview,
    Backlight,
    Spotlight,
    Sports,
    Snow,
    Beach,
    VeryLong,
    FixedFps,
    AntiShake,
    Fireworks,
}

impl AgcMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgcMode::Off => "off",
            AgcMode::Auto => "auto",
            AgcMode::Night => "night",
            AgcMode::NightPreview => "nightpreview",
            AgcMode::Backlight => "backlight",
            AgcMode::Spotlight => "spotlight",
            AgcMode::Sports => "sports",
            AgcMode::Snow => "snow",
            AgcMode::Beach => "beach",
            AgcMode::VeryLong => "verylong",
            AgcMode::FixedFps => "fixedfps",
            AgcMode::AntiShake => "antishake",
            AgcMode::Fireworks => "fireworks",
        }
    }
}

impl fmt::Display for AgcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgcMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "off" => AgcMode::Off,
            "auto" => AgcMode::Auto,
            "night" => AgcMode::Night,
            "nightpreview" => AgcMode::NightPreview,
            "backlight" => AgcMode::Backlight,
            "spotlight" => AgcMode::Spotlight,
            "sports" => AgcMode::Sports,
            "snow" => AgcMode::Snow,
            "beach" => AgcMode::Beach,
            "verylong" => AgcMode::VeryLong,
            "fixedfps" => AgcMode::FixedFps,
            "antishake" => AgcMode::AntiShake,
            "fireworks" => AgcMode::Fireworks,
            _ => bail!("invalid AGC mode {s:?}"),
        })
    }
}

/// Light metering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteringMode {
    Average,
    Spot,
    Backlit,
    Matrix,
}

impl MeteringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeteringMode::Average => "average",
            MeteringMode::Spot => "spot",
            MeteringMode::Backlit => "backlit",
            MeteringMode::Matrix => "matrix",
        }
    }
}

impl fmt::Display for MeteringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeteringMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "average" => MeteringMode::Average,
            "spot" => MeteringMode::Spot,
            "backlit" => MeteringMode::Backlit,
            "matrix" => MeteringMode::Matrix,
            _ => bail!("invalid metering mode {s:?}"),
        })
    }
}

/// Every verb a client can issue. The codec turns wire frames into this enum
/// and back; the server dispatches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello { timestamp: f64 },
    Ack,
    Status,
    Resolution { width: u32, height: u32 },
    Framerate { rate: Fraction },
    Awb { mode: AwbMode, gains: Option<(f64, f64)> },
    Exposure { mode: ExposureMode, speed: Option<f64> },
    Iso { iso: u32 },
    Metering { mode: MeteringMode },
    Levels { brightness: i32, contrast: i32, saturation: i32, ev: i32 },
    Flip { horizontal: bool, vertical: bool },
    Agc { mode: AgcMode },
    Denoise { enabled: bool },
    Quality { quality: u8 },
    Blink,
    Capture { count: u32, video_port: bool, sync: Option<f64> },
    List,
    Clear,
    Send { index: usize, port: u16 },
}

impl Command {
    /// Render the command body (everything after the sequence number).
    fn render(&self) -> String {
        match self {
            Command::Hello { timestamp } => format!("HELLO {timestamp:.6}"),
            Command::Ack => "ACK".to_string(),
            Command::Status => "STATUS".to_string(),
            Command::Resolution { width, height } => format!("RESOLUTION {width} {height}"),
            Command::Framerate { rate } => format!("FRAMERATE {rate}"),
            Command::Awb { mode, gains: Some((red, blue)) } => {
                format!("AWB {mode} {red:.2} {blue:.2}")
            }
            Command::Awb { mode, gains: None } => format!("AWB {mode}"),
            Command::Exposure { mode, speed: Some(speed) } => {
                format!("EXPOSURE {mode} {speed:.3}")
            }
            Command::Exposure { mode, speed: None } => format!("EXPOSURE {mode}"),
            Command::Iso { iso } => format!("ISO {iso}"),
            Command::Metering { mode } => format!("METERING {mode}"),
            Command::Levels { brightness, contrast, saturation, ev } => {
                format!("LEVELS {brightness} {contrast} {saturation} {ev}")
            }
            Command::Flip { horizontal, vertical } => {
                format!("FLIP {} {}", *horizontal as u8, *vertical as u8)
            }
            Command::Agc { mode } => format!("AGC {mode}"),
            Command::Denoise { enabled } => format!("DENOISE {}", *enabled as u8),
            Command::Quality { quality } => format!("QUALITY {quality}"),
            Command::Blink => "BLINK".to_string(),
            Command::Capture { count, video_port, sync: Some(sync) } => {
                format!("CAPTURE {count} {} {sync:.6}", *video_port as u8)
            }
            Command::Capture { count, video_port, sync: None } => {
                format!("CAPTURE {count} {}", *video_port as u8)
            }
            Command::List => "LIST".to_string(),
            Command::Clear => "CLEAR".to_string(),
            Command::Send { index, port } => format!("SEND {index} {port}"),
        }
    }

    /// Encode a full command frame with its sequence number.
    pub fn encode(&self, seq: u64) -> String {
        format!("{seq} {}", self.render())
    }
}

fn parse_seq(token: &str) -> Result<u64> {
    let seq: u64 = token
        .parse()
        .map_err(|_| anyhow!("invalid sequence number {token:?}"))?;
    if seq == 0 {
        bail!("sequence number 0 is reserved");
    }
    Ok(seq)
}

fn parse_bool(token: &str) -> Result<bool> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => bail!("expected 0 or 1, got {token:?}"),
    }
}

fn parse_float(token: &str) -> Result<f64> {
    let value: f64 = token
        .parse()
        .map_err(|_| anyhow!("invalid number {token:?}"))?;
    if !value.is_finite() {
        bail!("invalid number {token:?}");
    }
    Ok(value)
}

fn parse_timestamp(token: &str) -> Result<f64> {
    let ts = parse_float(token)?;
    if ts < 0.0 {
        bail!("invalid timestamp {token:?}");
    }
    Ok(ts)
}

fn expect_args(verb: &str, args: &[&str], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        bail!("wrong number of arguments for {verb}");
    }
    Ok(())
}

/// Decode a command frame into `(seq, command)`. Strict: the first token
/// must be a positive integer and the verb must be known; trailing
/// whitespace is tolerated.
pub fn parse_command(frame: &str) -> Result<(u64, Command)> {
    let frame = frame.trim_end();
    let mut tokens = frame.split_whitespace();
    let seq = parse_seq(tokens.next().ok_or_else(|| anyhow!("empty frame"))?)?;
    let verb = tokens.next().ok_or_else(|| anyhow!("missing command"))?;
    let args: Vec<&str> = tokens.collect();

    let command = match verb {
        "HELLO" => {
            expect_args(verb, &args, 1, 1)?;
            Command::Hello { timestamp: parse_timestamp(args[0])? }
        }
        "ACK" => {
            expect_args(verb, &args, 0, 0)?;
            Command::Ack
        }
        "STATUS" => {
            expect_args(verb, &args, 0, 0)?;
            Command::Status
        }
        "RESOLUTION" => {
            expect_args(verb, &args, 2, 2)?;
            let width = args[0].parse().map_err(|_| anyhow!("invalid width {:?}", args[0]))?;
            let height = args[1].parse().map_err(|_| anyhow!("invalid height {:?}", args[1]))?;
            Command::Resolution { width, height }
        }
        "FRAMERATE" => {
            expect_args(verb, &args, 1, 1)?;
            Command::Framerate { rate: args[0].parse()? }
        }
        "AWB" => {
            expect_args(verb, &args, 1, 3)?;
            let mode = args[0].parse()?;
            let gains = match args.len() {
                1 => None,
                3 => Some((parse_float(args[1])?, parse_float(args[2])?)),
                _ => bail!("AWB takes a mode alone or a mode with red and blue gains"),
            };
            Command::Awb { mode, gains }
        }
        "EXPOSURE" => {
            expect_args(verb, &args, 1, 2)?;
            let mode = args[0].parse()?;
            let speed = match args.len() {
                1 => None,
                _ => Some(parse_float(args[1])?),
            };
            Command::Exposure { mode, speed }
        }
        "ISO" => {
            expect_args(verb, &args, 1, 1)?;
            let iso = args[0].parse().map_err(|_| anyhow!("invalid ISO {:?}", args[0]))?;
            Command::Iso { iso }
        }
        "METERING" => {
            expect_args(verb, &args, 1, 1)?;
            Command::Metering { mode: args[0].parse()? }
        }
        "LEVELS" => {
            expect_args(verb, &args, 4, 4)?;
            let mut values = [0i32; 4];
            for (slot, token) in values.iter_mut().zip(&args) {
                *slot = token.parse().map_err(|_| anyhow!("invalid level {token:?}"))?;
            }
            Command::Levels {
                brightness: values[0],
                contrast: values[1],
                saturation: values[2],
                ev: values[3],
            }
        }
        "FLIP" => {
            expect_args(verb, &args, 2, 2)?;
            Command::Flip {
                horizontal: parse_bool(args[0])?,
                vertical: parse_bool(args[1])?,
            }
        }
        "AGC" => {
            expect_args(verb, &args, 1, 1)?;
            Command::Agc { mode: args[0].parse()? }
        }
        "DENOISE" => {
            expect_args(verb, &args, 1, 1)?;
            Command::Denoise { enabled: parse_bool(args[0])? }
        }
        "QUALITY" => {
            expect_args(verb, &args, 1, 1)?;
            let quality = args[0]
                .parse()
                .map_err(|_| anyhow!("invalid quality {:?}", args[0]))?;
            Command::Quality { quality }
        }
        "BLINK" => {
            expect_args(verb, &args, 0, 0)?;
            Command::Blink
        }
        "CAPTURE" => {
            expect_args(verb, &args, 0, 3)?;
            let count = match args.first() {
                Some(token) => token
                    .parse()
                    .map_err(|_| anyhow!("invalid capture count {token:?}"))?,
                None => 1,
            };
            let video_port = match args.get(1) {
                Some(token) => parse_bool(token)?,
                None => false,
            };
            let sync = match args.get(2) {
                Some(token) => Some(parse_timestamp(token)?),
                None => None,
            };
            Command::Capture { count, video_port, sync }
        }
        "LIST" => {
            expect_args(verb, &args, 0, 0)?;
            Command::List
        }
        "CLEAR" => {
            expect_args(verb, &args, 0, 0)?;
            Command::Clear
        }
        "SEND" => {
            expect_args(verb, &args, 2, 2)?;
            let index = args[0].parse().map_err(|_| anyhow!("invalid index {:?}", args[0]))?;
            let port = args[1].parse().map_err(|_| anyhow!("invalid port {:?}", args[1]))?;
            Command::Send { index, port }
        }
        _ => bail!("unknown command {verb}"),
    };
    Ok((seq, command))
}

/// A server reply: OK with an optional data section, or ERROR with a
/// description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub seq: u64,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Ok(String),
    Error(String),
}

impl Response {
    pub fn ok(seq: u64, data: impl Into<String>) -> Self {
        Self { seq, kind: ResponseKind::Ok(data.into()) }
    }

    pub fn error(seq: u64, message: impl Into<String>) -> Self {
        Self { seq, kind: ResponseKind::Error(message.into()) }
    }

    pub fn encode(&self) -> String {
        match &self.kind {
            ResponseKind::Ok(data) if data.is_empty() => format!("{} OK", self.seq),
            ResponseKind::Ok(data) => format!("{} OK\n{data}", self.seq),
            ResponseKind::Error(message) => format!("{} ERROR\n{message}", self.seq),
        }
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let (header, data) = match frame.split_once('\n') {
            Some((header, data)) => (header, Some(data)),
            None => (frame, None),
        };
        let mut tokens = header.trim_end().split_whitespace();
        let seq = parse_seq(tokens.next().ok_or_else(|| anyhow!("empty response"))?)?;
        let result = tokens.next().ok_or_else(|| anyhow!("missing response result"))?;
        if tokens.next().is_some() {
            bail!("trailing tokens in response header");
        }
        let kind = match result {
            "OK" => ResponseKind::Ok(data.unwrap_or("").trim_end().to_string()),
            "ERROR" => ResponseKind::Error(data.unwrap_or("").trim_end().to_string()),
            _ => bail!("invalid response result {result:?}"),
        };
        Ok(Self { seq, kind })
    }
}

/// The full STATUS block. Line order and field count are fixed; both ends
/// treat any deviation as a protocol error.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    pub awb_mode: AwbMode,
    pub awb_red: f64,
    pub awb_blue: f64,
    pub exposure_mode: ExposureMode,
    pub exposure_speed: f64,
    pub ev: i32,
    pub iso: u32,
    pub metering_mode: MeteringMode,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub timestamp: f64,
    pub images: usize,
}

impl StatusReport {
    pub fn render(&self) -> String {
        format!(
            "RESOLUTION {} {}\n\
             FRAMERATE {}\n\
             AWB {} {:.2} {:.2}\n\
             EXPOSURE {} {:.3} {}\n\
             ISO {}\n\
             METERING {}\n\
             LEVELS {} {} {}\n\
             FLIP {} {}\n\
             TIMESTAMP {:.6}\n\
             IMAGES {}",
            self.width,
            self.height,
            self.framerate,
            self.awb_mode,
            self.awb_red,
            self.awb_blue,
            self.exposure_mode,
            self.exposure_speed,
            self.ev,
            self.iso,
            self.metering_mode,
            self.brightness,
            self.contrast,
            self.saturation,
            self.hflip as u8,
            self.vflip as u8,
            self.timestamp,
            self.images,
        )
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut lines = data.lines();
        let mut next = |prefix: &str| -> Result<Vec<String>> {
            let line = lines
                .next()
                .ok_or_else(|| anyhow!("status block truncated before {prefix}"))?;
            let rest = line
                .strip_prefix(prefix)
                .ok_or_else(|| anyhow!("expected {prefix} line, got {line:?}"))?;
            Ok(rest.split_whitespace().map(str::to_string).collect())
        };

        let resolution = next("RESOLUTION ")?;
        if resolution.len() != 2 {
            bail!("malformed RESOLUTION line");
        }
        let framerate = next("FRAMERATE ")?;
        if framerate.len() != 1 {
            bail!("malformed FRAMERATE line");
        }
        let awb = next("AWB ")?;
        if awb.len() != 3 {
            bail!("malformed AWB line");
        }
        let exposure = next("EXPOSURE ")?;
        if exposure.len() != 3 {
            bail!("malformed EXPOSURE line");
        }
        let iso = next("ISO ")?;
        if iso.len() != 1 {
            bail!("malformed ISO line");
        }
        let metering = next("METERING ")?;
        if metering.len() != 1 {
            bail!("malformed METERING line");
        }
        let levels = next("LEVELS ")?;
        if levels.len() != 3 {
            bail!("malformed LEVELS line");
        }
        let flip = next("FLIP ")?;
        if flip.len() != 2 {
            bail!("malformed FLIP line");
        }
        let timestamp = next("TIMESTAMP ")?;
        if timestamp.len() != 1 {
            bail!("malformed TIMESTAMP line");
        }
        let images = next("IMAGES ")?;
        if images.len() != 1 {
            bail!("malformed IMAGES line");
        }
        if lines.next().is_some() {
            bail!("trailing lines in status block");
        }

        Ok(Self {
            width: resolution[0].parse()?,
            height: resolution[1].parse()?,
            framerate: framerate[0].parse()?,
            awb_mode: awb[0].parse()?,
            awb_red: parse_float(&awb[1])?,
            awb_blue: parse_float(&awb[2])?,
            exposure_mode: exposure[0].parse()?,
            exposure_speed: parse_float(&exposure[1])?,
            ev: exposure[2].parse()?,
            iso: iso[0].parse()?,
            metering_mode: metering[0].parse()?,
            brightness: levels[0].parse()?,
            contrast: levels[1].parse()?,
            saturation: levels[2].parse()?,
            hflip: parse_bool(&flip[0])?,
            vflip: parse_bool(&flip[1])?,
            timestamp: parse_timestamp(&timestamp[0])?,
            images: images[0].parse()?,
        })
    }
}

/// One line of a LIST response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    pub index: usize,
    pub timestamp: f64,
    pub size: u64,
}

impl ImageInfo {
    pub fn render(&self) -> String {
        format!("IMAGE {} {:.6} {}", self.index, self.timestamp, self.size)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let rest = line
            .strip_prefix("IMAGE ")
            .ok_or_else(|| anyhow!("expected IMAGE line, got {line:?}"))?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() != 3 {
            bail!("malformed IMAGE line {line:?}");
        }
        Ok(Self {
            index: fields[0].parse()?,
            timestamp: parse_timestamp(fields[1])?,
            size: fields[2].parse()?,
        })
    }
}

/// Parse the data section of a LIST response.
pub fn parse_image_list(data: &str) -> Result<Vec<ImageInfo>> {
    data.lines().map(ImageInfo::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let commands = vec![
            Command::Hello { timestamp: 1400803122.359911 },
            Command::Ack,
            Command::Status,
            Command::Resolution { width: 1280, height: 720 },
            Command::Framerate { rate: Fraction::new(30, 1) },
            Command::Framerate { rate: Fraction::new(15, 2) },
            Command::Awb { mode: AwbMode::Auto, gains: None },
            Command::Awb { mode: AwbMode::Off, gains: Some((1.5, 1.25)) },
            Command::Exposure { mode: ExposureMode::Auto, speed: None },
            Command::Exposure { mode: ExposureMode::Off, speed: Some(33.125) },
            Command::Iso { iso: 400 },
            Command::Metering { mode: MeteringMode::Spot },
            Command::Levels { brightness: 50, contrast: -10, saturation: 25, ev: -6 },
            Command::Flip { horizontal: true, vertical: false },
            Command::Agc { mode: AgcMode::NightPreview },
            Command::Denoise { enabled: true },
            Command::Quality { quality: 85 },
            Command::Blink,
            Command::Capture { count: 1, video_port: false, sync: None },
            Command::Capture { count: 3, video_port: true, sync: Some(1400803122.5) },
            Command::List,
            Command::Clear,
            Command::Send { index: 2, port: 5647 },
        ];
        for (i, command) in commands.into_iter().enumerate() {
            let seq = i as u64 + 1;
            let frame = command.encode(seq);
            let (parsed_seq, parsed) = parse_command(&frame).unwrap();
            assert_eq!(parsed_seq, seq);
            assert_eq!(parsed, command, "frame {frame:?}");
        }
    }

    #[test]
    fn test_command_rejects_bad_seq() {
        assert!(parse_command("0 STATUS").is_err());
        assert!(parse_command("-1 STATUS").is_err());
        assert!(parse_command("x STATUS").is_err());
        assert!(parse_command("STATUS").is_err());
        assert!(parse_command("").is_err());
    }

    #[test]
    fn test_command_rejects_unknown_verb() {
        assert!(parse_command("7 FOO").is_err());
        assert!(parse_command("7 status").is_err());
    }

    #[test]
    fn test_command_rejects_bad_args() {
        assert!(parse_command("1 RESOLUTION 1280").is_err());
        assert!(parse_command("1 RESOLUTION 1280 720 60").is_err());
        assert!(parse_command("1 AWB off 1.5").is_err());
        assert!(parse_command("1 FLIP 2 0").is_err());
        assert!(parse_command("1 HELLO").is_err());
        assert!(parse_command("1 HELLO -5.0").is_err());
        assert!(parse_command("1 CAPTURE 1 0 nan").is_err());
        assert!(parse_command("1 FRAMERATE 30/0").is_err());
    }

    #[test]
    fn test_command_tolerates_trailing_whitespace() {
        let (seq, command) = parse_command("4 STATUS \n").unwrap();
        assert_eq!(seq, 4);
        assert_eq!(command, Command::Status);
    }

    #[test]
    fn test_capture_defaults() {
        let (_, command) = parse_command("3 CAPTURE").unwrap();
        assert_eq!(command, Command::Capture { count: 1, video_port: false, sync: None });
    }

    #[test]
    fn test_response_round_trip() {
        let cases = vec![
            Response::ok(1, "VERSION 0.4"),
            Response::ok(2, ""),
            Response::error(7, "unknown command FOO"),
        ];
        for response in cases {
            let frame = response.encode();
            assert_eq!(Response::parse(&frame).unwrap(), response);
        }
    }

    #[test]
    fn test_response_without_data_has_no_newline() {
        assert_eq!(Response::ok(2, "").encode(), "2 OK");
        assert_eq!(Response::ok(1, "VERSION 0.4").encode(), "1 OK\nVERSION 0.4");
    }

    #[test]
    fn test_response_rejects_garbage() {
        assert!(Response::parse("1 MAYBE\ndata").is_err());
        assert!(Response::parse("0 OK").is_err());
        assert!(Response::parse("1 OK extra").is_err());
    }

    #[test]
    fn test_fraction_parse_and_render() {
        assert_eq!("30".parse::<Fraction>().unwrap(), Fraction::new(30, 1));
        assert_eq!("15/2".parse::<Fraction>().unwrap(), Fraction::new(15, 2));
        assert_eq!(Fraction::new(15, 2).to_string(), "15/2");
        assert_eq!(Fraction::new(30, 1).to_string(), "30");
        assert!("30/".parse::<Fraction>().is_err());
        assert!("/2".parse::<Fraction>().is_err());
    }

    fn sample_status() -> StatusReport {
        StatusReport {
            width: 1280,
            height: 720,
            framerate: Fraction::new(30, 1),
            awb_mode: AwbMode::Auto,
            awb_red: 1.5,
            awb_blue: 1.25,
            exposure_mode: ExposureMode::Auto,
            exposure_speed: 33.158,
            ev: 0,
            iso: 0,
            metering_mode: MeteringMode::Average,
            brightness: 50,
            contrast: 0,
            saturation: 0,
            hflip: false,
            vflip: true,
            timestamp: 1400803173.991651,
            images: 3,
        }
    }

    #[test]
    fn test_status_line_order() {
        let rendered = sample_status().render();
        let prefixes: Vec<&str> = rendered
            .lines()
            .map(|line| line.split(' ').next().unwrap())
            .collect();
        assert_eq!(
            prefixes,
            vec![
                "RESOLUTION",
                "FRAMERATE",
                "AWB",
                "EXPOSURE",
                "ISO",
                "METERING",
                "LEVELS",
                "FLIP",
                "TIMESTAMP",
                "IMAGES",
            ]
        );
    }

    #[test]
    fn test_status_round_trip() {
        let status = sample_status();
        let parsed = StatusReport::parse(&status.render()).unwrap();
        assert_eq!(parsed.width, status.width);
        assert_eq!(parsed.height, status.height);
        assert_eq!(parsed.framerate, status.framerate);
        assert_eq!(parsed.awb_mode, status.awb_mode);
        assert!((parsed.awb_red - status.awb_red).abs() < 0.01);
        assert!((parsed.exposure_speed - status.exposure_speed).abs() < 0.001);
        assert_eq!(parsed.hflip, status.hflip);
        assert_eq!(parsed.vflip, status.vflip);
        assert!((parsed.timestamp - status.timestamp).abs() < 1e-6);
        assert_eq!(parsed.images, status.images);
    }

    #[test]
    fn test_status_rejects_reordered_lines() {
        let rendered = sample_status().render();
        let mut lines: Vec<&str> = rendered.lines().collect();
        lines.swap(0, 1);
        assert!(StatusReport::parse(&lines.join("\n")).is_err());
    }

    #[test]
    fn test_status_rejects_extra_lines() {
        let mut rendered = sample_status().render();
        rendered.push_str("\nIMAGES 4");
        assert!(StatusReport::parse(&rendered).is_err());
    }

    #[test]
    fn test_image_list_round_trip() {
        let images = vec![
            ImageInfo { index: 0, timestamp: 1398618927.307944, size: 8083879 },
            ImageInfo { index: 1, timestamp: 1398619000.53127, size: 7960423 },
        ];
        let data: Vec<String> = images.iter().map(ImageInfo::render).collect();
        let parsed = parse_image_list(&data.join("\n")).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].index, 0);
        assert_eq!(parsed[1].size, 7960423);
        assert!((parsed[0].timestamp - images[0].timestamp).abs() < 1e-6);
    }
}
