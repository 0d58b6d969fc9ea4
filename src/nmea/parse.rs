//! Sentence parsers: framed NMEA lines in, typed sensor readings out.
//!
//! Only the sentences the autopilot consumes are handled — RMC for
//! position, MWV for wind, RSA for rudder angle, APB for chartplotter
//! track commands. Every parser is total over its input: a missing
//! field or an unparsable number rejects the sentence, it never
//! faults. Checksums are the framer's problem; lines arriving here
//! are already validated.

use serde::Serialize;

/// Sensor channels the bridge arbitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Gps,
    Wind,
    Rudder,
    Apb,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Gps, Kind::Wind, Kind::Rudder, Kind::Apb];

    pub fn name(self) -> &'static str {
        match self {
            Kind::Gps    => "gps",
            Kind::Wind   => "wind",
            Kind::Rudder => "rudder",
            Kind::Apb    => "apb",
        }
    }

    /// Bus key holding the channel's current owning source.
    pub fn source_key(self) -> &'static str {
        match self {
            Kind::Gps    => "gps.source",
            Kind::Wind   => "wind.source",
            Kind::Rudder => "rudder.source",
            Kind::Apb    => "apb.source",
        }
    }

    /// Bus key holding the device string of the current owner.
    pub fn device_key(self) -> &'static str {
        match self {
            Kind::Gps    => "gps.device",
            Kind::Wind   => "wind.device",
            Kind::Rudder => "rudder.device",
            Kind::Apb    => "apb.device",
        }
    }

    /// Run this kind's parser over a framed sentence.
    pub fn parse(self, line: &str) -> Option<Reading> {
        match self {
            Kind::Gps    => parse_gps(line),
            Kind::Wind   => parse_wind(line),
            Kind::Rudder => parse_rudder(line),
            Kind::Apb    => parse_apb(line),
        }
    }
}

/// Steering reference carried by an APB sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApbMode {
    Compass,
    Gps,
}

/// A parsed sensor value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Gps {
        timestamp: f64,
        lat: f64,
        lon: f64,
        speed: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        track: Option<f64>,
    },
    Wind {
        direction: f64,
        speed: f64,
    },
    Rudder {
        /// `None` is the invalid-angle sentinel.
        angle: Option<f64>,
    },
    Apb {
        mode: ApbMode,
        track: f64,
        xte: f64,
        senderid: String,
    },
}

impl Reading {
    pub fn kind(&self) -> Kind {
        match self {
            Reading::Gps { .. }    => Kind::Gps,
            Reading::Wind { .. }   => Kind::Wind,
            Reading::Rudder { .. } => Kind::Rudder,
            Reading::Apb { .. }    => Kind::Apb,
        }
    }
}

/// A reading plus the device it came from (2-char talker followed by
/// the serial path or `socket<uid>`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReport {
    #[serde(flatten)]
    pub reading: Reading,
    pub device: String,
}

/// Comma fields after the `$XXYYY,` head, checksum stripped.
fn body_fields(line: &str) -> Option<Vec<&str>> {
    let body = line.get(7..line.len().checked_sub(3)?)?;
    Some(body.split(',').collect())
}

/// RMC — recommended minimum GPS data.
fn parse_gps(line: &str) -> Option<Reading> {
    if line.get(3..6) != Some("RMC") {
        return None;
    }
    let data = body_fields(line)?;
    if data.len() < 7 || data[1] != "A" {
        return None;
    }
    let timestamp: f64 = data[0].parse().ok()?;
    let mut lat = degrees_minutes_to_decimal(data[2].parse().ok()?);
    if data[3] == "S" {
        lat = -lat;
    }
    let mut lon = degrees_minutes_to_decimal(data[4].parse().ok()?);
    if data[5] == "W" {
        lon = -lon;
    }
    let speed = if data[6].is_empty() { 0.0 } else { data[6].parse().ok()? };
    let track = match data.get(7) {
        Some(t) if !t.is_empty() => Some(t.parse().ok()?),
        _ => None,
    };
    Some(Reading::Gps { timestamp, lat, lon, speed, track })
}

/// `DDMM.mmm` coordinate to decimal degrees.
fn degrees_minutes_to_decimal(n: f64) -> f64 {
    let n = n / 100.0;
    let degrees = n.trunc();
    degrees + (n - degrees) * 100.0 / 60.0
}

/// MWV — wind speed and angle. Speed unit letter converts to knots.
fn parse_wind(line: &str) -> Option<Reading> {
    if line.get(3..6) != Some("MWV") {
        return None;
    }
    let data: Vec<&str> = line.split(',').collect();
    let direction: f64 = data.get(1)?.parse().ok()?;
    let mut speed: f64 = data.get(3)?.parse().ok()?;
    match *data.get(4)? {
        "K" => speed *= 0.53995,  // km/h
        "M" => speed *= 1.94384,  // m/s
        _ => {}                   // N, already knots
    }
    Some(Reading::Wind { direction, speed })
}

/// RSA — rudder sensor angle. A blank angle skips publication, a
/// non-numeric one publishes the invalid sentinel.
fn parse_rudder(line: &str) -> Option<Reading> {
    if line.get(3..6) != Some("RSA") {
        return None;
    }
    let field = line.split(',').nth(1)?;
    if field.is_empty() {
        return None;
    }
    Some(Reading::Rudder { angle: field.parse().ok() })
}

/// APB — autopilot sentence B from a chartplotter. Cross-track error
/// is clamped to ±0.15 nm and signed by the direction-to-steer field.
fn parse_apb(line: &str) -> Option<Reading> {
    if line.get(3..6) != Some("APB") {
        return None;
    }
    let data = body_fields(line)?;
    if data.len() < 14 {
        return None;
    }
    let mode = if data[13] == "M" { ApbMode::Compass } else { ApbMode::Gps };
    let track: f64 = data[12].parse().ok()?;
    let xte: f64 = data[2].parse().ok()?;
    let xte = xte.min(0.15);
    let xte = if data[3] == "L" { -xte } else { xte };
    Some(Reading::Apb {
        mode,
        track,
        xte: xte.clamp(-0.15, 0.15),
        senderid: line.get(1..3)?.to_string(),
    })
}
