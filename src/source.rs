//! Sensor source tags and the priority arbiter.
//!
//! Every reading arrives tagged with the origin it came through; the
//! arbiter decides whether a candidate origin may claim a sensor
//! channel away from its current owner. Lower rank wins, so an IMU
//! reading always beats a TCP one and `none` loses to everything.

/// Origin of a sensor reading, ordered by arbitration rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Imu,
    Gps,
    Serial,
    Tcp,
    Usb,
    None,
}

impl Source {
    /// Rank in the arbitration order; lower wins.
    pub fn priority(self) -> u8 {
        match self {
            Source::Imu    => 0,
            Source::Gps    => 1,
            Source::Serial => 2,
            Source::Tcp    => 3,
            Source::Usb    => 4,
            Source::None   => 5,
        }
    }

    /// Tag string as stored on the sensor bus.
    pub fn tag(self) -> &'static str {
        match self {
            Source::Imu    => "imu",
            Source::Gps    => "gps",
            Source::Serial => "serial",
            Source::Tcp    => "tcp",
            Source::Usb    => "usb",
            Source::None   => "none",
        }
    }

    /// Parse a bus tag; unknown tags rank as `none`.
    pub fn from_tag(tag: &str) -> Source {
        match tag {
            "imu"    => Source::Imu,
            "gps"    => Source::Gps,
            "serial" => Source::Serial,
            "tcp"    => Source::Tcp,
            "usb"    => Source::Usb,
            _        => Source::None,
        }
    }
}

/// May a reading from `candidate` replace the channel's `current`
/// owner? Ties go to the candidate so an owner can refresh itself.
pub fn should_emit(candidate: Source, current: Source) -> bool {
    candidate.priority() <= current.priority()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_order() {
        let order = [
            Source::Imu,
            Source::Gps,
            Source::Serial,
            Source::Tcp,
            Source::Usb,
            Source::None,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn arbiter_truth_table() {
        assert!(should_emit(Source::Serial, Source::None));
        assert!(should_emit(Source::Serial, Source::Tcp));
        assert!(should_emit(Source::Serial, Source::Serial));
        assert!(should_emit(Source::Imu, Source::Gps));
        assert!(!should_emit(Source::Tcp, Source::Serial));
        assert!(!should_emit(Source::Usb, Source::Imu));
        assert!(!should_emit(Source::None, Source::Usb));
    }

    #[test]
    fn tags_round_trip() {
        for source in [
            Source::Imu,
            Source::Gps,
            Source::Serial,
            Source::Tcp,
            Source::Usb,
            Source::None,
        ] {
            assert_eq!(Source::from_tag(source.tag()), source);
        }
        assert_eq!(Source::from_tag("chartplotter"), Source::None);
    }
}
