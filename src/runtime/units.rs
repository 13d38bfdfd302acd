//! Axis unit tags for streams

use std::fmt;

/// Physical unit carried by a stream's Y axis (or a waveform's X axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Unit {
    Femtoseconds,
    Volts,
    Amps,
    Watts,
    Ohms,
    Hertz,
    Decibels,
    Dbm,
    Percent,
    Degrees,
    Counts,
    UnitIntervals,
    BitRate,
    SampleDepth,
    SampleRate,
    Celsius,
    Hexadecimal,
    #[default]
    Dimensionless,
}

impl Unit {
    /// Short symbol, without any SI prefix handling
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Femtoseconds => "fs",
            Unit::Volts => "V",
            Unit::Amps => "A",
            Unit::Watts => "W",
            Unit::Ohms => "Ω",
            Unit::Hertz => "Hz",
            Unit::Decibels => "dB",
            Unit::Dbm => "dBm",
            Unit::Percent => "%",
            Unit::Degrees => "°",
            Unit::Counts => "",
            Unit::UnitIntervals => "UI",
            Unit::BitRate => "b/s",
            Unit::SampleDepth => "S",
            Unit::SampleRate => "S/s",
            Unit::Celsius => "°C",
            Unit::Hexadecimal => "0x",
            Unit::Dimensionless => "",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
