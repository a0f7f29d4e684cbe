use std::sync::OnceLock;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A colormap from normalised intensities in `[0, 1]` to RGB.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    /// Identity ramp, `v` is replicated to each channel.
    #[default]
    #[display("grayscale")]
    #[serde(alias = "gray", alias = "grey")]
    Grayscale,
    /// Black to red to yellow to white, in three equal segments.
    #[display("hot")]
    Hot,
    /// A polynomial fit of the matplotlib viridis colormap, sampled into a 256 entry lookup table.
    #[display("viridis")]
    Viridis,
}

/// An unknown colormap name.
#[derive(Debug, Error)]
#[error("unknown colormap {0:?}, expected one of grayscale, hot, viridis")]
pub struct UnknownColormapError(String);

impl std::str::FromStr for Colormap {
    type Err = UnknownColormapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "gray" | "grey" => Ok(Self::Grayscale),
            "hot" => Ok(Self::Hot),
            "viridis" => Ok(Self::Viridis),
            _ => Err(UnknownColormapError(s.to_string())),
        }
    }
}

impl Colormap {
    /// Map `v` to an RGB triple. `v` is clamped to `[0, 1]` and NaN maps to 0.
    #[must_use]
    pub fn map(self, v: f64) -> [u8; 3] {
        let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        match self {
            Self::Grayscale => {
                let g = to_u8(v);
                [g, g, g]
            }
            Self::Hot => [
                to_u8(3.0 * v),
                to_u8(3.0 * v - 1.0),
                to_u8(3.0 * v - 2.0),
            ],
            Self::Viridis => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let index = (v * 255.0).round() as usize;
                viridis_lut()[index.min(255)]
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

const VIRIDIS_COEFFICIENTS: [[f64; 3]; 7] = [
    [0.277_727_327_223_417_7, 0.005_407_344_544_966_578, 0.334_099_805_335_306_1],
    [0.105_093_043_108_577_4, 1.404_613_529_898_575, 1.384_590_162_594_685],
    [-0.330_861_828_725_556_3, 0.214_847_559_468_213, 0.095_095_163_028_236_59],
    [-4.634_230_498_983_486, -5.799_100_973_351_585, -19.332_440_956_279_87],
    [6.228_269_936_347_081, 14.179_933_366_805_09, 56.690_552_600_681_05],
    [4.776_384_997_670_288, -13.745_145_377_746_01, -65.353_032_633_372_34],
    [-5.435_455_855_934_631, 4.645_852_612_178_535, 26.312_435_249_583_2],
];

fn viridis_lut() -> &'static [[u8; 3]; 256] {
    static LUT: OnceLock<[[u8; 3]; 256]> = OnceLock::new();
    LUT.get_or_init(|| {
        let mut lut = [[0u8; 3]; 256];
        for (i, entry) in lut.iter_mut().enumerate() {
            let t = f64::from(u8::try_from(i).unwrap_or(u8::MAX)) / 255.0;
            for (channel, value) in entry.iter_mut().enumerate() {
                // Horner evaluation of c0 + t * (c1 + t * (... + t * c6))
                let v = VIRIDIS_COEFFICIENTS
                    .iter()
                    .rev()
                    .fold(0.0, |acc, c| acc * t + c[channel]);
                *value = to_u8(v);
            }
        }
        lut
    })
}
