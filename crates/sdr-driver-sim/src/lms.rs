//! Fractional-N synthesizer math of the single-channel transceiver.
//!
//! The VCO runs between 3.0 and 7.6 GHz and is divided down by
//! `2^(freqsel)`. The feedback divider is `nint + nfrac / 2^23` of the
//! 38.4 MHz reference.

use sdr_core::{LmsQuickTune, Result, SdrError};

pub const REFERENCE_HZ: u64 = 38_400_000;
const VCO_MIN_HZ: u64 = 3_000_000_000;
const VCO_MAX_HZ: u64 = 7_600_000_000;
const NFRAC_BITS: u32 = 23;

/// Upper edge of the low-frequency front end.
pub const LOW_BAND_MAX_HZ: u64 = 1_500_000_000;

/// Quick-tune flag: low-frequency front-end path.
pub const FLAG_LOW_BAND: u8 = 1 << 0;
/// Quick-tune flag: the XB-200 transverter mixes the tune down.
pub const FLAG_XB200_MIX: u8 = 1 << 1;

/// Local oscillator of the XB-200 transverter.
pub const XB200_LO_HZ: u64 = 1_248_000_000;

/// Resolve PLL parameters for `frequency`.
pub fn quick_tune(frequency: u64) -> Result<LmsQuickTune> {
    let freqsel = (1..=7u8)
        .find(|sel| frequency.saturating_mul(1 << sel) >= VCO_MIN_HZ)
        .ok_or_else(|| {
            SdrError::invalid_argument("set_frequency", format!("{} Hz is too low", frequency))
        })?;

    let vco = frequency << freqsel;
    if vco > VCO_MAX_HZ {
        return Err(SdrError::invalid_argument(
            "set_frequency",
            format!("{} Hz is too high", frequency),
        ));
    }

    let nint = vco / REFERENCE_HZ;
    let rem = vco % REFERENCE_HZ;
    let nfrac = ((u128::from(rem) << NFRAC_BITS) / u128::from(REFERENCE_HZ)) as u32;
    let vcocap = ((vco - VCO_MIN_HZ) * 63 / (VCO_MAX_HZ - VCO_MIN_HZ)) as u8;

    let mut flags = 0;
    if frequency < LOW_BAND_MAX_HZ {
        flags |= FLAG_LOW_BAND;
    }

    Ok(LmsQuickTune {
        freqsel,
        vcocap,
        nint: nint as u16,
        nfrac,
        flags,
        xb_gpio: 0,
    })
}

/// Frequency synthesized by `qt`, before any transverter mixing.
pub fn synthesized(qt: &LmsQuickTune) -> u64 {
    let frac = (u128::from(qt.nfrac) * u128::from(REFERENCE_HZ)) >> NFRAC_BITS;
    let vco = u128::from(qt.nint) * u128::from(REFERENCE_HZ) + frac;
    (vco >> qt.freqsel) as u64
}

/// RF frequency `qt` tunes to, accounting for the XB-200 mix.
pub fn frequency(qt: &LmsQuickTune) -> u64 {
    let synth = synthesized(qt);
    if qt.flags & FLAG_XB200_MIX != 0 {
        synth.saturating_sub(XB200_LO_HZ)
    } else {
        synth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_frequencies_round_trip() {
        for f in [921_600_000, 768_000_000, 1_075_200_000, 2_400_000_000] {
            let qt = quick_tune(f).unwrap();
            assert_eq!(qt.nfrac, 0, "{} should be integer-N", f);
            assert_eq!(frequency(&qt), f);
        }
    }

    #[test]
    fn test_divider_selection() {
        let qt = quick_tune(921_600_000).unwrap();
        assert_eq!(qt.freqsel, 2);
        assert_eq!(qt.nint, 96);
        assert!(qt.flags & FLAG_LOW_BAND != 0);

        let qt = quick_tune(2_400_000_000).unwrap();
        assert_eq!(qt.freqsel, 1);
        assert_eq!(qt.flags & FLAG_LOW_BAND, 0);
    }

    #[test]
    fn test_fractional_error_is_small() {
        let f = 915_000_001;
        let qt = quick_tune(f).unwrap();
        assert!(frequency(&qt).abs_diff(f) < 10);
    }

    #[test]
    fn test_out_of_range() {
        assert!(quick_tune(1_000_000).is_err());
        assert!(quick_tune(4_000_000_000).is_err());
    }
}
