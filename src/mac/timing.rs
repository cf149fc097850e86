//! IEEE 802.11p / 1609.4 timing constants and frame airtime.
//!
//! Everything here is expressed in whole microseconds, which is also the
//! embassy-time tick resolution used by the simulator (`std` feature).
//!
//! Units:
//! - Time: embassy `Duration` / `Instant`
//! - Frame sizes: bits
//! - Data rates: bit/s
//! - Frequencies: Hz

use embassy_time::{Duration, Instant};

/// Slot time for 10 MHz channel spacing.
pub const SLOT: Duration = Duration::from_micros(13);

/// Short interframe space.
pub const SIFS: Duration = Duration::from_micros(32);

/// Time it takes the radio to switch from Rx to Tx mode.
pub const RADIO_DELAY: Duration = Duration::from_micros(1);

/// Duration of the PLCP preamble.
pub const PHY_HDR_PREAMBLE_DURATION: Duration = Duration::from_micros(32);

/// Duration of the PLCP signal field.
pub const PHY_HDR_PLCPSIGNAL_DURATION: Duration = Duration::from_micros(8);

/// OFDM symbol interval.
pub const T_SYM: Duration = Duration::from_micros(8);

/// Default 1609.4 channel interval (CCH and SCH alternate every interval).
pub const SWITCHING_INTERVAL: Duration = Duration::from_millis(50);

/// Default 1609.4 guard interval at the start of every channel interval.
pub const GUARD_INTERVAL: Duration = Duration::from_millis(4);

/// Contention window bounds of the 802.11p PHY.
pub const CWMIN_11P: u32 = 15;
pub const CWMAX_11P: u32 = 1023;

/// Valid 802.11p bit rates (10 MHz channels).
pub const BITRATES_80211P: [u64; 8] = [3_000_000, 4_500_000, 6_000_000, 9_000_000, 12_000_000, 18_000_000, 24_000_000, 27_000_000];

/// Data bits per OFDM symbol for each entry of [`BITRATES_80211P`].
pub const N_DBPS_80211P: [u32; 8] = [24, 36, 48, 72, 96, 144, 192, 216];

// SERVICE (16 bits) and tail (6 bits) fields wrapped around the PSDU.
const SERVICE_AND_TAIL_BITS: u64 = 16 + 6;

/// Control channel frequency (channel 178).
pub const CCH_FREQUENCY_HZ: f64 = 5.89e9;

/// Service channels 1..=4 map to channels 174, 176, 180 and 182.
const SERVICE_CHANNEL_FREQUENCIES_HZ: [f64; 4] = [5.87e9, 5.88e9, 5.90e9, 5.91e9];

/// Look up the number of data bits per symbol for a bit rate.
///
/// Returns `None` when `bitrate` is not one of the 802.11p rates.
pub fn data_bits_per_symbol(bitrate: u64) -> Option<u32> {
    BITRATES_80211P.iter().position(|&rate| rate == bitrate).map(|index| N_DBPS_80211P[index])
}

/// Frequency of service channel `service_channel` (1..=4).
pub fn service_channel_frequency(service_channel: u8) -> Option<f64> {
    match service_channel {
        1..=4 => Some(SERVICE_CHANNEL_FREQUENCIES_HZ[service_channel as usize - 1]),
        _ => None,
    }
}

/// On-air duration of a frame of `frame_bits` bits.
///
/// # Formula
///
/// ```text
/// T = T_preamble + T_signal + T_sym × ⌈(16 + bits + 6) / N_DBPS⌉
/// ```
///
/// This is Equation (17-29) of IEEE 802.11-2007 for OFDM PHYs.
pub fn frame_duration(frame_bits: u64, n_dbps: u32) -> Duration {
    let symbols = (SERVICE_AND_TAIL_BITS + frame_bits).div_ceil(n_dbps.max(1) as u64);
    PHY_HDR_PREAMBLE_DURATION + PHY_HDR_PLCPSIGNAL_DURATION + Duration::from_ticks(T_SYM.as_ticks() * symbols)
}

/// Arbitration interframe space for a category with `aifsn` slots.
pub fn aifs(aifsn: u32) -> Duration {
    SLOT * aifsn + SIFS
}

/// How long to wait for an ACK after the data frame left the antenna.
///
/// SIFS + slot + PHY RX-start delay (preamble and PLCP signal).
pub fn ack_wait() -> Duration {
    SIFS + SLOT + PHY_HDR_PREAMBLE_DURATION + PHY_HDR_PLCPSIGNAL_DURATION
}

/// Number of whole slots contained in `span`.
pub fn whole_slots(span: Duration) -> u64 {
    span.as_ticks() / SLOT.as_ticks()
}

/// First slot boundary strictly after `now`, where slots are counted from
/// `base` (`base <= now`).
pub fn next_slot_boundary(base: Instant, now: Instant) -> Instant {
    let into_slot = now.saturating_duration_since(base).as_ticks() % SLOT.as_ticks();
    now - Duration::from_ticks(into_slot) + SLOT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_80211p_rate_has_a_symbol_size() {
        for (rate, ndbps) in BITRATES_80211P.iter().zip(N_DBPS_80211P) {
            assert_eq!(data_bits_per_symbol(*rate), Some(ndbps));
        }
        assert_eq!(data_bits_per_symbol(11_000_000), None);
        assert_eq!(data_bits_per_symbol(0), None);
    }

    #[test]
    fn frame_duration_counts_whole_symbols() {
        // 6 Mbit/s -> 48 bits per symbol. 88 header bits + 100 bytes payload.
        let bits = 88 + 100 * 8;
        let symbols = (22 + bits as u64).div_ceil(48);
        assert_eq!(frame_duration(bits, 48), Duration::from_micros(40 + 8 * symbols));

        // Exactly one symbol of data rounds to one symbol, one more bit to two.
        assert_eq!(frame_duration(48 - 22, 48), Duration::from_micros(48));
        assert_eq!(frame_duration(48 - 21, 48), Duration::from_micros(56));
    }

    #[test]
    fn frame_duration_shrinks_with_faster_rates() {
        let slow = frame_duration(2_000, data_bits_per_symbol(3_000_000).unwrap());
        let fast = frame_duration(2_000, data_bits_per_symbol(27_000_000).unwrap());
        assert!(fast < slow);
    }

    #[test]
    fn aifs_matches_voice_and_background() {
        assert_eq!(aifs(2), Duration::from_micros(58));
        assert_eq!(aifs(9), Duration::from_micros(149));
    }

    #[test]
    fn service_channel_lookup() {
        assert_eq!(service_channel_frequency(1), Some(5.87e9));
        assert_eq!(service_channel_frequency(4), Some(5.91e9));
        assert_eq!(service_channel_frequency(0), None);
        assert_eq!(service_channel_frequency(5), None);
    }

    #[test]
    fn slot_boundary_is_strictly_in_the_future() {
        let base = Instant::from_micros(1_000);
        // On a boundary: the next one is a full slot later.
        assert_eq!(next_slot_boundary(base, Instant::from_micros(1_026)), Instant::from_micros(1_039));
        // Mid-slot: round up.
        assert_eq!(next_slot_boundary(base, Instant::from_micros(1_030)), Instant::from_micros(1_039));
        assert_eq!(whole_slots(Duration::from_micros(38)), 2);
    }
}
