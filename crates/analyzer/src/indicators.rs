//! Fixed-precision indicator primitives.
//!
//! All computations stay in `Decimal` so the hysteresis thresholds compare
//! exactly; every function degrades gracefully on short input instead of
//! erroring, because the analysis loop must keep emitting adjustments.

use rust_decimal::Decimal;

/// Simple moving average of the trailing `period` closes.
pub fn sma(closes: &[Decimal], period: usize) -> Decimal {
    if closes.is_empty() {
        return Decimal::ZERO;
    }
    if closes.len() < period {
        return *closes.last().expect("non-empty");
    }
    let sum: Decimal = closes[closes.len() - period..].iter().copied().sum();
    sum / Decimal::from(period as u64)
}

/// Exponential moving average seeded with the SMA of the first `period`
/// closes: `EMA = (price - prev) * 2/(period+1) + prev`.
pub fn ema(closes: &[Decimal], period: usize) -> Decimal {
    if closes.is_empty() {
        return Decimal::ZERO;
    }
    if closes.len() < period {
        return *closes.last().expect("non-empty");
    }

    let multiplier = Decimal::from(2) / (Decimal::from(period as u64) + Decimal::ONE);
    let seed: Decimal = closes[..period].iter().copied().sum();
    let mut value = seed / Decimal::from(period as u64);

    for price in &closes[period..] {
        value = (*price - value) * multiplier + value;
    }
    value
}

/// Relative strength index over the last `period` close-to-close changes,
/// using plain average gain / average loss.
pub fn rsi(closes: &[Decimal], period: usize) -> Decimal {
    if closes.len() < period + 1 {
        return Decimal::from(50);
    }

    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;
    for i in closes.len() - period..closes.len() {
        let change = closes[i] - closes[i - 1];
        if change > Decimal::ZERO {
            gains += change;
        } else {
            losses += change.abs();
        }
    }

    let avg_gain = gains / Decimal::from(period as u64);
    let avg_loss = losses / Decimal::from(period as u64);
    if avg_loss.is_zero() {
        return Decimal::from(100);
    }

    let rs = avg_gain / avg_loss;
    Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs)
}

/// Average true range over the last `period` bars:
/// `TR = max(high - low, |high - prev_close|, |low - prev_close|)`.
pub fn atr(highs: &[Decimal], lows: &[Decimal], closes: &[Decimal], period: usize) -> Decimal {
    if closes.len() < period + 1 {
        // Not enough history; approximate with the latest bar's range.
        return match (highs.last(), lows.last()) {
            (Some(high), Some(low)) => *high - *low,
            _ => Decimal::ZERO,
        };
    }

    let mut sum = Decimal::ZERO;
    for i in closes.len() - period..closes.len() {
        let prev_close = closes[i - 1];
        let range = highs[i] - lows[i];
        let tr = range
            .max((highs[i] - prev_close).abs())
            .max((lows[i] - prev_close).abs());
        sum += tr;
    }
    sum / Decimal::from(period as u64)
}

/// Current bar volume relative to the mean of the preceding `ma_period` bars.
pub fn volume_ratio(volumes: &[Decimal], ma_period: usize) -> Decimal {
    if volumes.len() < ma_period + 1 {
        return Decimal::ONE;
    }
    let current = *volumes.last().expect("non-empty");
    let window = &volumes[volumes.len() - ma_period - 1..volumes.len() - 1];
    let avg: Decimal = window.iter().copied().sum::<Decimal>() / Decimal::from(ma_period as u64);
    if avg.is_zero() {
        return Decimal::ONE;
    }
    current / avg
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closes(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn sma_averages_trailing_window() {
        let data = closes(&[1, 2, 3, 4, 5]);
        assert_eq!(sma(&data, 3), dec!(4));
        // Short input falls back to the last close.
        assert_eq!(sma(&data[..2], 3), dec!(2));
    }

    #[test]
    fn rsi_is_100_without_losses_and_0_without_gains() {
        let rising = closes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(rsi(&rising, 14), dec!(100));

        let falling: Vec<Decimal> = rising.iter().rev().copied().collect();
        assert_eq!(rsi(&falling, 14), dec!(0));
    }

    #[test]
    fn rsi_neutral_for_short_input() {
        assert_eq!(rsi(&closes(&[1, 2, 3]), 14), dec!(50));
    }

    #[test]
    fn atr_uses_true_range_against_previous_close() {
        // A gap up makes |high - prev_close| the dominant term.
        let highs = vec![dec!(10), dec!(20)];
        let lows = vec![dec!(9), dec!(19)];
        let close_data = vec![dec!(9.5), dec!(19.5)];
        assert_eq!(atr(&highs, &lows, &close_data, 1), dec!(10.5));
    }

    #[test]
    fn volume_ratio_compares_to_preceding_mean() {
        let mut volumes = vec![dec!(100); 20];
        volumes.push(dec!(300));
        assert_eq!(volume_ratio(&volumes, 20), dec!(3));
    }
}
