//! LEDの明るさを三角波で変化させる．
//!
//! 明るさは時分割で表す．I/Oサイクルごとに進むカウンタが閾値を超えている間だけ点灯させ，
//! 閾値はタイマの刻みに合わせて`0`と`total`の間を往復する．

use crate::packet::Leds;
use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};

/// `0`と`total`の間を1ずつ往復する値．
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleWave {
    limit: u32,
    direction: i32,
    total: u32,
}

impl TriangleWave {
    /// `total`から下り始める波を作る．
    ///
    /// # Panics
    /// `total`が0のとき．
    pub fn new(total: u32) -> TriangleWave {
        assert!(total > 0, "total must be positive");
        TriangleWave {
            limit: total,
            direction: -1,
            total,
        }
    }

    /// 1刻み進める．端に到達したら向きを反転する．
    pub fn tick(&mut self) {
        self.limit = if self.direction < 0 {
            self.limit.saturating_sub(1)
        } else {
            (self.limit + 1).min(self.total)
        };
        if self.limit == 0 || self.limit == self.total {
            self.direction = -self.direction;
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// `1`なら増加中，`-1`なら減少中．
    pub fn direction(&self) -> i32 {
        self.direction
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

/// `0..total`を繰り返し数えるカウンタ．
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCounter {
    count: u32,
    total: u32,
}

impl DutyCounter {
    /// # Panics
    /// `total`が0のとき．
    pub fn new(total: u32) -> DutyCounter {
        assert!(total > 0, "total must be positive");
        DutyCounter { count: 0, total }
    }

    /// 1つ進め，進めたあとの値を返す．`total`に達したら0に戻る．
    pub fn advance(&mut self) -> u32 {
        self.count += 1;
        if self.count == self.total {
            self.count = 0;
        }
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// 三角波とカウンタを組み合わせたLEDの点滅パターン．
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedPulse {
    wave: TriangleWave,
    counter: DutyCounter,
    color: Leds,
}

impl LedPulse {
    /// 青色LEDで`total`段階の明るさを表すパターン．
    ///
    /// # Panics
    /// `total`が0のとき．
    pub fn new(total: u32) -> LedPulse {
        LedPulse {
            wave: TriangleWave::new(total),
            counter: DutyCounter::new(total),
            color: Leds::BLUE,
        }
    }

    /// 点灯させるLEDを変える．
    pub fn with_color(mut self, color: Leds) -> LedPulse {
        self.color = color;
        self
    }

    /// タイマの刻みを1つ反映する．
    pub fn tick(&mut self) {
        self.wave.tick();
    }

    /// カウンタを進め，今回のI/Oサイクルで送るLEDの状態を返す．
    pub fn advance(&mut self) -> Leds {
        self.counter.advance();
        self.sample()
    }

    /// カウンタが閾値を超えていれば点灯．
    pub fn sample(&self) -> Leds {
        if self.counter.count() > self.wave.limit() {
            self.color
        } else {
            Leds::OFF
        }
    }

    pub fn wave(&self) -> &TriangleWave {
        &self.wave
    }

    pub fn counter(&self) -> &DutyCounter {
        &self.counter
    }
}

/// `period`ごとに時刻を送ってくるチャネル．受信側がLEDの状態を持ち，刻みを受け取ったときだけ`tick`する．
pub fn wave_ticks(period: Duration) -> Receiver<Instant> {
    crossbeam_channel::tick(period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wave_starts_at_top_going_down() {
        let mut wave = TriangleWave::new(3);
        assert_eq!((wave.limit(), wave.direction()), (3, -1));
        wave.tick();
        assert_eq!((wave.limit(), wave.direction()), (2, -1));
    }

    #[test]
    fn wave_reflects_at_both_ends() {
        let mut wave = TriangleWave::new(3);
        let mut limits = Vec::new();
        for _ in 0..8 {
            wave.tick();
            limits.push(wave.limit());
        }
        assert_eq!(limits, [2, 1, 0, 1, 2, 3, 2, 1]);
    }

    #[test]
    #[should_panic]
    fn zero_total_is_rejected() {
        TriangleWave::new(0);
    }

    #[test]
    fn counter_wraps_at_total() {
        let mut counter = DutyCounter::new(3);
        let counts: Vec<u32> = (0..7).map(|_| counter.advance()).collect();
        assert_eq!(counts, [1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn led_is_on_only_above_limit() {
        let mut pulse = LedPulse::new(4);
        // 閾値4のうちは常に消灯
        for _ in 0..8 {
            assert_eq!(pulse.advance(), Leds::OFF);
        }
        pulse.tick();
        pulse.tick();
        // 閾値2: count=3のときだけ点灯
        let leds: Vec<Leds> = (0..4).map(|_| pulse.advance()).collect();
        assert_eq!(leds, [Leds::OFF, Leds::OFF, Leds::BLUE, Leds::OFF]);
        assert_eq!(pulse.counter().count(), 0);
    }

    #[test]
    fn blue_is_the_demo_value() {
        assert_eq!(Leds::BLUE.bits(), 4);
        let mut pulse = LedPulse::new(2).with_color(Leds::RED);
        pulse.tick();
        pulse.tick();
        assert_eq!(pulse.wave().limit(), 0);
        assert_eq!(pulse.advance(), Leds::RED);
    }

    #[test]
    fn ticks_arrive_periodically() {
        let ticks = wave_ticks(Duration::from_millis(1));
        assert!(ticks.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
