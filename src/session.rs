//! デバイスを開いてから閉じるまでの一連の流れ．
//!
//! どちらのデモも，デバイスを開いてファームウェアを書き込んだあと，
//! I/Oサイクルを1回行うごとに最新の入力から出力を1つ決めて書き戻す．

use crate::cube::BoxBoundary;
use crate::device::{HapticDevice, IoFlags};
use crate::error::{FalconError, Result};
use crate::led::LedPulse;
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// I/Oサイクルが失敗したときの再試行の仕方．
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 連続して失敗してよい回数．`None`なら何度でも再試行する．
    pub max_consecutive_failures: Option<u32>,
    /// 失敗したあと次のサイクルまで待つ時間．
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn bounded(max_consecutive_failures: u32, backoff: Duration) -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures: Some(max_consecutive_failures),
            backoff,
        }
    }

    /// 待たずに何度でも再試行する．
    pub const fn unbounded() -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures: None,
            backoff: Duration::ZERO,
        }
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_consecutive_failures
            .map_or(false, |max| failures >= max)
    }
}

impl Default for RetryPolicy {
    /// 1kHz前後で回るループが約1秒間応答を得られなければ諦める．
    fn default() -> Self {
        RetryPolicy::bounded(10_000, Duration::from_micros(100))
    }
}

/// 制御ループの設定．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopConfig {
    pub retry: RetryPolicy,
    /// 行うI/Oサイクルの上限．`None`なら停止要求まで回り続ける．
    pub max_cycles: Option<u64>,
}

/// 制御ループの実行結果．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    /// 行ったI/Oサイクルの数．
    pub cycles: u64,
    /// そのうち失敗したサイクルの数．
    pub failed_cycles: u64,
}

impl LoopStats {
    pub fn succeeded_cycles(&self) -> u64 {
        self.cycles - self.failed_cycles
    }
}

/// 接続台数を表示し，`index`番目のデバイスを開いてファームウェアを準備する．
pub fn open_session<D: HapticDevice + ?Sized>(device: &mut D, index: usize) -> Result<()> {
    let count = device.device_count()?;
    info!(count, "Devices available");
    device.open(index)?;
    if let Err(e) = device.load_firmware() {
        device.close();
        return Err(e);
    }
    Ok(())
}

/// 位置を読み，立方体の壁からの反力を書き戻すループ．
///
/// ループを抜けるとデバイスを閉じる．
pub fn run_cube<D: HapticDevice + ?Sized>(
    device: &mut D,
    boundary: &BoxBoundary,
    config: &LoopConfig,
    stop: &AtomicBool,
) -> Result<LoopStats> {
    info!(?boundary, "Starting cube loop");
    drive(
        device,
        IoFlags::FIRMWARE | IoFlags::KINEMATIC,
        config,
        stop,
        |device| {
            let force = boundary.force(device.position());
            device.set_force(force);
        },
    )
}

/// `ticks`を受け取るたびに三角波を進め，I/Oサイクルごとに青色LEDを点滅させるループ．
///
/// ループを抜けるとデバイスを閉じる．
pub fn run_led<D: HapticDevice + ?Sized>(
    device: &mut D,
    pulse: &mut LedPulse,
    ticks: &Receiver<Instant>,
    config: &LoopConfig,
    stop: &AtomicBool,
) -> Result<LoopStats> {
    info!(total = pulse.wave().total(), "Starting LED loop");
    drive(device, IoFlags::FIRMWARE, config, stop, |device| {
        for _ in ticks.try_iter() {
            pulse.tick();
        }
        device.set_leds(pulse.advance());
    })
}

fn drive<D, F>(
    device: &mut D,
    flags: IoFlags,
    config: &LoopConfig,
    stop: &AtomicBool,
    on_cycle: F,
) -> Result<LoopStats>
where
    D: HapticDevice + ?Sized,
    F: FnMut(&mut D),
{
    let result = cycle_until_stopped(device, flags, config, stop, on_cycle);
    device.close();
    match &result {
        Ok(stats) => info!(cycles = stats.cycles, failed = stats.failed_cycles, "Loop finished"),
        Err(e) => warn!("Loop aborted: {}", e),
    }
    result
}

fn cycle_until_stopped<D, F>(
    device: &mut D,
    flags: IoFlags,
    config: &LoopConfig,
    stop: &AtomicBool,
    mut on_cycle: F,
) -> Result<LoopStats>
where
    D: HapticDevice + ?Sized,
    F: FnMut(&mut D),
{
    let mut stats = LoopStats::default();
    let mut failures = 0;
    while !stop.load(Ordering::Relaxed) {
        if config.max_cycles.map_or(false, |max| stats.cycles >= max) {
            break;
        }
        stats.cycles += 1;
        match device.run_io_loop(flags) {
            Ok(()) => {
                failures = 0;
                on_cycle(device);
            }
            Err(e) if e.is_transient() => {
                stats.failed_cycles += 1;
                failures += 1;
                if config.retry.exhausted(failures) {
                    warn!(failures, "Giving up after last error: {}", e);
                    return Err(FalconError::RetriesExhausted { attempts: failures });
                }
                debug!(failures, "I/O cycle failed: {}", e);
                if !config.retry.backoff.is_zero() {
                    std::thread::sleep(config.retry.backoff);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Leds;
    use crate::{Meter, Newton, Triplet};
    use std::collections::VecDeque;

    /// 決められた順にI/Oサイクルの成否を返すデバイス．
    #[derive(Default)]
    struct ScriptedDevice {
        count: usize,
        opened: Option<usize>,
        firmware_fails: bool,
        script: VecDeque<Result<()>>,
        position: [f64; 3],
        flags: Vec<IoFlags>,
        forces: Vec<[f64; 3]>,
        leds: Vec<Leds>,
        closed: bool,
    }

    impl ScriptedDevice {
        fn with_script(script: Vec<Result<()>>) -> ScriptedDevice {
            ScriptedDevice {
                count: 1,
                script: script.into(),
                ..ScriptedDevice::default()
            }
        }
    }

    impl HapticDevice for ScriptedDevice {
        fn device_count(&mut self) -> Result<usize> {
            Ok(self.count)
        }

        fn open(&mut self, index: usize) -> Result<()> {
            if index >= self.count {
                return Err(FalconError::DeviceNotFound {
                    index,
                    count: self.count,
                });
            }
            self.opened = Some(index);
            Ok(())
        }

        fn load_firmware(&mut self) -> Result<()> {
            if self.firmware_fails {
                Err(FalconError::FirmwareNotLoaded)
            } else {
                Ok(())
            }
        }

        fn run_io_loop(&mut self, flags: IoFlags) -> Result<()> {
            self.flags.push(flags);
            self.script.pop_front().unwrap_or(Ok(()))
        }

        fn position(&self) -> Triplet<Meter<f64>> {
            Triplet::new(self.position[0], self.position[1], self.position[2]).map(Meter::new)
        }

        fn set_force(&mut self, force: Triplet<Newton<f64>>) {
            self.forces.push(crate::values(force));
        }

        fn set_leds(&mut self, leds: Leds) {
            self.leds.push(leds);
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn cycles(max: u64) -> LoopConfig {
        LoopConfig {
            retry: RetryPolicy::unbounded(),
            max_cycles: Some(max),
        }
    }

    #[test]
    fn session_opens_requested_device() {
        let mut device = ScriptedDevice::with_script(vec![]);
        open_session(&mut device, 0).unwrap();
        assert_eq!(device.opened, Some(0));
        assert!(matches!(
            open_session(&mut device, 1),
            Err(FalconError::DeviceNotFound { index: 1, count: 1 })
        ));
    }

    #[test]
    fn firmware_failure_is_fatal() {
        let mut device = ScriptedDevice {
            firmware_fails: true,
            ..ScriptedDevice::with_script(vec![])
        };
        assert!(matches!(
            open_session(&mut device, 0),
            Err(FalconError::FirmwareNotLoaded)
        ));
        assert!(device.closed);
    }

    #[test]
    fn cube_loop_writes_wall_force() {
        let mut device = ScriptedDevice {
            position: [0.0, 0.0, 0.10],
            ..ScriptedDevice::with_script(vec![])
        };
        let stop = AtomicBool::new(false);
        let stats = run_cube(&mut device, &BoxBoundary::default(), &cycles(3), &stop).unwrap();

        assert_eq!(stats, LoopStats { cycles: 3, failed_cycles: 0 });
        assert!(device.flags.iter().all(|&f| f == IoFlags::FIRMWARE | IoFlags::KINEMATIC));
        assert_eq!(device.forces.len(), 3);
        assert!((device.forces[0][2] + 5.0).abs() < 1e-9);
        assert!(device.closed);
    }

    #[test]
    fn failed_cycles_write_nothing() {
        let mut device = ScriptedDevice::with_script(vec![
            Err(FalconError::NoResponse),
            Ok(()),
            Err(FalconError::NoResponse),
            Ok(()),
        ]);
        let stop = AtomicBool::new(false);
        let stats = run_cube(&mut device, &BoxBoundary::default(), &cycles(4), &stop).unwrap();

        assert_eq!(stats.failed_cycles, 2);
        assert_eq!(stats.succeeded_cycles(), 2);
        assert_eq!(device.forces.len(), 2);
    }

    #[test]
    fn bounded_retry_gives_up() {
        let script = (0..5).map(|_| Err(FalconError::NoResponse)).collect();
        let mut device = ScriptedDevice::with_script(script);
        let config = LoopConfig {
            retry: RetryPolicy::bounded(3, Duration::ZERO),
            max_cycles: Some(100),
        };
        let stop = AtomicBool::new(false);
        let result = run_cube(&mut device, &BoxBoundary::default(), &config, &stop);

        assert!(matches!(result, Err(FalconError::RetriesExhausted { attempts: 3 })));
        assert_eq!(device.flags.len(), 3);
        assert!(device.closed);
    }

    #[test]
    fn success_resets_failure_count() {
        let script = vec![
            Err(FalconError::NoResponse),
            Err(FalconError::NoResponse),
            Ok(()),
            Err(FalconError::NoResponse),
            Err(FalconError::NoResponse),
        ];
        let mut device = ScriptedDevice::with_script(script);
        let config = LoopConfig {
            retry: RetryPolicy::bounded(3, Duration::ZERO),
            max_cycles: Some(6),
        };
        let stop = AtomicBool::new(false);
        let stats = run_cube(&mut device, &BoxBoundary::default(), &config, &stop).unwrap();
        assert_eq!(stats, LoopStats { cycles: 6, failed_cycles: 4 });
    }

    #[test]
    fn fatal_error_stops_loop() {
        let mut device = ScriptedDevice::with_script(vec![Ok(()), Err(FalconError::NotOpen)]);
        let stop = AtomicBool::new(false);
        let result = run_cube(&mut device, &BoxBoundary::default(), &cycles(10), &stop);
        assert!(matches!(result, Err(FalconError::NotOpen)));
        assert_eq!(device.flags.len(), 2);
    }

    #[test]
    fn stop_flag_ends_loop_and_closes() {
        let mut device = ScriptedDevice::with_script(vec![]);
        let stop = AtomicBool::new(true);
        let config = LoopConfig {
            retry: RetryPolicy::unbounded(),
            max_cycles: None,
        };
        let stats = run_cube(&mut device, &BoxBoundary::default(), &config, &stop).unwrap();
        assert_eq!(stats.cycles, 0);
        assert!(device.closed);
    }

    #[test]
    fn led_loop_applies_pending_ticks() {
        let (sender, ticks) = crossbeam_channel::unbounded();
        let mut device = ScriptedDevice::with_script(vec![]);
        let mut pulse = LedPulse::new(4);
        let stop = AtomicBool::new(false);

        let stats = run_led(&mut device, &mut pulse, &ticks, &cycles(4), &stop).unwrap();
        assert_eq!(stats.cycles, 4);
        assert!(device.leds.iter().all(|&l| l == Leds::OFF));
        assert!(device.flags.iter().all(|&f| f == IoFlags::FIRMWARE));

        for _ in 0..4 {
            sender.send(Instant::now()).unwrap();
        }
        device.leds.clear();
        run_led(&mut device, &mut pulse, &ticks, &cycles(4), &stop).unwrap();
        // 閾値0: count=0以外で点灯
        assert_eq!(pulse.wave().limit(), 0);
        assert_eq!(device.leds, [Leds::BLUE, Leds::BLUE, Leds::BLUE, Leds::OFF]);
    }
}
