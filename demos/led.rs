//! 青色LEDをゆっくり明滅させるデモ．
//!
//! `cargo run --example led -- --total-time 25 --tick-ms 100`

use clap::Parser;
use falcon_haptics::led::wave_ticks;
use falcon_haptics::sim::SimulatedFalcon;
use falcon_haptics::{
    session, FalconDevice, HapticDevice, LedPulse, LoopConfig, RetryPolicy, SerialComm,
    SerialFalcon,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "led", about = "Fade the blue LED in and out")]
struct Args {
    /// 開くデバイスの番号
    #[arg(long, default_value = "0")]
    index: usize,

    /// ファームウェアが動いていないときに書き込むイメージ
    #[arg(long, value_name = "FILE")]
    firmware: Option<PathBuf>,

    /// 書き込んだファームウェアの照合を省く
    #[arg(long)]
    skip_checksum: bool,

    /// 明るさの段階数
    #[arg(long, default_value = "25", value_parser = clap::value_parser!(u32).range(1..))]
    total_time: u32,

    /// 明るさを1段階変える間隔[ms]
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// 連続して失敗してよいI/Oサイクルの数．0なら無制限
    #[arg(long, default_value = "10000")]
    max_failures: u32,

    /// 失敗したサイクルのあとに待つ時間[us]
    #[arg(long, default_value = "100")]
    backoff_us: u64,

    /// 行うI/Oサイクルの数．省略すればCtrl-Cまで続ける
    #[arg(long)]
    cycles: Option<u64>,

    /// 実機の代わりに模擬デバイスを使う
    #[arg(long)]
    simulate: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}, exiting...", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> falcon_haptics::Result<()> {
    let mut device = open_device(args)?;
    session::open_session(device.as_mut(), args.index)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || stop_clone.store(true, Ordering::Relaxed)) {
        eprintln!("Cannot install Ctrl-C handler: {}", e);
    }

    let mut pulse = LedPulse::new(args.total_time);
    let ticks = wave_ticks(Duration::from_millis(args.tick_ms));
    let config = LoopConfig {
        retry: retry_policy(args.max_failures, args.backoff_us),
        max_cycles: args.cycles,
    };
    let stats = session::run_led(device.as_mut(), &mut pulse, &ticks, &config, &stop)?;
    println!(
        "Demonstration finished! {} cycles, {} failed",
        stats.cycles, stats.failed_cycles
    );
    Ok(())
}

fn open_device(args: &Args) -> falcon_haptics::Result<Box<dyn HapticDevice>> {
    if args.simulate {
        return Ok(Box::new(FalconDevice::new(SimulatedFalcon::with_firmware(1))));
    }
    let mut device = SerialFalcon::new(SerialComm::default()).skip_checksum(args.skip_checksum);
    if let Some(path) = &args.firmware {
        device = device.with_firmware_file(path)?;
    }
    Ok(Box::new(device))
}

fn retry_policy(max_failures: u32, backoff_us: u64) -> RetryPolicy {
    let backoff = Duration::from_micros(backoff_us);
    match max_failures {
        0 => RetryPolicy {
            max_consecutive_failures: None,
            backoff,
        },
        n => RetryPolicy::bounded(n, backoff),
    }
}
