//! 一辺6cmの立方体に触れたときの反力を提示するデモ．
//!
//! `cargo run --example cube -- --firmware nifalcon_test_fw.bin`

use clap::Parser;
use falcon_haptics::sim::SimulatedFalcon;
use falcon_haptics::{
    session, BoxBoundary, FalconDevice, HapticDevice, LoopConfig, NewtonPerMeter, RetryPolicy,
    SerialComm, SerialFalcon,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cube", about = "Push back from the walls of a virtual cube")]
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

    /// 壁のばね定数[N/m]
    #[arg(long, default_value = "1000.0")]
    stiffness: f64,

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

    let stiffness = NewtonPerMeter::<f64>::new(args.stiffness);
    let boundary = BoxBoundary::default().with_stiffness(stiffness);
    let config = LoopConfig {
        retry: retry_policy(args.max_failures, args.backoff_us),
        max_cycles: args.cycles,
    };
    let stats = session::run_cube(device.as_mut(), &boundary, &config, &stop)?;
    println!(
        "Demonstration finished! {} cycles, {} failed",
        stats.cycles, stats.failed_cycles
    );
    Ok(())
}

fn open_device(args: &Args) -> falcon_haptics::Result<Box<dyn HapticDevice>> {
    if args.simulate {
        let sim = SimulatedFalcon::with_firmware(1);
        // 立方体の底面から5mm入り込んだ位置に置く
        sim.handle().set_position([0.0, 0.0, 0.10]);
        return Ok(Box::new(FalconDevice::new(sim)));
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
