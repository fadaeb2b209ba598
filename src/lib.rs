//! Novint Falcon(3自由度力覚提示デバイス)と通信するためのライブラリ．
//!
//! - [`device::FalconDevice`]: デバイスの列挙，オープン，ファームウェアの書き込み，1回分の送受信．
//! - [`cube::BoxBoundary`]: 立方体の壁に触れたときのばね反力．
//! - [`led::LedPulse`]: 三角波でLEDの明るさを変える．
//! - [`session`]: 上の2つをデバイスにつないで回すループ．
//! - [`sim::SimulatedFalcon`]: 実機なしで動かすための模擬デバイス．

pub mod comm;
pub mod cube;
pub mod device;
pub mod error;
pub mod firmware;
pub mod kinematics;
pub mod led;
pub mod packet;
pub mod session;
pub mod sim;

use dimensioned::si::SI;
use dimensioned::typenum::Quot;
pub use dimensioned::si::{Meter, Newton};
pub use pair_macro::Triplet;

pub use comm::{FalconComm, SerialComm, SerialConfig};
pub use cube::BoxBoundary;
pub use device::{FalconDevice, HapticDevice, IoFlags, SerialFalcon};
pub use error::{FalconError, Result};
pub use led::{DutyCounter, LedPulse, TriangleWave};
pub use packet::{Buttons, Leds};
pub use session::{LoopConfig, LoopStats, RetryPolicy};

/// ばね定数の単位．
pub type NewtonPerMeter<T> = Quot<Newton<T>, Meter<T>>;

/// 単位付きの3次元ベクトルから数値を取り出す．
pub(crate) fn values<U>(v: Triplet<SI<f64, U>>) -> [f64; 3] {
    let v = v.map(|e| e.value_unsafe);
    [v.x, v.y, v.z]
}
