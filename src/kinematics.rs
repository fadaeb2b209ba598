//! Falconのパラレルリンク機構の運動学．
//!
//! R.E. Stamperの博士論文のモデルに基づく．
//! 各脚の付け根の関節角`theta1`はエンコーダから得られ，エンドエフェクタの位置は
//! 逆運動学とヤコビアンを使ったニュートン法で求める．
//! 長さの単位はメートル，角度の単位はラジアン．

use std::f64::consts::PI;
use std::ops::Mul;

/// 脚の付け根から膝までの距離．
pub const A: f64 = 0.060;
/// すねの平行リンクの長さ．
pub const B: f64 = 0.1025;
/// すねの接続点からエンドエフェクタ中心までのu成分．
pub const C: f64 = 0.01443;
/// すねとエンドエフェクタをつなぐ関節の長さ．
pub const D: f64 = 0.01125;
/// 膝とすねをつなぐ関節の長さ．
pub const E: f64 = D;
/// すねの接続点からエンドエフェクタ中心までのv成分．
pub const F: f64 = -0.025;
/// 固定座標系の原点から脚の付け根までのu成分．
pub const R: f64 = 0.0400;
/// 固定座標系の原点から脚の付け根までのv成分．
pub const S: f64 = -0.02309;

/// 各脚の机面からの傾き(15度)．
const OFFSET_ANGLE: f64 = PI / 12.0;
/// 3本の脚それぞれの取り付け角．
pub const LEG_ANGLES: [f64; 3] = [
    PI / 2.0 + OFFSET_ANGLE,
    -PI / 6.0 + OFFSET_ANGLE,
    -5.0 * PI / 6.0 + OFFSET_ANGLE,
];

/// エンコーダホイールのスリット数．
const WHEEL_SLOTS: f64 = 320.0;
/// モータ軸の直径．
const SHAFT_DIAMETER: f64 = 0.01425;
/// 脚の円弧部の直径．
const SMALL_ARM_DIAMETER: f64 = 0.110;
/// エンコーダ値が0のときの関節角[deg]．
const THETA_OFFSET_DEGREES: f64 = 35.0;

/// 順運動学の収束判定に用いる関節角の誤差．
const FK_TARGET_ERROR: f64 = 0.01;
const FK_MAX_ITERATIONS: usize = 15;
/// トルクからモータ指令値への換算係数．
const TORQUE_TO_COMMAND: f64 = 10000.0;
/// これより大きいトルクは方向を保ったまま縮める．指令値は16ビットで送られる．
const MAX_TORQUE: f64 = i16::MAX as f64 / TORQUE_TO_COMMAND;

pub type Vec3 = [f64; 3];

/// 3本の脚の関節角．
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Angles {
    /// 付け根の関節角．エンコーダで観測できるのはこれだけ．
    pub theta1: Vec3,
    pub theta2: Vec3,
    pub theta3: Vec3,
}

impl Angles {
    fn is_finite(&self) -> bool {
        self.theta1
            .iter()
            .chain(&self.theta2)
            .chain(&self.theta3)
            .all(|angle| angle.is_finite())
    }
}

/// 行優先の3x3行列．
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix3(pub [[f64; 3]; 3]);

impl Matrix3 {
    pub fn transpose(&self) -> Matrix3 {
        let m = &self.0;
        Matrix3([
            [m[0][0], m[1][0], m[2][0]],
            [m[0][1], m[1][1], m[2][1]],
            [m[0][2], m[1][2], m[2][2]],
        ])
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// 逆行列．特異な場合は`None`．
    pub fn inverse(&self) -> Option<Matrix3> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() < f64::EPSILON {
            return None;
        }
        let m = &self.0;
        let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
            m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]
        };
        Some(Matrix3([
            [
                cofactor(1, 2, 1, 2) / det,
                -cofactor(0, 2, 1, 2) / det,
                cofactor(0, 1, 1, 2) / det,
            ],
            [
                -cofactor(1, 2, 0, 2) / det,
                cofactor(0, 2, 0, 2) / det,
                -cofactor(0, 1, 0, 2) / det,
            ],
            [
                cofactor(1, 2, 0, 1) / det,
                -cofactor(0, 2, 0, 1) / det,
                cofactor(0, 1, 0, 1) / det,
            ],
        ]))
    }
}

impl Mul<Vec3> for Matrix3 {
    type Output = Vec3;

    fn mul(self, v: Vec3) -> Vec3 {
        let m = &self.0;
        [
            m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
            m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
            m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
        ]
    }
}

/// エンコーダ値を付け根の関節角[deg]に変換する．
pub fn encoder_to_theta(ticks: i16) -> f64 {
    degrees_per_tick() * ticks as f64 + THETA_OFFSET_DEGREES
}

/// 付け根の関節角[deg]をもっとも近いエンコーダ値に変換する．
pub fn theta_to_encoder(degrees: f64) -> i16 {
    let ticks = ((degrees - THETA_OFFSET_DEGREES) / degrees_per_tick()).round();
    ticks.max(i16::MIN as f64).min(i16::MAX as f64) as i16
}

fn degrees_per_tick() -> f64 {
    let shaft_travel_per_tick = (SHAFT_DIAMETER * PI) / (WHEEL_SLOTS * 4.0);
    let arm_travel_per_degree = (PI * SMALL_ARM_DIAMETER) / 360.0;
    shaft_travel_per_tick / arm_travel_per_degree
}

/// エンドエフェクタの位置から各脚の関節角を求める．
/// 作業空間の外の位置では角度が`NaN`になる．
pub fn inverse(position: Vec3) -> Angles {
    let mut angles = Angles::default();
    for (leg, &phi) in LEG_ANGLES.iter().enumerate() {
        // 脚ごとのUVW座標系に変換する
        let (sin_phi, cos_phi) = phi.sin_cos();
        let pu = cos_phi * position[0] + sin_phi * position[1] - R;
        let pv = -sin_phi * position[0] + cos_phi * position[1] - S;
        let pw = position[2];

        // 解は2つあるが，Falconの構造では正の側だけが意味をもつ
        let theta3 = ((pv + F) / B).acos();
        let sin3 = theta3.sin();

        let common = pw * pw + pu * pu + 2.0 * C * pu + A * A + C * C - D * D - E * E
            - B * B * sin3 * sin3
            - 2.0 * B * E * sin3
            - 2.0 * B * D * sin3
            - 2.0 * D * E;
        let l0 = common - 2.0 * A * pu - 2.0 * A * C;
        let l1 = -4.0 * A * pw;
        let l2 = common + 2.0 * A * pu + 2.0 * A * C;

        let t = (-l1 - (l1 * l1 - 4.0 * l0 * l2).sqrt()) / (2.0 * l2);
        let theta1 = t.atan() * 2.0;
        let theta2 = ((-pu + A * theta1.cos() - C) / (-D - E - B * sin3)).acos();

        angles.theta1[leg] = theta1;
        angles.theta2[leg] = theta2;
        angles.theta3[leg] = theta3;
    }
    angles
}

/// 関節角速度から直交座標の速度への写像．
/// 転置すると力から関節トルクへの写像になる．
pub fn jacobian(angles: &Angles) -> Option<Matrix3> {
    let mut rows = [[0.0; 3]; 3];
    for (leg, &phi) in LEG_ANGLES.iter().enumerate() {
        let (sin1, cos1) = angles.theta1[leg].sin_cos();
        let (sin2, cos2) = angles.theta2[leg].sin_cos();
        let (sin3, cos3) = angles.theta3[leg].sin_cos();
        let (sin_phi, cos_phi) = phi.sin_cos();

        let den = -A * sin3 * (sin1 * cos2 - sin2 * cos1);
        rows[leg] = [
            (cos_phi * cos2 * sin3 - sin_phi * cos3) / den,
            (sin_phi * cos2 * sin3 + cos_phi * cos3) / den,
            (sin2 * sin2) / den,
        ];
    }
    Matrix3(rows).inverse()
}

/// 付け根の関節角から位置を求める．
/// `guess`から出発してニュートン法で探索し，収束しなければ`None`を返す．
pub fn forward(theta1: Vec3, guess: Vec3) -> Option<Vec3> {
    let mut position = guess;
    let mut previous_error = f64::MAX;
    let mut step = 0.5;

    for _ in 0..FK_MAX_ITERATIONS {
        let angles = inverse(position);
        if !angles.is_finite() {
            return None;
        }
        let j = jacobian(&angles)?;

        let delta = [
            theta1[0] - angles.theta1[0],
            theta1[1] - angles.theta1[1],
            theta1[2] - angles.theta1[2],
        ];
        let direction = j * delta;
        for axis in 0..3 {
            position[axis] += direction[axis] * step;
        }

        let error = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        if error < FK_TARGET_ERROR {
            return Some(position);
        }
        // 行き過ぎたら次は歩幅を縮める
        if error > previous_error {
            step /= 2.0;
        }
        previous_error = error;
    }
    None
}

/// 直前の位置を次の探索の初期値として保持する運動学モデル．
#[derive(Debug, Clone)]
pub struct StamperKinematics {
    position: Vec3,
}

impl StamperKinematics {
    pub fn new() -> StamperKinematics {
        // 原点から始めると逆行列が求まらないので，少し離しておく
        StamperKinematics {
            position: [0.0, 0.0, 0.08],
        }
    }

    /// 最後に求めた位置．
    pub fn last_position(&self) -> Vec3 {
        self.position
    }

    /// エンコーダ値から位置を求める．
    /// 収束しなかった場合は直前の位置を保ったまま`None`を返す．
    pub fn position(&mut self, encoders: [i16; 3]) -> Option<Vec3> {
        let theta1 = encoders.map(|ticks| encoder_to_theta(ticks).to_radians());
        let position = forward(theta1, self.position)?;
        self.position = position;
        Some(position)
    }

    /// 位置`position`で力`force`[N]を発生させるためのモータ指令値．
    pub fn motor_torques(&self, position: Vec3, force: Vec3) -> Option<[i16; 3]> {
        let angles = inverse(position);
        if !angles.is_finite() {
            return None;
        }
        let j = jacobian(&angles)?;
        let mut torque = j.transpose() * force;

        // 最大のトルクが上限を超える場合は，力の向きを保つためすべてのトルクを同じ比率で縮める
        let largest = torque.iter().fold(0.0f64, |acc, t| acc.max(t.abs()));
        if largest > MAX_TORQUE {
            let scale = largest / MAX_TORQUE;
            for t in &mut torque {
                *t /= scale;
            }
        }

        Some(torque.map(|t| {
            let command = -t * TORQUE_TO_COMMAND;
            command.max(-(i16::MAX as f64)).min(i16::MAX as f64) as i16
        }))
    }
}

impl Default for StamperKinematics {
    fn default() -> Self {
        StamperKinematics::new()
    }
}
