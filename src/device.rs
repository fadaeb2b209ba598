//! 通信路，ファームウェア，運動学をまとめたFalcon本体．

use crate::comm::{FalconComm, SerialComm};
use crate::error::{FalconError, Result};
use crate::firmware::{read_firmware_file, NovintFirmware};
use crate::kinematics::{StamperKinematics, Vec3};
use crate::packet::{Buttons, HomingStatus, Leds};
use crate::{values, Meter, Newton, Triplet};
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;
use tracing::{debug, info, warn};

/// ファームウェアの書き込みを試みる回数．
const FIRMWARE_LOAD_RETRIES: u32 = 10;

/// `run_io_loop`で行う処理の組み合わせ．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoFlags(u8);

impl IoFlags {
    /// ファームウェアとの送受信．失敗をエラーとして報告する．
    pub const FIRMWARE: IoFlags = IoFlags(0x1);
    /// 力からモータ指令への変換と，エンコーダ値から位置への変換．
    pub const KINEMATIC: IoFlags = IoFlags(0x2);
    /// グリップのボタン状態の更新．
    pub const GRIP: IoFlags = IoFlags(0x4);
    pub const ALL: IoFlags = IoFlags(0x7);

    pub const fn from_bits(bits: u8) -> IoFlags {
        IoFlags(bits & 0x7)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for IoFlags {
    type Output = IoFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        IoFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// デモが必要とする最小限のデバイス操作．
pub trait HapticDevice {
    /// 接続されているデバイスの数．
    fn device_count(&mut self) -> Result<usize>;

    /// `index`番目のデバイスを開く．
    fn open(&mut self, index: usize) -> Result<()>;

    /// ファームウェアが動いていなければ書き込む．
    fn load_firmware(&mut self) -> Result<()>;

    /// 1回分の送受信を行う．
    fn run_io_loop(&mut self, flags: IoFlags) -> Result<()>;

    /// エンドエフェクタの現在位置．
    fn position(&self) -> Triplet<Meter<f64>>;

    /// エンドエフェクタに発生させる力を指令する．次の`run_io_loop`で送られる．
    fn set_force(&mut self, force: Triplet<Newton<f64>>);

    fn set_leds(&mut self, leds: Leds);

    fn close(&mut self);
}

/// Novint SDKファームウェアとStamperの運動学モデルで動かすFalcon．
pub struct FalconDevice<C: FalconComm> {
    firmware: NovintFirmware<C>,
    kinematics: StamperKinematics,
    /// 書き込むファームウェアイメージ．
    firmware_image: Option<Vec<u8>>,
    skip_checksum: bool,
    /// 最後に求めた位置[m]．
    position: Vec3,
    /// 指令されている力[N]．
    force: Vec3,
    buttons: Buttons,
    error_count: u64,
}

/// OSのシリアルポート経由でつながったFalcon．
pub type SerialFalcon = FalconDevice<SerialComm>;

impl<C: FalconComm> FalconDevice<C> {
    pub fn new(comm: C) -> FalconDevice<C> {
        let kinematics = StamperKinematics::new();
        FalconDevice {
            firmware: NovintFirmware::new(comm),
            position: kinematics.last_position(),
            kinematics,
            firmware_image: None,
            skip_checksum: false,
            force: [0.0; 3],
            buttons: Buttons::default(),
            error_count: 0,
        }
    }

    /// `load_firmware`で書き込むイメージを設定する．
    pub fn with_firmware_image(mut self, image: Vec<u8>) -> FalconDevice<C> {
        self.firmware_image = Some(image);
        self
    }

    /// `load_firmware`で書き込むイメージをファイルから読み込んで設定する．
    pub fn with_firmware_file(self, path: impl AsRef<Path>) -> Result<FalconDevice<C>> {
        let image = read_firmware_file(path)?;
        Ok(self.with_firmware_image(image))
    }

    pub fn skip_checksum(mut self, skip: bool) -> FalconDevice<C> {
        self.skip_checksum = skip;
        self
    }

    pub fn firmware(&self) -> &NovintFirmware<C> {
        &self.firmware
    }

    pub fn firmware_mut(&mut self) -> &mut NovintFirmware<C> {
        &mut self.firmware
    }

    pub fn buttons(&self) -> Buttons {
        self.buttons
    }

    pub fn homing_status(&self) -> HomingStatus {
        self.firmware.homing_status()
    }

    pub fn set_homing_mode(&mut self, homing: bool) {
        self.firmware.set_homing_mode(homing);
    }

    /// ファームウェアとの送受信に失敗した回数．
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// 最後に受け取ったフレーム．
    pub fn raw_status(&self) -> Option<String> {
        self.firmware.raw_status()
    }
}

impl<C: FalconComm> HapticDevice for FalconDevice<C> {
    fn device_count(&mut self) -> Result<usize> {
        self.firmware.comm_mut().device_count()
    }

    fn open(&mut self, index: usize) -> Result<()> {
        self.firmware.comm_mut().open(index)?;
        self.firmware.reset_state();
        info!(index, "Falcon opened");
        Ok(())
    }

    fn load_firmware(&mut self) -> Result<()> {
        if self.firmware.is_firmware_loaded()? {
            debug!("Firmware already running");
            return Ok(());
        }
        let image = self
            .firmware_image
            .as_deref()
            .ok_or(FalconError::FirmwareNotLoaded)?;
        info!("Loading firmware");
        self.firmware
            .load_firmware_with_retries(image, FIRMWARE_LOAD_RETRIES, self.skip_checksum)?;
        if !self.firmware.is_firmware_loaded()? {
            warn!("Firmware didn't load correctly");
            return Err(FalconError::FirmwareNotLoaded);
        }
        Ok(())
    }

    fn run_io_loop(&mut self, flags: IoFlags) -> Result<()> {
        if flags.contains(IoFlags::KINEMATIC) {
            let torques = self
                .kinematics
                .motor_torques(self.position, self.force)
                .unwrap_or([0; 3]);
            self.firmware.set_torques(torques);
        }

        if let Err(e) = self.firmware.run_io_loop() {
            if flags.contains(IoFlags::FIRMWARE) {
                self.error_count += 1;
                return Err(e);
            }
        }

        if flags.contains(IoFlags::GRIP) {
            self.buttons = self.firmware.buttons();
        }

        if flags.contains(IoFlags::KINEMATIC) {
            match self.kinematics.position(self.firmware.encoders()) {
                Some(position) => self.position = position,
                None => debug!(encoders = ?self.firmware.encoders(), "Position did not converge"),
            }
        }
        Ok(())
    }

    fn position(&self) -> Triplet<Meter<f64>> {
        Triplet::new(self.position[0], self.position[1], self.position[2]).map(Meter::new)
    }

    fn set_force(&mut self, force: Triplet<Newton<f64>>) {
        self.force = values(force);
    }

    fn set_leds(&mut self, leds: Leds) {
        self.firmware.set_leds(leds);
    }

    fn close(&mut self) {
        let comm = self.firmware.comm_mut();
        if comm.is_open() {
            comm.close();
            self.firmware.reset_state();
        }
    }
}

impl<C: FalconComm> Drop for FalconDevice<C> {
    fn drop(&mut self) {
        self.close();
    }
}
