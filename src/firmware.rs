//! Novint SDKに同梱されているファームウェアとの通信．
//!
//! 制御ループ(PID等)はホスト側で回す前提のファームウェアで，ホストは常に
//! 指令を送り続ける必要がある．1回の`run_io_loop`で指令を1フレーム送り，
//! 前回の指令に対する応答を1フレーム受け取る．

use crate::comm::FalconComm;
use crate::error::{FalconError, Result};
use crate::packet::{Buttons, CommandPacket, HomingStatus, Leds, PacketAssembler, StatusPacket};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// ファームウェアを一度に送るバイト数．
/// フルスピードUSBのパケットは64バイトで，FTDIがそのうち2バイトを使う．
pub const FIRMWARE_CHUNK_SIZE: usize = 62;
/// 受信バッファの大きさ．
const READ_BUFFER_SIZE: usize = 128;
/// ポーリングが必要な通信路で応答を待つ間隔．
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// 応答が届かないまま経過したサイクルがこの数に達したら，指令を送り直す．
const RESEND_AFTER: u32 = 50;

/// ファームウェアイメージをファイルから読み込む．
pub fn read_firmware_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|source| FalconError::FirmwareFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Novint SDKファームウェアと通信するセッション．
pub struct NovintFirmware<C> {
    comm: C,
    /// 次に送る指令．
    command: CommandPacket,
    /// 最後に受け取った状態．
    status: StatusPacket,
    assembler: PacketAssembler,
    /// 指令を送ったあと，まだ応答を読んでいない．
    has_written: bool,
    /// 応答を待っているサイクル数．
    waiting_cycles: u32,
    firmware_loaded: bool,
    loop_count: u64,
    read_buffer: [u8; READ_BUFFER_SIZE],
}

impl<C: FalconComm> NovintFirmware<C> {
    pub fn new(comm: C) -> NovintFirmware<C> {
        NovintFirmware {
            comm,
            command: CommandPacket::default(),
            status: StatusPacket::default(),
            assembler: PacketAssembler::new(),
            has_written: false,
            waiting_cycles: 0,
            firmware_loaded: false,
            loop_count: 0,
            read_buffer: [0; READ_BUFFER_SIZE],
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn comm_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    /// 送受信の途中状態を捨てる．デバイスを開き直したときに呼ぶ．
    pub fn reset_state(&mut self) {
        self.has_written = false;
        self.waiting_cycles = 0;
        self.assembler.reset();
    }

    /// ファームウェアをFalconに書き込む．
    /// ブートローダは受け取ったバイトをそのまま送り返してくるので，`skip_checksum`が`false`なら照合する．
    pub fn load_firmware(&mut self, image: &[u8], skip_checksum: bool) -> Result<()> {
        if !self.comm.is_open() {
            return Err(FalconError::NotOpen);
        }
        self.comm.set_firmware_mode()?;

        let mut echo = [0; FIRMWARE_CHUNK_SIZE];
        for (index, chunk) in image.chunks(FIRMWARE_CHUNK_SIZE).enumerate() {
            self.comm.write(chunk)?;
            let echo = &mut echo[..chunk.len()];
            self.comm.read_exact_blocking(echo)?;
            if skip_checksum {
                continue;
            }
            let mismatch = chunk.iter().zip(echo.iter()).position(|(sent, back)| sent != back);
            if let Some(position) = mismatch {
                return Err(FalconError::ChecksumMismatch {
                    offset: index * FIRMWARE_CHUNK_SIZE + position,
                });
            }
        }
        if skip_checksum {
            debug!("Skipped firmware checksum");
        }

        self.comm.set_normal_mode()?;
        self.reset_state();
        self.firmware_loaded = true;
        info!(bytes = image.len(), "Firmware loaded");
        Ok(())
    }

    /// 失敗しても`retries`回までファームウェアの書き込みを試みる．
    pub fn load_firmware_with_retries(
        &mut self,
        image: &[u8],
        retries: u32,
        skip_checksum: bool,
    ) -> Result<()> {
        let attempts = retries.max(1);
        let mut last_error = FalconError::FirmwareNotLoaded;
        for attempt in 1..=attempts {
            match self.load_firmware(image, skip_checksum) {
                Ok(()) => return Ok(()),
                Err(FalconError::NotOpen) => return Err(FalconError::NotOpen),
                Err(e) => {
                    warn!(attempt, attempts, "Could not load firmware: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// ファームウェアが動作しているかを，実際に応答が返ってくるかどうかで確かめる．
    pub fn is_firmware_loaded(&mut self) -> Result<bool> {
        let polling = self.comm.requires_poll();
        let attempts = if polling { 2500 } else { 10 };
        for attempt in 0..attempts {
            if polling && attempt % 100 == 0 {
                self.reset_state();
            }
            match self.run_io_loop() {
                Ok(()) => {
                    self.firmware_loaded = true;
                    return Ok(true);
                }
                Err(e) if e.is_transient() => {
                    if polling {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.firmware_loaded = false;
        Ok(false)
    }

    /// 前回の指令に対する応答を読み，次の指令を送る．
    /// 新しい状態を受け取れなかった場合は`NoResponse`を返す．
    pub fn run_io_loop(&mut self) -> Result<()> {
        if !self.comm.is_open() {
            return Err(FalconError::NotOpen);
        }

        let mut received = false;
        if self.has_written {
            let available = self.comm.bytes_available()?;
            if available == 0 {
                self.waiting_cycles += 1;
                if self.waiting_cycles >= RESEND_AFTER {
                    // 応答が失われたとみなす
                    debug!(cycles = self.waiting_cycles, "Resending command");
                    self.has_written = false;
                    self.waiting_cycles = 0;
                }
                return Err(FalconError::NoResponse);
            }
            self.waiting_cycles = 0;
            let size = available.min(READ_BUFFER_SIZE);
            let count = self.comm.read(&mut self.read_buffer[..size])?;
            if let Some(status) = self.assembler.push(&self.read_buffer[..count]) {
                self.status = status;
                received = true;
            }
            self.has_written = false;
            self.loop_count += 1;
        }

        self.comm.write(&self.command.encode())?;
        self.has_written = true;

        if received {
            Ok(())
        } else {
            Err(FalconError::NoResponse)
        }
    }

    pub fn set_torques(&mut self, torques: [i16; 3]) {
        self.command.torques = torques;
    }

    pub fn set_leds(&mut self, leds: Leds) {
        self.command.leds = leds;
    }

    pub fn leds(&self) -> Leds {
        self.command.leds
    }

    /// ホーミングモード中はファームウェアが各軸の原点合わせを行う．
    pub fn set_homing_mode(&mut self, homing: bool) {
        self.command.homing = homing;
    }

    pub fn encoders(&self) -> [i16; 3] {
        self.status.encoders
    }

    pub fn buttons(&self) -> Buttons {
        self.status.buttons
    }

    pub fn homing_status(&self) -> HomingStatus {
        self.status.homed
    }

    /// 最後に受け取った完全なフレーム．
    pub fn raw_status(&self) -> Option<String> {
        self.assembler.last_frame()
    }

    /// 応答を読んだ回数．
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn firmware_loaded(&self) -> bool {
        self.firmware_loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedFalcon;

    fn opened(sim: SimulatedFalcon) -> NovintFirmware<SimulatedFalcon> {
        let mut firmware = NovintFirmware::new(sim);
        firmware.comm_mut().open(0).unwrap();
        firmware
    }

    #[test]
    fn io_requires_open_device() {
        let mut firmware = NovintFirmware::new(SimulatedFalcon::new(1));
        assert!(matches!(firmware.run_io_loop(), Err(FalconError::NotOpen)));
        assert!(matches!(
            firmware.load_firmware(&[1, 2, 3], false),
            Err(FalconError::NotOpen)
        ));
    }

    #[test]
    fn loads_firmware_in_chunks() {
        let sim = SimulatedFalcon::new(1);
        let handle = sim.handle();
        let mut firmware = opened(sim);
        let image: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

        firmware.load_firmware(&image, false).unwrap();

        assert!(firmware.firmware_loaded());
        assert_eq!(handle.firmware_image(), image);
        assert!(firmware.is_firmware_loaded().unwrap());
    }

    #[test]
    fn detects_corrupted_echo() {
        let sim = SimulatedFalcon::new(1);
        let handle = sim.handle();
        handle.corrupt_echo_at(70);
        let mut firmware = opened(sim);
        let image = vec![0x55; 100];

        assert!(matches!(
            firmware.load_firmware(&image, false),
            Err(FalconError::ChecksumMismatch { offset: 70 })
        ));
    }

    #[test]
    fn skipping_checksum_ignores_corrupted_echo() {
        let sim = SimulatedFalcon::new(1);
        sim.handle().corrupt_echo_at(3);
        let mut firmware = opened(sim);
        firmware.load_firmware(&[0x55; 10], true).unwrap();
    }

    #[test]
    fn handshake_failure_is_reported() {
        let sim = SimulatedFalcon::new(1);
        sim.handle().set_bootloader_silent(true);
        let mut firmware = opened(sim);
        assert!(matches!(
            firmware.load_firmware_with_retries(&[0x55; 10], 3, false),
            Err(FalconError::FirmwareHandshake)
        ));
    }

    #[test]
    fn without_firmware_nothing_answers() {
        let mut firmware = opened(SimulatedFalcon::new(1));
        assert!(!firmware.is_firmware_loaded().unwrap());
    }

    #[test]
    fn first_cycle_only_writes() {
        let sim = SimulatedFalcon::with_firmware(1);
        let handle = sim.handle();
        let mut firmware = opened(sim);
        firmware.set_leds(Leds::BLUE);
        firmware.set_torques([10, -20, 30]);

        assert!(matches!(firmware.run_io_loop(), Err(FalconError::NoResponse)));
        let command = handle.last_command().unwrap();
        assert_eq!(command.leds, Leds::BLUE);
        assert_eq!(command.torques, [10, -20, 30]);

        handle.set_encoders([5, 6, 7]);
        handle.set_buttons(Buttons::CIRCLE);
        // 1回目の指令への応答はすでに届いているので，新しい値は次の応答に載る
        firmware.run_io_loop().unwrap();
        firmware.run_io_loop().unwrap();
        assert_eq!(firmware.encoders(), [5, 6, 7]);
        assert!(firmware.buttons().is_pressed(Buttons::CIRCLE));
        assert_eq!(firmware.loop_count(), 2);
        assert!(firmware.raw_status().is_some());
    }

    #[test]
    fn missing_reply_is_transient() {
        let sim = SimulatedFalcon::with_firmware(1);
        let handle = sim.handle();
        let mut firmware = opened(sim);
        handle.drop_replies(1);
        let _ = firmware.run_io_loop();
        let error = firmware.run_io_loop().unwrap_err();
        assert!(error.is_transient());
    }

    #[test]
    fn lost_reply_is_resent() {
        let sim = SimulatedFalcon::with_firmware(1);
        let handle = sim.handle();
        let mut firmware = opened(sim);
        handle.drop_replies(1);
        let _ = firmware.run_io_loop();
        let sent = handle.commands().len();

        let mut recovered = false;
        for _ in 0..RESEND_AFTER + 5 {
            if firmware.run_io_loop().is_ok() {
                recovered = true;
                break;
            }
        }
        assert!(recovered);
        assert!(handle.commands().len() > sent);
    }

    #[test]
    fn missing_firmware_file_names_path() {
        let error = read_firmware_file("/nonexistent/falcon.bin").unwrap_err();
        assert!(matches!(error, FalconError::FirmwareFile { .. }));
        assert!(error.to_string().contains("falcon.bin"));
    }
}
