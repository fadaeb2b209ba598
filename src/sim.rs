//! 実機なしで動作を確かめるための模擬Falcon．
//!
//! 実機と同じバイト列で通信する．ブートローダとのハンドシェイク，ファームウェアのエコーバック，
//! 指令フレームへの応答をメモリ上で再現する．

use crate::comm::{
    FalconComm, BOOTLOADER_BAUD_RATE, BOOTLOADER_QUERY, BOOTLOADER_REPLY, FIRMWARE_BAUD_RATE,
    FIRMWARE_START, NORMAL_BAUD_RATE,
};
use crate::error::{FalconError, Result};
use crate::kinematics::{self, Vec3};
use crate::packet::{Buttons, CommandPacket, HomingStatus, StatusPacket, PACKET_SIZE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// ブートローダが`'A'`を受け取ったときに返すバイト．
const FIRMWARE_START_ACK: u8 = 0x13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// ファームウェアが動いておらず，何にも応答しない．
    Idle,
    /// DTRの立ち上がりを受けて問い合わせを待っている．
    BootloaderArmed,
    /// 問い合わせに答え，転送開始の合図を待っている．
    BootloaderQueried,
    /// ファームウェアを受信中．
    ReceivingFirmware,
    /// ファームウェアが動作中．
    Running,
}

#[derive(Debug)]
struct SimState {
    device_count: usize,
    open: bool,
    mode: Mode,
    baud_rate: u32,
    dtr: bool,
    rts: bool,
    firmware_loaded: bool,
    firmware_image: Vec<u8>,
    corrupt_echo_at: Option<usize>,
    bootloader_silent: bool,
    /// ホストが読み出すのを待っているバイト列．
    rx: VecDeque<u8>,
    /// 受信途中の指令フレーム．
    partial: Vec<u8>,
    commands: Vec<CommandPacket>,
    status: StatusPacket,
    replies_to_drop: u32,
}

impl SimState {
    fn new(device_count: usize, firmware_loaded: bool) -> SimState {
        SimState {
            device_count,
            open: false,
            mode: Mode::Idle,
            baud_rate: NORMAL_BAUD_RATE,
            dtr: false,
            rts: false,
            firmware_loaded,
            firmware_image: Vec::new(),
            corrupt_echo_at: None,
            bootloader_silent: false,
            rx: VecDeque::new(),
            partial: Vec::new(),
            commands: Vec::new(),
            status: StatusPacket::default(),
            replies_to_drop: 0,
        }
    }

    fn receive(&mut self, data: &[u8]) {
        match self.mode {
            Mode::Idle => {}
            Mode::BootloaderArmed => {
                if data == BOOTLOADER_QUERY && !self.bootloader_silent {
                    self.rx.extend(BOOTLOADER_REPLY.iter());
                    self.mode = Mode::BootloaderQueried;
                }
            }
            Mode::BootloaderQueried => {
                if data == [FIRMWARE_START] && self.baud_rate == FIRMWARE_BAUD_RATE {
                    self.rx.push_back(FIRMWARE_START_ACK);
                    self.firmware_image.clear();
                    self.mode = Mode::ReceivingFirmware;
                }
            }
            Mode::ReceivingFirmware => {
                for &byte in data {
                    let offset = self.firmware_image.len();
                    self.firmware_image.push(byte);
                    let echo = if self.corrupt_echo_at == Some(offset) {
                        !byte
                    } else {
                        byte
                    };
                    self.rx.push_back(echo);
                }
            }
            Mode::Running => self.receive_commands(data),
        }
    }

    fn receive_commands(&mut self, data: &[u8]) {
        self.partial.extend_from_slice(data);
        while self.partial.len() >= PACKET_SIZE {
            let mut frame = [0; PACKET_SIZE];
            frame.copy_from_slice(&self.partial[..PACKET_SIZE]);
            self.partial.drain(..PACKET_SIZE);

            let command = match CommandPacket::decode(&frame) {
                Some(command) => command,
                None => continue,
            };
            self.commands.push(command);
            if self.replies_to_drop > 0 {
                self.replies_to_drop -= 1;
                continue;
            }
            self.rx.extend(self.status.encode().iter());
        }
    }

    fn set_baud_rate(&mut self, baud_rate: u32) {
        self.baud_rate = baud_rate;
        if baud_rate == NORMAL_BAUD_RATE && self.mode == Mode::ReceivingFirmware {
            self.firmware_loaded = !self.firmware_image.is_empty();
            self.mode = if self.firmware_loaded {
                Mode::Running
            } else {
                Mode::Idle
            };
            self.rx.clear();
            self.partial.clear();
        }
    }

    fn set_dtr(&mut self, level: bool) {
        let rising = level && !self.dtr;
        self.dtr = level;
        if rising && self.baud_rate == BOOTLOADER_BAUD_RATE && !self.rts {
            // リセットしてブートローダに入る
            self.firmware_loaded = false;
            self.mode = Mode::BootloaderArmed;
            self.rx.clear();
        }
    }
}

/// 模擬Falconの状態を外から操作，観察するためのハンドル．
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// 次の応答に載せるエンコーダ値を設定する．
    pub fn set_encoders(&self, encoders: [i16; 3]) {
        self.state.lock().status.encoders = encoders;
    }

    /// エンドエフェクタを`position`[m]に動かしたことにする．
    /// 作業空間の外なら何もせず`false`を返す．
    pub fn set_position(&self, position: Vec3) -> bool {
        let theta1 = kinematics::inverse(position).theta1;
        if theta1.iter().any(|t| !t.is_finite()) {
            return false;
        }
        self.set_encoders(theta1.map(|t| kinematics::theta_to_encoder(t.to_degrees())));
        true
    }

    pub fn set_buttons(&self, buttons: Buttons) {
        self.state.lock().status.buttons = buttons;
    }

    pub fn set_homing_status(&self, homed: HomingStatus) {
        self.state.lock().status.homed = homed;
    }

    /// 次の`count`個の指令に応答しない．
    pub fn drop_replies(&self, count: u32) {
        self.state.lock().replies_to_drop = count;
    }

    /// ファームウェアの`offset`バイトめのエコーを壊す．
    pub fn corrupt_echo_at(&self, offset: usize) {
        self.state.lock().corrupt_echo_at = Some(offset);
    }

    /// ブートローダが問い合わせに答えないようにする．
    pub fn set_bootloader_silent(&self, silent: bool) {
        self.state.lock().bootloader_silent = silent;
    }

    pub fn set_device_count(&self, count: usize) {
        self.state.lock().device_count = count;
    }

    /// 最後に書き込まれたファームウェア．
    pub fn firmware_image(&self) -> Vec<u8> {
        self.state.lock().firmware_image.clone()
    }

    pub fn firmware_loaded(&self) -> bool {
        self.state.lock().firmware_loaded
    }

    pub fn last_command(&self) -> Option<CommandPacket> {
        self.state.lock().commands.last().copied()
    }

    /// これまでに受け取った指令．
    pub fn commands(&self) -> Vec<CommandPacket> {
        self.state.lock().commands.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn baud_rate(&self) -> u32 {
        self.state.lock().baud_rate
    }
}

/// `FalconComm`を実装した模擬Falcon．
#[derive(Debug)]
pub struct SimulatedFalcon {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedFalcon {
    /// ファームウェアが書き込まれていないFalconが`device_count`台つながっている状態．
    pub fn new(device_count: usize) -> SimulatedFalcon {
        SimulatedFalcon {
            state: Arc::new(Mutex::new(SimState::new(device_count, false))),
        }
    }

    /// ファームウェアがすでに動いているFalconが`device_count`台つながっている状態．
    pub fn with_firmware(device_count: usize) -> SimulatedFalcon {
        SimulatedFalcon {
            state: Arc::new(Mutex::new(SimState::new(device_count, true))),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl FalconComm for SimulatedFalcon {
    fn device_count(&mut self) -> Result<usize> {
        Ok(self.state.lock().device_count)
    }

    fn open(&mut self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        if index >= state.device_count {
            return Err(FalconError::DeviceNotFound {
                index,
                count: state.device_count,
            });
        }
        state.open = true;
        state.mode = if state.firmware_loaded {
            Mode::Running
        } else {
            Mode::Idle
        };
        state.rx.clear();
        state.partial.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let state = self.state.lock();
        if !state.open {
            return Err(FalconError::NotOpen);
        }
        Ok(state.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(FalconError::NotOpen);
        }
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(FalconError::NotOpen);
        }
        state.receive(data);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.state.lock().set_baud_rate(baud_rate);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.lock().rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.lock().set_dtr(level);
        Ok(())
    }
}
