//! Falconとのバイト列通信．
//!
//! FalconはFTDI製USBシリアル変換チップを介して接続される．
//! ファームウェアを書き込む際はブートローダとのハンドシェイクが必要で，その手順は
//! 通信路によらず共通なので`FalconComm`の既定メソッドとして実装している．

use crate::error::{FalconError, Result};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// FalconのUSBベンダID(FTDI)．
pub const FALCON_VENDOR_ID: u16 = 0x0403;
/// FalconのUSBプロダクトID．
pub const FALCON_PRODUCT_ID: u16 = 0xCB48;

/// ブートローダと通信する際のボーレート．
pub const BOOTLOADER_BAUD_RATE: u32 = 9600;
/// ファームウェアを流し込む際のボーレート．
pub const FIRMWARE_BAUD_RATE: u32 = 140_000;
/// ファームウェア起動後の通常通信のボーレート．
pub const NORMAL_BAUD_RATE: u32 = 1_456_312;

/// ブートローダに送る問い合わせ．
pub const BOOTLOADER_QUERY: [u8; 3] = [0x0a, 0x43, 0x0d];
/// 問い合わせに対するブートローダの応答．
pub const BOOTLOADER_REPLY: [u8; 5] = [0x00, 0x0a, 0x44, 0x2c, 0x0d];
/// ファームウェア転送の開始を告げるバイト．
pub const FIRMWARE_START: u8 = b'A';
/// 問い合わせの応答を待つ回数．
const HANDSHAKE_ATTEMPTS: usize = 100;

/// Falconとの通信路．
pub trait FalconComm {
    /// 接続されているFalconの数を返す．
    fn device_count(&mut self) -> Result<usize>;

    /// `index`番目のFalconを開く．
    fn open(&mut self, index: usize) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// 受信済みで読み出し可能なバイト数．
    fn bytes_available(&mut self) -> Result<usize>;

    /// 受信済みのデータを`buf`に読み出し，読み出したバイト数を返す．
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// `data`をすべて送信する．
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// 受信を検出するためにポーリングを繰り返す必要がある通信路か．
    fn requires_poll(&self) -> bool {
        false
    }

    /// `buf`が埋まるまで読み出す．
    /// 読み出しが進まなくなった場合は`ShortRead`を返す．
    fn read_exact_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let count = self.read(&mut buf[filled..])?;
            if count == 0 {
                return Err(FalconError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            filled += count;
        }
        Ok(())
    }

    /// ブートローダとハンドシェイクし，ファームウェアを受け付ける状態にする．
    fn set_firmware_mode(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(FalconError::NotOpen);
        }
        // 9600 baud, 8N1, RTS Low, DTRをLowからHighへ
        self.set_baud_rate(BOOTLOADER_BAUD_RATE)?;
        self.set_rts(false)?;
        self.set_dtr(false)?;
        self.set_dtr(true)?;

        self.write(&BOOTLOADER_QUERY)?;
        let mut reply = [0; BOOTLOADER_REPLY.len()];
        let mut answered = false;
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            match self.read_exact_blocking(&mut reply) {
                Ok(()) if reply == BOOTLOADER_REPLY => {
                    answered = true;
                    break;
                }
                Ok(()) => debug!(attempt, ?reply, "Unexpected bootloader reply"),
                Err(e) if e.is_transient() => debug!(attempt, "Waiting for bootloader: {}", e),
                Err(e) => return Err(e),
            }
        }
        if !answered {
            return Err(FalconError::FirmwareHandshake);
        }

        self.set_dtr(false)?;
        self.set_baud_rate(FIRMWARE_BAUD_RATE)?;
        self.write(&[FIRMWARE_START])?;
        let mut ack = [0; 1];
        self.read_exact_blocking(&mut ack)?;
        debug!(ack = ack[0], "Bootloader ready for firmware");
        Ok(())
    }

    /// ファームウェア起動後の通信設定に戻す．
    fn set_normal_mode(&mut self) -> Result<()> {
        self.set_baud_rate(NORMAL_BAUD_RATE)
    }
}

/// シリアル通信の設定．
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SerialConfig {
    /// シリアル通信の読み取り操作がこの時間経過しても完了していない場合，タイムアウトとなる．
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// OSのシリアルポートドライバ経由でFalconと通信する．
pub struct SerialComm {
    config: SerialConfig,
    /// Falconに接続されたシリアルポート．
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialComm {
    pub fn new(config: SerialConfig) -> SerialComm {
        SerialComm { config, port: None }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or(FalconError::NotOpen)
    }
}

impl Default for SerialComm {
    fn default() -> Self {
        SerialComm::new(SerialConfig::default())
    }
}

/// PCに接続されているデバイスの中からFalconを探し，そのデバイスへのパスを返す．
pub fn falcon_port_paths() -> Vec<PathBuf> {
    serial_ports::ListPorts::new()
        .iter()
        // デバイスのうち，USB接続されているものをみつける
        .filter_map(|port| {
            if let serial_ports::ListPortType::UsbPort(info) = &port.port_type {
                Some((port, info))
            } else {
                None
            }
        })
        // IDがFalconと一致するデバイスをみつける
        .filter(|(_, info)| info.vid == FALCON_VENDOR_ID)
        .filter(|(_, info)| info.pid == FALCON_PRODUCT_ID)
        .map(|(port, _)| port.device.clone())
        .collect()
}

impl FalconComm for SerialComm {
    fn device_count(&mut self) -> Result<usize> {
        Ok(falcon_port_paths().len())
    }

    fn open(&mut self, index: usize) -> Result<()> {
        let paths = falcon_port_paths();
        let count = paths.len();
        let path = paths
            .into_iter()
            .nth(index)
            .ok_or(FalconError::DeviceNotFound { index, count })?;

        let settings = serialport::SerialPortSettings {
            baud_rate: NORMAL_BAUD_RATE,
            data_bits: serialport::DataBits::Eight,
            flow_control: serialport::FlowControl::None,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            timeout: self.config.read_timeout,
        };
        info!(?path, "Opening Falcon");
        let port = serialport::open_with_settings(&path.into_os_string(), &settings)?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed Falcon");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// 応答が届くまでの時間を待たずに`bytes_to_read`が0を返すため，繰り返し確認する．
    fn requires_poll(&self) -> bool {
        true
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let count = self.port_mut()?.bytes_to_read()?;
        Ok(count as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let count = self.port_mut()?.read(buf)?;
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let write_count = self.port_mut()?.write(data)?;
        // 送信できたデータサイズで成否判定
        match write_count {
            c if c == data.len() => Ok(()),
            c => Err(FalconError::ShortWrite {
                expected: data.len(),
                actual: c,
            }),
        }
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port_mut()?.set_baud_rate(baud_rate)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port_mut()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port_mut()?.write_data_terminal_ready(level)?;
        Ok(())
    }
}
