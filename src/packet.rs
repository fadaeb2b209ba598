//! Novint SDKファームウェアが用いるパケット形式．
//!
//! ホストとFalconは16バイトの印字可能なフレームを交互にやりとりする．
//! 1フレーム送信すると1フレーム返ってくる．
//!
//! ```text
//! <gggghhhhiiiijk>   ホスト -> Falcon
//! <mmmmnnnnoooopq>   Falcon -> ホスト
//! ```
//!
//! - `<`, `>`: フレームの先頭と末尾．
//! - `g`..`i`: 3つのモータへのトルク指令．下位ニブルから順に4ニブル．
//! - `j`: LEDとホーミングモードの指令．
//! - `m`..`o`: 3つのエンコーダ値．下位ニブルから順に4ニブル．
//! - `p`: 下位ニブルがグリップのボタン，上位ニブルが各軸のホーミング完了フラグ．
//! - `k`, `q`: 未使用．
//!
//! ペイロードの各バイトはニブル値に`'A'`(0x41)を足した値になっている．

use std::ops::{BitOr, BitOrAssign};
use tracing::warn;

/// フレームのバイト数．
pub const PACKET_SIZE: usize = 16;
/// フレームの先頭バイト．
pub const PACKET_START: u8 = b'<';
/// フレームの末尾バイト．
pub const PACKET_END: u8 = b'>';
/// ニブル値を印字可能文字に変換する際のオフセット．
const NIBBLE_OFFSET: u8 = b'A';
/// 制御バイト(LED，ボタン，ホーミング)の位置．
const CONTROL_INDEX: usize = 13;
/// ホーミングモードを有効にするビット．
const HOMING_MODE_BIT: u8 = 0x01;

/// FalconのLED状態．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Leds(u8);

impl Leds {
    pub const OFF: Leds = Leds(0x0);
    pub const GREEN: Leds = Leds(0x2);
    pub const BLUE: Leds = Leds(0x4);
    pub const RED: Leds = Leds(0x8);

    /// 生の値から作る．LED以外のビットは捨てる．
    pub const fn from_bits(bits: u8) -> Leds {
        Leds(bits & 0x0e)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Leds) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Leds {
    type Output = Leds;

    fn bitor(self, rhs: Self) -> Self::Output {
        Leds(self.0 | rhs.0)
    }
}

impl BitOrAssign for Leds {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// グリップのボタン押下状態．
/// 正面から見て，右端が`0x1`，中央(前)が`0x2`，中央(円)が`0x4`，左端が`0x8`．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Buttons(u8);

impl Buttons {
    pub const RIGHT: Buttons = Buttons(0x1);
    pub const FORWARD: Buttons = Buttons(0x2);
    pub const CIRCLE: Buttons = Buttons(0x4);
    pub const LEFT: Buttons = Buttons(0x8);

    pub const fn from_bits(bits: u8) -> Buttons {
        Buttons(bits & 0x0f)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_pressed(self, button: Buttons) -> bool {
        self.0 & button.0 == button.0 && button.0 != 0
    }
}

/// 各軸のホーミングが完了しているか．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct HomingStatus(u8);

impl HomingStatus {
    pub const fn from_bits(bits: u8) -> HomingStatus {
        HomingStatus(bits & 0x07)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `axis`番目(0..3)の軸がホーミング済みか．
    pub fn is_homed(self, axis: usize) -> bool {
        axis < 3 && self.0 & (1 << axis) != 0
    }

    pub fn all_homed(self) -> bool {
        self.0 == 0x07
    }
}

/// ホストからFalconへの指令．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPacket {
    /// 各モータへのトルク指令値．
    pub torques: [i16; 3],
    pub leds: Leds,
    pub homing: bool,
}

impl CommandPacket {
    /// 送信用のフレームに変換する．
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut frame = [0; PACKET_SIZE];
        for (axis, &torque) in self.torques.iter().enumerate() {
            let start = 1 + axis * 4;
            let value = torque as u16;
            for nibble in 0..4 {
                frame[start + nibble] = ((value >> (nibble * 4)) & 0x0f) as u8;
            }
        }
        frame[CONTROL_INDEX] = self.leds.bits();
        if self.homing {
            frame[CONTROL_INDEX] |= HOMING_MODE_BIT;
        }
        for byte in &mut frame[1..PACKET_SIZE - 1] {
            *byte += NIBBLE_OFFSET;
        }
        frame[0] = PACKET_START;
        frame[PACKET_SIZE - 1] = PACKET_END;
        frame
    }

    /// 受信したフレームを指令として解釈する．シミュレータ用．
    pub fn decode(frame: &[u8; PACKET_SIZE]) -> Option<CommandPacket> {
        if !is_framed(frame) {
            return None;
        }
        let control = frame[CONTROL_INDEX].wrapping_sub(NIBBLE_OFFSET);
        Some(CommandPacket {
            torques: decode_words(frame),
            leds: Leds::from_bits(control),
            homing: control & HOMING_MODE_BIT != 0,
        })
    }
}

/// Falconからホストへの状態報告．
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusPacket {
    pub encoders: [i16; 3],
    pub buttons: Buttons,
    pub homed: HomingStatus,
}

impl StatusPacket {
    pub fn decode(frame: &[u8; PACKET_SIZE]) -> Option<StatusPacket> {
        if !is_framed(frame) {
            return None;
        }
        let control = frame[CONTROL_INDEX].wrapping_sub(NIBBLE_OFFSET);
        Some(StatusPacket {
            encoders: decode_words(frame),
            buttons: Buttons::from_bits(control),
            homed: HomingStatus::from_bits(control >> 4),
        })
    }

    /// 送信用のフレームに変換する．シミュレータ用．
    /// ホーミングフラグは制御バイトの上位ニブルに載るため，その文字は`'P'`を超えうる．
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let command = CommandPacket {
            torques: self.encoders,
            ..CommandPacket::default()
        };
        let mut frame = command.encode();
        let control = self.buttons.bits() | (self.homed.bits() << 4);
        frame[CONTROL_INDEX] = control.wrapping_add(NIBBLE_OFFSET);
        frame
    }
}

fn is_framed(frame: &[u8; PACKET_SIZE]) -> bool {
    frame[0] == PACKET_START && frame[PACKET_SIZE - 1] == PACKET_END
}

fn decode_words(frame: &[u8; PACKET_SIZE]) -> [i16; 3] {
    let mut words = [0; 3];
    for (axis, word) in words.iter_mut().enumerate() {
        let start = 1 + axis * 4;
        let value = (0..4).fold(0u16, |acc, nibble| {
            let digit = (frame[start + nibble].wrapping_sub(NIBBLE_OFFSET) & 0x0f) as u16;
            acc | (digit << (nibble * 4))
        });
        *word = value as i16;
    }
    words
}

/// 任意の区切りで届くバイト列からフレームを組み立てる．
#[derive(Debug, Clone)]
pub struct PacketAssembler {
    buffer: [u8; PACKET_SIZE],
    index: usize,
    /// 最後に組み立てが完了したフレーム．
    last_frame: Option<[u8; PACKET_SIZE]>,
    malformed: u64,
}

impl PacketAssembler {
    pub fn new() -> PacketAssembler {
        PacketAssembler {
            buffer: [0; PACKET_SIZE],
            index: 0,
            last_frame: None,
            malformed: 0,
        }
    }

    /// 受信したバイト列を取り込む．
    /// この呼び出しで1つ以上のフレームが完成した場合，最後に完成したものを返す．
    pub fn push(&mut self, bytes: &[u8]) -> Option<StatusPacket> {
        let mut latest = None;
        for &byte in bytes {
            // 次のフレームの先頭まで読み飛ばす
            if self.index == 0 && byte != PACKET_START {
                continue;
            }
            self.buffer[self.index] = byte;
            self.index += 1;
            if self.index < PACKET_SIZE {
                continue;
            }
            self.index = 0;
            match StatusPacket::decode(&self.buffer) {
                Some(packet) => {
                    self.last_frame = Some(self.buffer);
                    latest = Some(packet);
                }
                None => {
                    warn!("Clearing malformed packet!");
                    self.malformed += 1;
                }
            }
        }
        latest
    }

    /// 組み立て途中のデータを捨てる．
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// 最後に受信した完全なフレームを文字列として返す．
    pub fn last_frame(&self) -> Option<String> {
        self.last_frame
            .map(|frame| String::from_utf8_lossy(&frame).into_owned())
    }

    /// これまでに捨てた不正なフレームの数．
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        PacketAssembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_command_is_all_a() {
        let frame = CommandPacket::default().encode();
        assert_eq!(&frame, b"<AAAAAAAAAAAAAA>");
    }

    #[test]
    fn torques_are_sent_low_nibble_first() {
        let command = CommandPacket {
            torques: [0x1234, -1, 0],
            leds: Leds::BLUE,
            homing: true,
        };
        let frame = command.encode();
        assert_eq!(&frame, b"<EDCBPPPPAAAAFA>");
    }

    #[test]
    fn decodes_encoder_example_from_firmware_notes() {
        // 0xFA59 -> -1447
        let frame = *b"<JFKPAAAAAAAAAA>";
        let status = StatusPacket::decode(&frame).unwrap();
        assert_eq!(status.encoders[0], -1447);
    }

    #[test]
    fn decodes_buttons_and_homing() {
        let status = StatusPacket {
            encoders: [100, -200, 300],
            buttons: Buttons::LEFT,
            homed: HomingStatus::from_bits(0x5),
        };
        let decoded = StatusPacket::decode(&status.encode()).unwrap();
        assert_eq!(decoded, status);
        assert!(decoded.buttons.is_pressed(Buttons::LEFT));
        assert!(!decoded.buttons.is_pressed(Buttons::RIGHT));
        assert!(decoded.homed.is_homed(0));
        assert!(!decoded.homed.is_homed(1));
        assert!(decoded.homed.is_homed(2));
        assert!(!decoded.homed.all_homed());
    }

    #[test]
    fn assembler_skips_garbage_before_start() {
        let mut assembler = PacketAssembler::new();
        let frame = StatusPacket::default().encode();
        let mut stream = b"xx>A".to_vec();
        stream.extend_from_slice(&frame);
        assert_eq!(assembler.push(&stream), Some(StatusPacket::default()));
    }

    #[test]
    fn assembler_joins_split_frames() {
        let mut assembler = PacketAssembler::new();
        let status = StatusPacket {
            encoders: [1, 2, 3],
            ..StatusPacket::default()
        };
        let frame = status.encode();
        assert_eq!(assembler.push(&frame[..5]), None);
        assert_eq!(assembler.push(&frame[5..]), Some(status));
        assert_eq!(
            assembler.last_frame(),
            Some(String::from_utf8_lossy(&frame).into_owned())
        );
    }

    #[test]
    fn assembler_drops_unterminated_frame() {
        let mut assembler = PacketAssembler::new();
        let mut bad = StatusPacket::default().encode();
        bad[15] = b'A';
        assert_eq!(assembler.push(&bad), None);
        assert_eq!(assembler.malformed_count(), 1);

        let good = StatusPacket::default().encode();
        assert_eq!(assembler.push(&good), Some(StatusPacket::default()));
    }

    #[test]
    fn assembler_returns_newest_frame() {
        let mut assembler = PacketAssembler::new();
        let first = StatusPacket {
            encoders: [1, 1, 1],
            ..StatusPacket::default()
        };
        let second = StatusPacket {
            encoders: [2, 2, 2],
            ..StatusPacket::default()
        };
        let mut stream = first.encode().to_vec();
        stream.extend_from_slice(&second.encode());
        assert_eq!(assembler.push(&stream), Some(second));
    }
}
