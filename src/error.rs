use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FalconError>;

/// Falconとの通信で発生したエラーを表す．
#[derive(Debug, Error)]
pub enum FalconError {
    /// 指定した番号のFalconが見つからない．
    #[error("Falcon #{index} not found ({count} device(s) attached)")]
    DeviceNotFound { index: usize, count: usize },
    /// デバイスを開く前に入出力を要求した．
    #[error("Device is not open")]
    NotOpen,
    /// シリアルポートの列挙，オープン，設定で発生したエラー．
    #[error(transparent)]
    SerialPort(#[from] serialport::Error),
    /// デバイスとのI/Oで発生したエラー．
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// デバイスから受信したデータサイズが期待されるサイズと一致しない．
    #[error("The driver should read {expected} bytes from the device, but actually {actual} bytes read")]
    ShortRead { expected: usize, actual: usize },
    /// デバイスに送信したデータサイズが期待されるサイズと一致しない．
    #[error("The driver should write {expected} bytes to the device, but actually {actual} bytes written")]
    ShortWrite { expected: usize, actual: usize },
    /// ファームウェアファイルを読み込めない．
    #[error("Cannot read firmware file {path:?}")]
    FirmwareFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// ファームウェア書き込みモードへの切り替えにブートローダが応答しない．
    #[error("Bootloader did not answer the firmware mode handshake")]
    FirmwareHandshake,
    /// ブートローダから返ってきたファームウェアのバイトが送信したものと異なる．
    #[error("Firmware checksum mismatch at byte {offset}")]
    ChecksumMismatch { offset: usize },
    /// ファームウェアが動作していない．
    #[error("Firmware did not load correctly")]
    FirmwareNotLoaded,
    /// 送信した指令に対する応答がまだ届いていない．
    #[error("No reply to the last command yet")]
    NoResponse,
    /// 連続して失敗したI/Oサイクルが上限に達した．
    #[error("I/O cycle failed {attempts} times in a row")]
    RetriesExhausted { attempts: u32 },
}

impl FalconError {
    /// 次のI/Oサイクルで回復しうるエラーであれば`true`を返す．
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FalconError::NoResponse | FalconError::ShortRead { .. } | FalconError::ShortWrite { .. }
        ) || matches!(self, FalconError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(FalconError::NoResponse.is_transient());
        assert!(FalconError::ShortRead { expected: 16, actual: 3 }.is_transient());
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        assert!(FalconError::from(timeout).is_transient());
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!FalconError::NotOpen.is_transient());
        assert!(!FalconError::FirmwareNotLoaded.is_transient());
        assert!(!FalconError::DeviceNotFound { index: 0, count: 0 }.is_transient());
    }

    #[test]
    fn messages_name_the_sizes() {
        let err = FalconError::ShortWrite { expected: 16, actual: 4 };
        assert_eq!(
            err.to_string(),
            "The driver should write 16 bytes to the device, but actually 4 bytes written"
        );
    }
}
