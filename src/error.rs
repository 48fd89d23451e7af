//! 統一エラーハンドリングモジュール
//!
//! - [`StackError`]: TCP/IPスタックが返す結果コード (lwIP 2.x 互換の値)
//! - [`Errno`]: ユーザー操作ごとのPOSIXエラー番号 (newlib の値)
//! - [`Error`]: ソケットファサードのエラー型
//!
//! スタック→errno の変換表は [`StackError::to_errno`] にある。

use core::fmt;

// ============================================================================
// Stack result codes
// ============================================================================

/// スタックの結果コード
///
/// 判別値はスタック側の `err_t` と同一。`Badf` はクローズ済み
/// (PCB が無い) ソケットに対する操作を表す内部コード。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StackError {
    /// メモリ不足
    Mem = -1,
    /// バッファエラー
    Buf = -2,
    /// タイムアウト
    Timeout = -3,
    /// ルーティング不能
    Rte = -4,
    /// 処理中
    InProgress = -5,
    /// 不正な値
    Val = -6,
    /// 操作がブロックする
    WouldBlock = -7,
    /// アドレス使用中
    Use = -8,
    /// 既に接続処理中
    Already = -9,
    /// 既に接続済み
    IsConn = -10,
    /// 未接続
    Conn = -11,
    /// 低レベルnetifエラー
    If = -12,
    /// 接続中断
    Abrt = -13,
    /// 接続リセット
    Rst = -14,
    /// 接続クローズ済み
    Clsd = -15,
    /// 不正な引数
    Arg = -16,
    /// クローズ済みソケット
    Badf = -17,
}

/// スタック操作の結果型エイリアス
pub type StackResult<T> = core::result::Result<T, StackError>;

impl StackError {
    /// 数値コードから変換 (0 = OK は `None`)
    pub const fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -1 => Self::Mem,
            -2 => Self::Buf,
            -3 => Self::Timeout,
            -4 => Self::Rte,
            -5 => Self::InProgress,
            -6 => Self::Val,
            -7 => Self::WouldBlock,
            -8 => Self::Use,
            -9 => Self::Already,
            -10 => Self::IsConn,
            -11 => Self::Conn,
            -12 => Self::If,
            -13 => Self::Abrt,
            -14 => Self::Rst,
            -15 => Self::Clsd,
            -16 => Self::Arg,
            -17 => Self::Badf,
            _ => return None,
        })
    }

    pub const fn code(self) -> i8 {
        self as i8
    }

    /// スタック結果コード → errno 変換表
    pub const fn to_errno(self) -> Errno {
        match self {
            Self::Mem => Errno::ENOMEM,
            Self::Buf => Errno::ENOBUFS,
            Self::Timeout => Errno::EWOULDBLOCK,
            Self::Rte => Errno::EHOSTUNREACH,
            Self::InProgress => Errno::EINPROGRESS,
            Self::Val => Errno::EINVAL,
            Self::WouldBlock => Errno::EWOULDBLOCK,
            Self::Use => Errno::EADDRINUSE,
            Self::Already => Errno::EALREADY,
            Self::IsConn => Errno::EALREADY,
            Self::Conn => Errno::ENOTCONN,
            Self::If => Errno::EIO,
            Self::Abrt => Errno::ECONNABORTED,
            Self::Rst => Errno::ECONNRESET,
            Self::Clsd => Errno::ENOTCONN,
            Self::Arg => Errno::EIO,
            Self::Badf => Errno::EBADF,
        }
    }
}

// ============================================================================
// POSIX errno
// ============================================================================

/// POSIX エラー番号
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EIO = 5,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EEXIST = 17,
    EINVAL = 22,
    EPIPE = 32,
    EOPNOTSUPP = 95,
    ECONNRESET = 104,
    ENOBUFS = 105,
    EAFNOSUPPORT = 106,
    ENOTSOCK = 108,
    ENOPROTOOPT = 109,
    ECONNREFUSED = 111,
    EADDRINUSE = 112,
    ECONNABORTED = 113,
    ENETUNREACH = 114,
    ETIMEDOUT = 116,
    EHOSTUNREACH = 118,
    EINPROGRESS = 119,
    EALREADY = 120,
    EDESTADDRREQ = 121,
    EPROTONOSUPPORT = 123,
    EISCONN = 127,
    ENOTCONN = 128,
}

impl Errno {
    /// newlib では EWOULDBLOCK == EAGAIN
    pub const EWOULDBLOCK: Errno = Errno::EAGAIN;

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::EPERM,
            2 => Self::ENOENT,
            4 => Self::EINTR,
            5 => Self::EIO,
            9 => Self::EBADF,
            11 => Self::EAGAIN,
            12 => Self::ENOMEM,
            17 => Self::EEXIST,
            22 => Self::EINVAL,
            32 => Self::EPIPE,
            95 => Self::EOPNOTSUPP,
            104 => Self::ECONNRESET,
            105 => Self::ENOBUFS,
            106 => Self::EAFNOSUPPORT,
            108 => Self::ENOTSOCK,
            109 => Self::ENOPROTOOPT,
            111 => Self::ECONNREFUSED,
            112 => Self::EADDRINUSE,
            113 => Self::ECONNABORTED,
            114 => Self::ENETUNREACH,
            116 => Self::ETIMEDOUT,
            118 => Self::EHOSTUNREACH,
            119 => Self::EINPROGRESS,
            120 => Self::EALREADY,
            121 => Self::EDESTADDRREQ,
            123 => Self::EPROTONOSUPPORT,
            127 => Self::EISCONN,
            128 => Self::ENOTCONN,
            _ => return None,
        })
    }

    /// 「まだ準備できていない」ことを表すエラーか
    ///
    /// `block_on` はこれらを受け取ると待機に入る。
    pub const fn is_nonblocking(self) -> bool {
        matches!(self, Self::EAGAIN | Self::EINPROGRESS)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::EINTR => "EINTR",
            Self::EIO => "EIO",
            Self::EBADF => "EBADF",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EEXIST => "EEXIST",
            Self::EINVAL => "EINVAL",
            Self::EPIPE => "EPIPE",
            Self::EOPNOTSUPP => "EOPNOTSUPP",
            Self::ECONNRESET => "ECONNRESET",
            Self::ENOBUFS => "ENOBUFS",
            Self::EAFNOSUPPORT => "EAFNOSUPPORT",
            Self::ENOTSOCK => "ENOTSOCK",
            Self::ENOPROTOOPT => "ENOPROTOOPT",
            Self::ECONNREFUSED => "ECONNREFUSED",
            Self::EADDRINUSE => "EADDRINUSE",
            Self::ECONNABORTED => "ECONNABORTED",
            Self::ENETUNREACH => "ENETUNREACH",
            Self::ETIMEDOUT => "ETIMEDOUT",
            Self::EHOSTUNREACH => "EHOSTUNREACH",
            Self::EINPROGRESS => "EINPROGRESS",
            Self::EALREADY => "EALREADY",
            Self::EDESTADDRREQ => "EDESTADDRREQ",
            Self::EPROTONOSUPPORT => "EPROTONOSUPPORT",
            Self::EISCONN => "EISCONN",
            Self::ENOTCONN => "ENOTCONN",
        }
    }
}

// ============================================================================
// Facade error
// ============================================================================

/// ソケットファサードのエラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// OSエラー (errno)
    Os(Errno),
    /// サポートされていない引数 (引数名を保持)
    Unsupported(&'static str),
    /// アドレス文字列の解析失敗
    InvalidAddress,
    /// 索引/名前で見つからない (インターフェース検索など)
    NotFound(&'static str),
}

impl Error {
    /// errno を取り出す (OSエラー以外は `None`)
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Os(e) => Some(*e),
            _ => None,
        }
    }
}

/// ファサードの結果型エイリアス
pub type Result<T> = core::result::Result<T, Error>;

// ===== Display implementations =====

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StackError::Mem => "out of memory",
            StackError::Buf => "buffer error",
            StackError::Timeout => "timeout",
            StackError::Rte => "routing problem",
            StackError::InProgress => "operation in progress",
            StackError::Val => "illegal value",
            StackError::WouldBlock => "operation would block",
            StackError::Use => "address in use",
            StackError::Already => "already connecting",
            StackError::IsConn => "already connected",
            StackError::Conn => "not connected",
            StackError::If => "low-level netif error",
            StackError::Abrt => "connection aborted",
            StackError::Rst => "connection reset",
            StackError::Clsd => "connection closed",
            StackError::Arg => "illegal argument",
            StackError::Badf => "closed socket",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Errno {}] {}", self.code(), self.name())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(e) => write!(f, "OS error: {}", e),
            Error::Unsupported(what) => write!(f, "unsupported {}", what),
            Error::InvalidAddress => write!(f, "invalid address"),
            Error::NotFound(what) => write!(f, "{} not found", what),
        }
    }
}

// ===== From implementations =====

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl From<StackError> for Errno {
    fn from(e: StackError) -> Self {
        e.to_errno()
    }
}

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Os(e.to_errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_errno_table() {
        let table = [
            (StackError::Mem, Errno::ENOMEM),
            (StackError::Buf, Errno::ENOBUFS),
            (StackError::Timeout, Errno::EWOULDBLOCK),
            (StackError::Rte, Errno::EHOSTUNREACH),
            (StackError::InProgress, Errno::EINPROGRESS),
            (StackError::Val, Errno::EINVAL),
            (StackError::WouldBlock, Errno::EWOULDBLOCK),
            (StackError::Use, Errno::EADDRINUSE),
            (StackError::Already, Errno::EALREADY),
            (StackError::IsConn, Errno::EALREADY),
            (StackError::Conn, Errno::ENOTCONN),
            (StackError::If, Errno::EIO),
            (StackError::Abrt, Errno::ECONNABORTED),
            (StackError::Rst, Errno::ECONNRESET),
            (StackError::Clsd, Errno::ENOTCONN),
            (StackError::Arg, Errno::EIO),
            (StackError::Badf, Errno::EBADF),
        ];
        for (err, errno) in table {
            assert_eq!(err.to_errno(), errno, "{:?}", err);
        }
    }

    #[test]
    fn test_stack_code_roundtrip() {
        for code in -17i8..=-1 {
            let err = StackError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert!(StackError::from_code(0).is_none());
        assert!(StackError::from_code(-18).is_none());
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::EWOULDBLOCK, Errno::EAGAIN);
        assert_eq!(Errno::EAGAIN.code(), 11);
        assert_eq!(Errno::EINPROGRESS.code(), 119);
        assert_eq!(Errno::from_code(128), Some(Errno::ENOTCONN));
        assert!(Errno::EAGAIN.is_nonblocking());
        assert!(!Errno::ECONNRESET.is_nonblocking());
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = StackError::Rst.into();
        assert_eq!(err, Error::Os(Errno::ECONNRESET));
        assert_eq!(err.errno(), Some(Errno::ECONNRESET));
    }

    #[test]
    fn test_error_display() {
        let err = Error::Os(Errno::ENOTCONN);
        assert_eq!(format!("{}", err), "OS error: [Errno 128] ENOTCONN");
        assert_eq!(format!("{}", Error::Unsupported("family")), "unsupported family");
    }
}
