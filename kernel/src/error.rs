// kernel/src/error.rs
//
// 役割:
// - カーネルが user に返すエラーを 1 つの閉じた enum にまとめる。
//
// やること:
// - Error <-> syscall 戻り値（負の i32）の相互変換
//
// やらないこと:
// - カーネル内部の不変条件違反の表現（それは panic = fail-stop）
//
// 設計方針:
// - 数値は ABI として固定（user ライブラリと共有する）。

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// ハンドルが無効、または権限が無い
    BadEnv = 2,
    /// 引数が不正（未アライン / 範囲外 / 許可外ビット / 不正な status）
    Inval = 3,
    /// 物理ページが尽きた
    NoMem = 4,
    /// 環境テーブルが満杯
    NoFreeEnv = 5,
    /// 相手が ipc_recv 中ではない
    IpcNotRecv = 7,
}

pub type KResult<T> = Result<T, Error>;

impl Error {
    /// syscall の戻り値として返す負のコード
    pub const fn code(self) -> i32 {
        -(self as i32)
    }

    /// 負のコードから Error を復元する（0 以上や未知のコードは None）
    pub fn from_code(code: i32) -> Option<Error> {
        match code {
            -2 => Some(Error::BadEnv),
            -3 => Some(Error::Inval),
            -4 => Some(Error::NoMem),
            -5 => Some(Error::NoFreeEnv),
            -7 => Some(Error::IpcNotRecv),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Error::BadEnv => "bad environment",
            Error::Inval => "invalid parameter",
            Error::NoMem => "out of memory",
            Error::NoFreeEnv => "out of environments",
            Error::IpcNotRecv => "env is not recving",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// syscall 結果を rax に載せる値へ変換する（i32 を符号拡張）
pub fn result_to_reg(r: KResult<i32>) -> u64 {
    let v = match r {
        Ok(v) => v,
        Err(e) => e.code(),
    };
    v as i64 as u64
}

/// rax の値を syscall 結果に戻す（user 側で使う）
pub fn reg_to_result(rax: u64) -> KResult<i32> {
    let v = rax as i64 as i32;
    if v < 0 {
        Err(Error::from_code(v).unwrap_or(Error::Inval))
    } else {
        Ok(v)
    }
}
