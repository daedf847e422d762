/*!
 * types
 *
 * 役割:
 *   - カーネルと user ライブラリが共有する ABI 型・定数を集約する。
 *
 * やること:
 *   - 環境ハンドル(EnvId) / 状態(EnvStatus) / TrapFrame / UTrapframe のレイアウト
 *   - セグメントセレクタ、trap 番号、syscall 番号
 *
 * やらないこと:
 *   - 状態遷移やページテーブル操作（それは kernel / mem の責務）
 *
 * 設計方針:
 *   - ここの構造体は asm と user 側から raw bytes として読まれるので #[repr(C)] 固定。
 *   - サイズは static_assertions で固定する。
 */

use core::fmt;

/// 同時に扱う CPU 数の上限
pub const NCPU: usize = 8;

pub const LOG2NENV: u32 = 10;
pub const NENV: usize = 1 << LOG2NENV;
pub const ENVGENSHIFT: u32 = 12;

// ─────────────────────────────────────────────
// EnvId / EnvStatus
// ─────────────────────────────────────────────

/// 環境ハンドル。
/// - 下位 LOG2NENV bit がテーブル index、上位が generation。
/// - 0 は「呼び出し元自身」を意味する予約値。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub i32);

impl EnvId {
    pub const CURRENT: EnvId = EnvId(0);

    pub const fn index(self) -> usize {
        (self.0 as u32 as usize) & (NENV - 1)
    }

    pub const fn is_current(self) -> bool {
        self.0 == 0
    }

    /// syscall 引数（u64 レジスタ）からハンドルを取り出す。
    /// i32 を符号拡張した値でなければ None（上位を黙って捨てない）。
    pub const fn from_reg(reg: u64) -> Option<EnvId> {
        let v = reg as i64;
        if v == v as i32 as i64 {
            Some(EnvId(v as i32))
        } else {
            None
        }
    }

    pub const fn to_reg(self) -> u64 {
        self.0 as i64 as u64
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    pub fn from_raw(raw: u64) -> Option<EnvStatus> {
        match raw {
            0 => Some(EnvStatus::Free),
            1 => Some(EnvStatus::Dying),
            2 => Some(EnvStatus::Runnable),
            3 => Some(EnvStatus::Running),
            4 => Some(EnvStatus::NotRunnable),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────
// セグメント / RFLAGS
// ─────────────────────────────────────────────

/// GDT の並び（arch::gdt がこの順で append する）
pub const GD_KT: u16 = 0x08;
pub const GD_KD: u16 = 0x10;
pub const GD_UD: u16 = 0x18;
pub const GD_UT: u16 = 0x20;
pub const GD_TSS0: u16 = 0x28;

pub const RPL_USER: u16 = 3;

pub const FL_RESERVED: u64 = 1 << 1;
pub const FL_IF: u64 = 1 << 9;
pub const FL_IOPL_MASK: u64 = 3 << 12;

// ─────────────────────────────────────────────
// trap 番号
// ─────────────────────────────────────────────

pub const T_DIVIDE: u64 = 0;
pub const T_DEBUG: u64 = 1;
pub const T_NMI: u64 = 2;
pub const T_BRKPT: u64 = 3;
pub const T_OFLOW: u64 = 4;
pub const T_BOUND: u64 = 5;
pub const T_ILLOP: u64 = 6;
pub const T_DEVICE: u64 = 7;
pub const T_DBLFLT: u64 = 8;
pub const T_TSS: u64 = 10;
pub const T_SEGNP: u64 = 11;
pub const T_STACK: u64 = 12;
pub const T_GPFLT: u64 = 13;
pub const T_PGFLT: u64 = 14;
pub const T_FPERR: u64 = 16;
pub const T_ALIGN: u64 = 17;
pub const T_MCHK: u64 = 18;
pub const T_SIMDERR: u64 = 19;

pub const T_SYSCALL: u64 = 0x30;

pub const IRQ_OFFSET: u64 = 32;
pub const IRQ_TIMER: u64 = 0;
pub const IRQ_KBD: u64 = 1;
pub const IRQ_SERIAL: u64 = 4;
pub const IRQ_SPURIOUS: u64 = 7;

bitflags::bitflags! {
    /// #PF のエラーコード
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// 0 = not-present, 1 = protection violation
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

// ─────────────────────────────────────────────
// TrapFrame / UTrapframe
// ─────────────────────────────────────────────

/// trap 入口 stub が push する汎用レジスタ（r15 が最下位アドレス）
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// 環境の保存実行状態。
/// - regs..ds は trap stub、trapno/err は stub（err はハードが積む場合あり）、
///   rip 以降は CPU が積む 64-bit 割り込みフレーム。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u64,
    pub ds: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

static_assertions::assert_eq_size!(PushRegs, [u64; 15]);
static_assertions::assert_eq_size!(TrapFrame, [u64; 24]);

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            regs: PushRegs {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rdi: 0,
                rsi: 0,
                rbp: 0,
                rdx: 0,
                rcx: 0,
                rbx: 0,
                rax: 0,
            },
            es: 0,
            ds: 0,
            trapno: 0,
            err: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// 新しい環境の初期状態（user セグメント、IF=1、スタックは stack_top）
    pub fn new_user(stack_top: u64) -> Self {
        let data = (GD_UD | RPL_USER) as u64;
        TrapFrame {
            es: data,
            ds: data,
            ss: data,
            cs: (GD_UT | RPL_USER) as u64,
            rsp: stack_top,
            rflags: FL_RESERVED | FL_IF,
            ..TrapFrame::zeroed()
        }
    }

    /// user 特権から入った trap か
    pub const fn from_user(&self) -> bool {
        (self.cs & 3) == 3
    }

    /// syscall 番号と引数 5 つ（rax, rdx, rcx, rbx, rdi, rsi）
    pub const fn syscall_args(&self) -> (u64, [u64; 5]) {
        let r = &self.regs;
        (r.rax, [r.rdx, r.rcx, r.rbx, r.rdi, r.rsi])
    }
}

/// syscall から戻ったときに user が見るレジスタ。
/// - rax: 結果（i32 を符号拡張）
/// - rdx / rcx / rbx: ipc_recv の value / from / perm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallRegs {
    pub rax: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
}

impl SyscallRegs {
    pub const fn from_frame(tf: &TrapFrame) -> Self {
        SyscallRegs {
            rax: tf.regs.rax,
            rdx: tf.regs.rdx,
            rcx: tf.regs.rcx,
            rbx: tf.regs.rbx,
        }
    }

    pub const fn ret(&self) -> i64 {
        self.rax as i64 as i32 as i64
    }
}

/// user の page fault handler に渡す fault レコード。
/// - 例外スタック上に置かれ、upcall trampoline はこの並びに依存して復帰する。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: PushRegs,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

static_assertions::assert_eq_size!(UTrapframe, [u64; 20]);

pub const UTRAPFRAME_SIZE: u64 = core::mem::size_of::<UTrapframe>() as u64;

/// 再帰 fault のとき、新しいレコードの下に空ける 1 word
pub const UTRAPFRAME_GAP: u64 = 8;

impl UTrapframe {
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: repr(C) の u64 だけで構成され padding が無い
        unsafe {
            core::slice::from_raw_parts(
                self as *const UTrapframe as *const u8,
                UTRAPFRAME_SIZE as usize,
            )
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<UTrapframe> {
        if bytes.len() < UTRAPFRAME_SIZE as usize {
            return None;
        }
        // Safety: 長さは確認済み、全ビットパターンが有効な型
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const UTrapframe) })
    }
}

// ─────────────────────────────────────────────
// syscall 番号
// ─────────────────────────────────────────────

pub mod sysno {
    pub const CPUTS: u64 = 0;
    pub const CGETC: u64 = 1;
    pub const GETENVID: u64 = 2;
    pub const ENV_DESTROY: u64 = 3;
    pub const PAGE_ALLOC: u64 = 4;
    pub const PAGE_MAP: u64 = 5;
    pub const PAGE_UNMAP: u64 = 6;
    pub const EXOFORK: u64 = 7;
    pub const ENV_SET_STATUS: u64 = 8;
    pub const ENV_SET_TRAPFRAME: u64 = 9;
    pub const ENV_SET_PGFAULT_UPCALL: u64 = 10;
    pub const YIELD: u64 = 11;
    pub const IPC_TRY_SEND: u64 = 12;
    pub const IPC_RECV: u64 = 13;
}
