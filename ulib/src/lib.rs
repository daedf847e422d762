// ulib/src/lib.rs
//
// exo-kernel の上で動く user ライブラリ。
//
// 役割:
// - syscall の薄いラッパ、user レベル page fault handler、copy-on-write fork、IPC ヘルパ
//
// 設計方針:
// - 「CPU とメモリ」を Context trait の向こうに置く。
//   - 実機: native::Native（int 0x30、UVPT を直接読む、upcall trampoline は global_asm）
//   - host: hosted::SimEnv（exo_kernel::hosted::Machine の 1 環境として振る舞う）
// - 方針（どのページを COW にするか等）はすべてここにあり、kernel はプリミティブだけを持つ。

#![cfg_attr(target_os = "none", no_std)]

pub mod fork;
pub mod ipc;
pub mod pgfault;
pub mod syscall;

#[cfg(target_os = "none")]
pub mod native;

#[cfg(not(target_os = "none"))]
pub mod hosted;

pub use exo_kernel::error::{Error, KResult};
pub use exo_kernel::mem::paging::PageFlags;
pub use exo_kernel::types::{EnvId, EnvStatus, SyscallRegs, UTrapframe};

pub use pgfault::PgfaultHandler;

/// user 環境から見た実行環境
pub trait Context {
    /// int 0x30。戻ったときの rax / rdx / rcx / rbx
    fn syscall(&mut self, no: u64, args: [u64; 5]) -> SyscallRegs;

    /// 自分のアドレス空間から 8 byte 読む（UVPT 窓の参照に使う）
    fn read_word(&mut self, va: u64) -> u64;

    /// src ページの中身を dst ページへ写す（どちらもページ境界）
    fn copy_page(&mut self, dst: u64, src: u64);

    /// 診断メッセージを console に出す
    fn puts(&mut self, msg: &str);

    /// kernel に登録する upcall 入口のアドレス
    fn upcall_entry(&self) -> u64;

    fn handler(&self) -> Option<PgfaultHandler>;
    fn set_handler(&mut self, handler: PgfaultHandler);

    fn thisenv(&self) -> Option<EnvId>;
    fn set_thisenv(&mut self, id: EnvId);
}
