// ulib/src/native.rs
//
// 実機の Context: int 0x30 と、kernel が飛んでくる upcall 入口。
//
// upcall 入口（_pgfault_upcall）:
// - 入った時点の rsp は例外スタック上の UTrapframe
// - exo_pgfault_entry(utf) で handler を呼ぶ
// - trap 時点の rip を trap 時点のスタックに 1 word 積み、レジスタと rflags を戻し、
//   そのスタックに切り替えて ret する（再帰 fault 用の 1 word の隙間はここで使われる）

use core::arch::{asm, global_asm};

use exo_kernel::mem::addr::PAGE_SIZE;
use exo_kernel::types::{EnvId, SyscallRegs, UTrapframe};

use crate::pgfault::{self, PgfaultHandler};
use crate::Context;

static HANDLER: spin::Mutex<Option<PgfaultHandler>> = spin::Mutex::new(None);
static THISENV: spin::Mutex<Option<EnvId>> = spin::Mutex::new(None);

/// 実機上の現在の環境
pub struct Native;

pub fn raw_syscall(no: u64, args: [u64; 5]) -> SyscallRegs {
    let rax: u64;
    let rdx: u64;
    let rcx: u64;
    let rbx: u64;
    // Safety: int 0x30 は kernel の syscall ゲート。kernel は rax/rdx/rcx/rbx 以外を保存して戻る
    unsafe {
        asm!(
            "xchg {b}, rbx",
            "int 0x30",
            "xchg {b}, rbx",
            b = inout(reg) args[2] => rbx,
            inout("rax") no => rax,
            inout("rdx") args[0] => rdx,
            inout("rcx") args[1] => rcx,
            in("rdi") args[3],
            in("rsi") args[4],
        );
    }
    SyscallRegs { rax, rdx, rcx, rbx }
}

extern "C" {
    fn _pgfault_upcall();
}

global_asm!(
    r#"
    .global _pgfault_upcall
_pgfault_upcall:
    mov rdi, rsp
    mov rbp, rsp
    and rsp, -16
    call {entry}
    mov rsp, rbp

    mov rax, [rsp + 136]
    mov rbx, [rsp + 152]
    sub rbx, 8
    mov [rbx], rax
    mov [rsp + 152], rbx

    add rsp, 16
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rdx
    pop rcx
    pop rbx
    pop rax

    add rsp, 8
    popfq
    pop rsp
    ret
"#,
    entry = sym exo_pgfault_entry,
);

static_assertions::const_assert_eq!(core::mem::offset_of!(UTrapframe, rip), 136);
static_assertions::const_assert_eq!(core::mem::offset_of!(UTrapframe, rsp), 152);

extern "C" fn exo_pgfault_entry(utf: *const UTrapframe) {
    // Safety: kernel が例外スタック上に書いた UTrapframe を指している
    let utf = unsafe { &*utf };
    pgfault::dispatch(&mut Native, utf);
}

impl Context for Native {
    fn syscall(&mut self, no: u64, args: [u64; 5]) -> SyscallRegs {
        raw_syscall(no, args)
    }

    fn read_word(&mut self, va: u64) -> u64 {
        // Safety: 呼び出し側が上位テーブルの存在を確かめてから読む
        unsafe { core::ptr::read_volatile(va as *const u64) }
    }

    fn copy_page(&mut self, dst: u64, src: u64) {
        // Safety: どちらもマップ済みのページ先頭（dst は書き込み可）
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PAGE_SIZE as usize);
        }
    }

    fn puts(&mut self, msg: &str) {
        let _ = crate::syscall::cputs(self, msg.as_ptr() as u64, msg.len());
    }

    fn upcall_entry(&self) -> u64 {
        _pgfault_upcall as usize as u64
    }

    fn handler(&self) -> Option<PgfaultHandler> {
        *HANDLER.lock()
    }

    fn set_handler(&mut self, handler: PgfaultHandler) {
        *HANDLER.lock() = Some(handler);
    }

    fn thisenv(&self) -> Option<EnvId> {
        *THISENV.lock()
    }

    fn set_thisenv(&mut self, id: EnvId) {
        *THISENV.lock() = Some(id);
    }
}
