// ulib/src/ipc.rs
//
// IPC ヘルパ
// - ipc_send: 相手が受信待ちになるまで yield しながら try_send を繰り返す
// - ipc_recv: 受信して（rdx, rcx, rbx で返ってきた）内容を Received にする

use exo_kernel::error::{Error, KResult};
use exo_kernel::mem::layout::UTOP;
use exo_kernel::mem::paging::PageFlags;
use exo_kernel::types::{EnvId, SyscallRegs};

use crate::syscall::{ipc_try_send, yield_now};
use crate::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    pub from: EnvId,
    pub value: u32,
    /// ページが渡ってこなければ空
    pub perm: PageFlags,
}

impl Received {
    pub fn from_regs(regs: &SyscallRegs) -> Received {
        Received {
            from: EnvId(regs.rcx as u32 as i32),
            value: regs.rdx as u32,
            perm: PageFlags::from_bits_truncate(regs.rbx),
        }
    }
}

/// page が Some ならそこでページを受け取る
pub fn ipc_recv(ctx: &mut dyn Context, page: Option<u64>) -> KResult<Received> {
    let dst = page.unwrap_or(UTOP);
    crate::syscall::ipc_recv(ctx, dst).map(|regs| Received::from_regs(&regs))
}

/// page が Some ならそのページを perm で渡す
pub fn ipc_send(ctx: &mut dyn Context, to: EnvId, value: u32, page: Option<u64>, perm: PageFlags) -> KResult<()> {
    let src = page.unwrap_or(UTOP);
    loop {
        match ipc_try_send(ctx, to, value, src, perm) {
            Ok(()) => return Ok(()),
            Err(Error::IpcNotRecv) => yield_now(ctx),
            Err(e) => return Err(e),
        }
    }
}
