// ulib/src/syscall.rs
//
// syscall ラッパ。番号と引数の並びは exo_kernel::types::sysno と TrapFrame::syscall_args に合わせる
// （rax = 番号、rdx, rcx, rbx, rdi, rsi = 引数）。

use exo_kernel::error::{reg_to_result, KResult};
use exo_kernel::mem::paging::PageFlags;
use exo_kernel::types::{sysno, EnvId, EnvStatus, SyscallRegs};

use crate::Context;

fn call(ctx: &mut dyn Context, no: u64, args: [u64; 5]) -> KResult<i32> {
    reg_to_result(ctx.syscall(no, args).rax)
}

pub fn cputs(ctx: &mut dyn Context, va: u64, len: usize) -> KResult<()> {
    call(ctx, sysno::CPUTS, [va, len as u64, 0, 0, 0]).map(drop)
}

/// 入力が無ければ 0
pub fn cgetc(ctx: &mut dyn Context) -> i32 {
    call(ctx, sysno::CGETC, [0; 5]).unwrap_or(0)
}

pub fn getenvid(ctx: &mut dyn Context) -> EnvId {
    EnvId(ctx.syscall(sysno::GETENVID, [0; 5]).rax as u32 as i32)
}

pub fn env_destroy(ctx: &mut dyn Context, env: EnvId) -> KResult<()> {
    call(ctx, sysno::ENV_DESTROY, [env.to_reg(), 0, 0, 0, 0]).map(drop)
}

pub fn page_alloc(ctx: &mut dyn Context, env: EnvId, va: u64, perm: PageFlags) -> KResult<()> {
    call(ctx, sysno::PAGE_ALLOC, [env.to_reg(), va, perm.bits(), 0, 0]).map(drop)
}

pub fn page_map(
    ctx: &mut dyn Context,
    src_env: EnvId,
    src_va: u64,
    dst_env: EnvId,
    dst_va: u64,
    perm: PageFlags,
) -> KResult<()> {
    call(
        ctx,
        sysno::PAGE_MAP,
        [src_env.to_reg(), src_va, dst_env.to_reg(), dst_va, perm.bits()],
    )
    .map(drop)
}

pub fn page_unmap(ctx: &mut dyn Context, env: EnvId, va: u64) -> KResult<()> {
    call(ctx, sysno::PAGE_UNMAP, [env.to_reg(), va, 0, 0, 0]).map(drop)
}

/// 親には子の id、子には EnvId(0) が返る
pub fn exofork(ctx: &mut dyn Context) -> KResult<EnvId> {
    call(ctx, sysno::EXOFORK, [0; 5]).map(EnvId)
}

pub fn env_set_status(ctx: &mut dyn Context, env: EnvId, status: EnvStatus) -> KResult<()> {
    call(ctx, sysno::ENV_SET_STATUS, [env.to_reg(), status as u64, 0, 0, 0]).map(drop)
}

pub fn env_set_trapframe(ctx: &mut dyn Context, env: EnvId, tf_va: u64) -> KResult<()> {
    call(ctx, sysno::ENV_SET_TRAPFRAME, [env.to_reg(), tf_va, 0, 0, 0]).map(drop)
}

/// upcall = 0 で解除
pub fn env_set_pgfault_upcall(ctx: &mut dyn Context, env: EnvId, upcall: u64) -> KResult<()> {
    call(ctx, sysno::ENV_SET_PGFAULT_UPCALL, [env.to_reg(), upcall, 0, 0, 0]).map(drop)
}

pub fn yield_now(ctx: &mut dyn Context) {
    ctx.syscall(sysno::YIELD, [0; 5]);
}

pub fn ipc_try_send(ctx: &mut dyn Context, env: EnvId, value: u32, src_va: u64, perm: PageFlags) -> KResult<()> {
    call(
        ctx,
        sysno::IPC_TRY_SEND,
        [env.to_reg(), value as u64, src_va, perm.bits(), 0],
    )
    .map(drop)
}

/// 成功時は受信内容の載ったレジスタをそのまま返す
pub fn ipc_recv(ctx: &mut dyn Context, dst_va: u64) -> KResult<SyscallRegs> {
    let regs = ctx.syscall(sysno::IPC_RECV, [dst_va, 0, 0, 0, 0]);
    reg_to_result(regs.rax).map(|_| regs)
}
